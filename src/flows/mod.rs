//! Multi-party commitment protocol.
//!
//! A proposal moves through two flows:
//! - [`collect`]: fan the candidate out to every required counterparty, each
//!   of which re-verifies it independently and signs or rejects
//! - [`finality`]: have the notary witness the consumed references, then
//!   deliver the notarised update to every participant
//!
//! Both sides of both flows share a [`FlowContext`]. Any failure before the
//! notary endorses an update leaves every vault untouched.

pub mod collect;
pub mod finality;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::config::FlowConfig;
use crate::contract::VerificationError;
use crate::crypto::keys::SigningKeypair;
use crate::identity::{join_parties, IdentityResolver, PartyId};
use crate::network::{Transport, TransportError};
use crate::notary::{NotaryError, NotaryService};
use crate::transaction::builder::ProposalError;
use crate::transaction::{LedgerUpdate, SignatureError, SignedUpdate, StateRef, UpdateId};
use crate::vault::{Vault, VaultError};

pub use collect::{AcceptAll, SessionState, SigningPolicy};

/// The suspension point that ran out of time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Counterparty(PartyId),
    Delivery(PartyId),
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deadline::Counterparty(p) => write!(f, "signature from {p}"),
            Deadline::Delivery(p) => write!(f, "delivery to {p}"),
        }
    }
}

/// Why a proposal failed.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("verification failed: {0}")]
    Verification(VerificationError),
    #[error("not authorised: {0}")]
    Authorization(String),
    #[error("invalid proposal: {0}")]
    Proposal(ProposalError),
    #[error("counterparty {party} rejected the update: {reason}")]
    CounterpartyRejection { party: PartyId, reason: String },
    #[error("timed out waiting for {0}")]
    Timeout(Deadline),
    /// The notary may still have recorded the consumption; resubmitting the
    /// carried update unchanged is answered idempotently.
    #[error("timed out waiting for the notary on update {}", .0.id())]
    NotaryTimeout(Box<SignedUpdate>),
    #[error("notary conflict: state {reference} already consumed by update {consumed_by}")]
    Conflict {
        reference: StateRef,
        consumed_by: UpdateId,
    },
    #[error("notary refused the update: {0}")]
    Notary(NotaryError),
    #[error("signature check failed: {0}")]
    Signatures(#[from] SignatureError),
    #[error("unexpected {got} reply from {party}")]
    UnexpectedReply { party: PartyId, got: &'static str },
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error(
        "update {update} was notarised but not delivered to {}",
        join_parties(.undelivered)
    )]
    Distribution {
        update: UpdateId,
        undelivered: Vec<PartyId>,
    },
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

impl From<ProposalError> for FlowError {
    fn from(e: ProposalError) -> Self {
        match e {
            ProposalError::Verification(v) => FlowError::Verification(v),
            ProposalError::Authorization(reason) => FlowError::Authorization(reason),
            ProposalError::Vault(v) => FlowError::Vault(v),
            other => FlowError::Proposal(other),
        }
    }
}

impl From<NotaryError> for FlowError {
    fn from(e: NotaryError) -> Self {
        match e {
            NotaryError::Conflict {
                reference,
                consumed_by,
            } => FlowError::Conflict {
                reference,
                consumed_by,
            },
            other => FlowError::Notary(other),
        }
    }
}

impl From<TransportError> for FlowError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(party) => FlowError::Timeout(Deadline::Counterparty(party)),
            other => FlowError::Transport(other),
        }
    }
}

/// Services and identity a party runs flows with.
#[derive(Clone)]
pub struct FlowContext {
    pub me: PartyId,
    pub keypair: Arc<SigningKeypair>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub transport: Arc<dyn Transport>,
    pub vault: Arc<dyn Vault>,
    pub notary: Arc<dyn NotaryService>,
    pub policy: Arc<dyn SigningPolicy>,
    pub config: FlowConfig,
    /// Updates this party signed and is waiting to see finalised
    expected: Arc<Mutex<HashMap<UpdateId, Expectation>>>,
}

/// A signature given for an update not yet seen finalised.
struct Expectation {
    consumes: Vec<StateRef>,
    deadline: Instant,
}

impl FlowContext {
    pub fn new(
        keypair: SigningKeypair,
        resolver: Arc<dyn IdentityResolver>,
        transport: Arc<dyn Transport>,
        vault: Arc<dyn Vault>,
        notary: Arc<dyn NotaryService>,
        config: FlowConfig,
    ) -> Self {
        FlowContext {
            me: PartyId(keypair.public.fingerprint()),
            keypair: Arc::new(keypair),
            resolver,
            transport,
            vault,
            notary,
            policy: Arc::new(AcceptAll),
            config,
            expected: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SigningPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Name for logs, falling back to the short id.
    pub fn name_of(&self, party: &PartyId) -> String {
        self.resolver
            .name_of(party)
            .unwrap_or_else(|| party.to_string())
    }

    /// How long a signed update may take to come back finalised: the
    /// initiator's session, notary, and delivery deadlines back to back.
    pub fn expectation_window(&self) -> std::time::Duration {
        self.config.session_timeout() + self.config.notary_timeout() + self.config.delivery_timeout()
    }

    fn expectations(&self) -> std::sync::MutexGuard<'_, HashMap<UpdateId, Expectation>> {
        self.expected.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that this party signed `update`.
    pub(crate) fn expect(&self, update: &LedgerUpdate) {
        let now = Instant::now();
        let mut expected = self.expectations();
        expected.retain(|_, e| e.deadline > now);
        expected.insert(
            update.id(),
            Expectation {
                consumes: update.input_refs(),
                deadline: now + self.expectation_window(),
            },
        );
    }

    pub(crate) fn is_expected(&self, id: &UpdateId) -> bool {
        self.expectations()
            .get(id)
            .is_some_and(|e| e.deadline > Instant::now())
    }

    /// Drop the record for `finalised`, and for every other signed update
    /// that consumed the same references and so can never finalise.
    pub(crate) fn fulfil(&self, finalised: &LedgerUpdate) {
        let id = finalised.id();
        let spent = finalised.input_refs();
        let mut expected = self.expectations();
        let before = expected.len();
        expected.retain(|k, e| *k != id && !e.consumes.iter().any(|r| spent.contains(r)));
        let dropped = before - expected.len();
        if dropped > 1 {
            tracing::debug!(update = %id, superseded = dropped - 1, "dropped superseded signatures");
        }
    }

    /// Number of signed updates still awaiting finality. Expired records
    /// are discarded first.
    pub fn pending_expectations(&self) -> usize {
        let now = Instant::now();
        let mut expected = self.expectations();
        expected.retain(|_, e| e.deadline > now);
        expected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notary_conflict_maps_to_conflict() {
        let reference = StateRef {
            update_id: UpdateId([1u8; 32]),
            index: 0,
        };
        let err: FlowError = NotaryError::Conflict {
            reference,
            consumed_by: UpdateId([2u8; 32]),
        }
        .into();
        assert!(matches!(err, FlowError::Conflict { .. }));
    }

    #[test]
    fn proposal_errors_map_to_taxonomy() {
        let err: FlowError = ProposalError::Authorization("nope".into()).into();
        assert!(matches!(err, FlowError::Authorization(_)));
        let err: FlowError = ProposalError::Verification(VerificationError::SameParty).into();
        assert!(matches!(err, FlowError::Verification(VerificationError::SameParty)));
        let err: FlowError = ProposalError::InvalidPayment("zero".into()).into();
        assert!(matches!(err, FlowError::Proposal(_)));
    }

    #[test]
    fn transport_timeout_maps_to_timeout() {
        let party = PartyId([4u8; 32]);
        let err: FlowError = TransportError::Timeout(party).into();
        assert!(matches!(
            err,
            FlowError::Timeout(Deadline::Counterparty(p)) if p == party
        ));
        assert!(err.to_string().contains("timed out"));
    }
}
