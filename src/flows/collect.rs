//! Signature collection.
//!
//! The initiator opens one session per required counterparty, all running
//! concurrently. Each session ends `Signed` or `Rejected`; the first failure
//! of any kind aborts every other in-flight session and fails the proposal.
//! No automatic retry.
//!
//! Counterparty side: `Proposed -> Verified -> Signed`, or `Rejected` from
//! either of the first two states.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinSet;

use super::{FlowContext, FlowError};
use crate::identity::PartyId;
use crate::network::Message;
use crate::transaction::{LedgerUpdate, SignedUpdate, StateAndRef, UpdateSignature};
use crate::vault::VaultError;

/// Per-counterparty session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Proposed,
    Verified,
    Signed,
    Rejected,
}

impl SessionState {
    /// Legal transitions. The initiator never observes `Verified`, so
    /// `Proposed -> Signed` is allowed directly.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Proposed, Verified)
                | (Proposed, Signed)
                | (Proposed, Rejected)
                | (Verified, Signed)
                | (Verified, Rejected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Proposed => "PROPOSED",
            SessionState::Verified => "VERIFIED",
            SessionState::Signed => "SIGNED",
            SessionState::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// One side of one signing session.
#[derive(Debug)]
pub struct Session {
    pub counterparty: PartyId,
    state: SessionState,
}

impl Session {
    pub fn new(counterparty: PartyId) -> Self {
        Session {
            counterparty,
            state: SessionState::Proposed,
        }
    }

    /// Move to `next`. Illegal transitions are ignored and logged.
    pub fn advance(&mut self, next: SessionState) {
        if !self.state.can_advance_to(next) {
            tracing::error!(
                counterparty = %self.counterparty,
                from = %self.state,
                to = %next,
                "illegal session transition"
            );
            return;
        }
        tracing::debug!(counterparty = %self.counterparty, from = %self.state, to = %next, "session");
        self.state = next;
    }
}

/// Side-policy a counterparty applies after the contract accepts and before
/// it signs.
pub trait SigningPolicy: Send + Sync {
    /// `Err(reason)` refuses to sign.
    fn check(&self, update: &LedgerUpdate, proposer: &PartyId) -> Result<(), String>;
}

/// Signs anything the contract accepts.
pub struct AcceptAll;

impl SigningPolicy for AcceptAll {
    fn check(&self, _update: &LedgerUpdate, _proposer: &PartyId) -> Result<(), String> {
        Ok(())
    }
}

/// Gather a signature from every counterparty, or fail the whole proposal.
pub async fn collect_signatures(
    ctx: &FlowContext,
    signed: SignedUpdate,
    counterparties: &[PartyId],
) -> Result<SignedUpdate, FlowError> {
    let update_id = signed.id();
    let proposal = Arc::new(signed);
    let timeout = ctx.config.session_timeout();

    let mut sessions = JoinSet::new();
    for &party in counterparties {
        let transport = Arc::clone(&ctx.transport);
        let resolver = Arc::clone(&ctx.resolver);
        let proposal = Arc::clone(&proposal);
        sessions.spawn(async move {
            let mut session = Session::new(party);
            let msg = Message::ProposeUpdate(Box::new(proposal.as_ref().clone()));
            let outcome = match transport.send(&party, msg, timeout).await {
                Ok(Message::UpdateSigned(sig)) => {
                    if sig.by != party {
                        Err(FlowError::UnexpectedReply {
                            party,
                            got: "UpdateSigned (wrong signer)",
                        })
                    } else {
                        sig.verify(&update_id, resolver.as_ref())
                            .map(|_| sig)
                            .map_err(FlowError::from)
                    }
                }
                Ok(Message::UpdateRejected { reason }) | Ok(Message::Error(reason)) => {
                    Err(FlowError::CounterpartyRejection { party, reason })
                }
                Ok(other) => Err(FlowError::UnexpectedReply {
                    party,
                    got: other.kind(),
                }),
                Err(e) => Err(FlowError::from(e)),
            };
            match &outcome {
                Ok(_) => session.advance(SessionState::Signed),
                Err(_) => session.advance(SessionState::Rejected),
            }
            outcome
        });
    }

    let mut signatures: Vec<UpdateSignature> = Vec::with_capacity(counterparties.len());
    while let Some(joined) = sessions.join_next().await {
        let outcome = joined.map_err(|e| FlowError::TaskFailed(e.to_string()));
        match outcome.and_then(|r| r) {
            Ok(sig) => signatures.push(sig),
            Err(e) => {
                sessions.abort_all();
                tracing::warn!(update = %update_id, error = %e, "signature collection aborted");
                return Err(e);
            }
        }
    }

    let mut signed = Arc::try_unwrap(proposal).unwrap_or_else(|shared| shared.as_ref().clone());
    for sig in signatures {
        signed.add_signature(sig);
    }
    signed.verify_signatures_except(&[signed.update.notary], ctx.resolver.as_ref())?;
    tracing::info!(
        update = %update_id,
        signatures = signed.signatures.len(),
        "collected all counterparty signatures"
    );
    Ok(signed)
}

/// Counterparty side: verify a proposal independently and sign or reject it.
pub fn handle_proposal(ctx: &FlowContext, from: PartyId, signed: &SignedUpdate) -> Message {
    let update_id = signed.id();
    let mut session = Session::new(from);

    match verify_proposal(ctx, from, signed) {
        Ok(()) => session.advance(SessionState::Verified),
        Err(reason) => {
            session.advance(SessionState::Rejected);
            tracing::warn!(
                update = %update_id,
                proposer = %ctx.name_of(&from),
                %reason,
                "rejected proposal"
            );
            return Message::UpdateRejected { reason };
        }
    }

    if let Err(reason) = ctx.policy.check(&signed.update, &from) {
        session.advance(SessionState::Rejected);
        tracing::warn!(update = %update_id, %reason, "signing policy refused proposal");
        return Message::UpdateRejected { reason };
    }

    let sig = UpdateSignature::sign(&update_id, &ctx.keypair);
    ctx.expect(&signed.update);
    session.advance(SessionState::Signed);
    tracing::info!(update = %update_id, proposer = %ctx.name_of(&from), "signed proposal");
    Message::UpdateSigned(sig)
}

/// Every check a counterparty runs before signing. The error is the reason
/// sent back to the proposer.
fn verify_proposal(ctx: &FlowContext, from: PartyId, signed: &SignedUpdate) -> Result<(), String> {
    let update = &signed.update;
    if update
        .commands
        .iter()
        .any(|c| c.signers.len() > crate::constants::MAX_COMMAND_SIGNERS)
    {
        return Err("command declares too many signers".into());
    }
    update.verify().map_err(|e| e.to_string())?;

    let signers = update.command_signers();
    if !signers.contains(&ctx.me) {
        return Err("this party is not a required signer of the update".into());
    }
    if !signers.contains(&from) {
        return Err("the proposer is not a required signer of the update".into());
    }
    if update.notary != ctx.notary.identity() {
        return Err(format!("unknown notary {}", update.notary));
    }

    // Everyone but the proposer may still be missing; what is attached must verify.
    let not_yet: Vec<PartyId> = signed
        .required_signers()
        .into_iter()
        .filter(|p| *p != from)
        .collect();
    signed
        .verify_signatures_except(&not_yet, ctx.resolver.as_ref())
        .map_err(|e| e.to_string())?;

    for input in &update.inputs {
        check_consumed(ctx, input)?;
    }
    Ok(())
}

/// A participant only signs away the version it holds as current. Other
/// signers (a new lender) may not know the record, but what they do hold
/// must match.
fn check_consumed(ctx: &FlowContext, input: &StateAndRef) -> Result<(), String> {
    let reference = &input.reference;
    let lookup = |e: VaultError| format!("vault lookup failed: {e}");

    if ctx.vault.is_consumed(reference).map_err(lookup)? {
        return Err(format!("consumed record {reference} is already spent"));
    }
    if !input.state.is_participant(&ctx.me) {
        return match ctx.vault.find_by_ref(reference).map_err(lookup)? {
            Some(ours) if ours != input.state => Err(format!(
                "consumed record {reference} does not match the stored version"
            )),
            _ => Ok(()),
        };
    }
    match ctx.vault.find_current_version(&input.state.id).map_err(lookup)? {
        Some(held) if held.reference != *reference => Err(format!(
            "consumed record {reference} is not the current version of obligation {}",
            input.state.id
        )),
        Some(held) if held.state != input.state => Err(format!(
            "consumed record {reference} does not match the stored version"
        )),
        Some(_) => Ok(()),
        None => Err(format!(
            "consumed record {reference} is unknown to this party"
        )),
    }
}
