//! Notary service.
//!
//! A notary witnesses the consumption of obligation versions and guarantees
//! that each [`StateRef`] is consumed by at most one update. It never runs
//! the obligation contract. [`UniquenessNotary`] is the in-process reference
//! implementation: a spent-reference index guarded by a single lock, so
//! concurrent requests for the same reference get exactly one winner.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::crypto::keys::SigningKeypair;
use crate::identity::{IdentityResolver, PartyId};
use crate::transaction::{SignatureError, SignedUpdate, StateRef, UpdateId, UpdateSignature};

/// Errors returned by a notary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NotaryError {
    #[error("state {reference} was already consumed by update {consumed_by}")]
    Conflict {
        reference: StateRef,
        consumed_by: UpdateId,
    },
    #[error("update names notary {0}, which is not this notary")]
    WrongNotary(PartyId),
    #[error("submitted consumed references do not match the update's inputs")]
    ConsumedMismatch,
    #[error("signature check failed: {0}")]
    Signatures(#[from] SignatureError),
    #[error("notary unavailable: {0}")]
    Unavailable(String),
}

/// Uniqueness service consumed by the finality flow.
#[async_trait]
pub trait NotaryService: Send + Sync {
    /// The identity whose signature marks an update as notarised.
    fn identity(&self) -> PartyId;

    /// Record `consumed` as spent by `update` and endorse it.
    ///
    /// Re-submitting the same update returns a fresh endorsement; a different
    /// update consuming an already spent reference is a conflict.
    async fn finalize(
        &self,
        consumed: &[StateRef],
        update: &SignedUpdate,
    ) -> Result<UpdateSignature, NotaryError>;
}

/// In-memory single-decision-per-reference notary.
pub struct UniquenessNotary {
    keypair: SigningKeypair,
    id: PartyId,
    resolver: Arc<dyn IdentityResolver>,
    /// StateRef -> update that consumed it
    spent: Mutex<HashMap<StateRef, UpdateId>>,
}

impl UniquenessNotary {
    pub fn new(keypair: SigningKeypair, resolver: Arc<dyn IdentityResolver>) -> Self {
        let id = PartyId(keypair.public.fingerprint());
        UniquenessNotary {
            keypair,
            id,
            resolver,
            spent: Mutex::new(HashMap::new()),
        }
    }

    /// Number of references recorded as spent.
    pub fn spent_count(&self) -> usize {
        self.spent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_spent(&self, reference: &StateRef) -> bool {
        self.spent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(reference)
    }

    fn check_request(
        &self,
        consumed: &[StateRef],
        signed: &SignedUpdate,
    ) -> Result<(), NotaryError> {
        if signed.update.notary != self.id {
            return Err(NotaryError::WrongNotary(signed.update.notary));
        }
        let submitted: BTreeSet<StateRef> = consumed.iter().copied().collect();
        let inputs: BTreeSet<StateRef> = signed.update.input_refs().into_iter().collect();
        if submitted.len() != consumed.len()
            || inputs.len() != signed.update.inputs.len()
            || submitted != inputs
        {
            return Err(NotaryError::ConsumedMismatch);
        }
        signed.verify_signatures_except(&[self.id], self.resolver.as_ref())?;
        Ok(())
    }
}

#[async_trait]
impl NotaryService for UniquenessNotary {
    fn identity(&self) -> PartyId {
        self.id
    }

    async fn finalize(
        &self,
        consumed: &[StateRef],
        signed: &SignedUpdate,
    ) -> Result<UpdateSignature, NotaryError> {
        let update_id = signed.id();
        if let Err(e) = self.check_request(consumed, signed) {
            tracing::warn!(update = %update_id, error = %e, "notary refused update");
            return Err(e);
        }

        {
            let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
            for reference in consumed {
                if let Some(&consumed_by) = spent.get(reference) {
                    if !crate::constant_time_eq(&consumed_by.0, &update_id.0) {
                        tracing::warn!(
                            update = %update_id,
                            reference = %reference,
                            consumed_by = %consumed_by,
                            "double spend rejected"
                        );
                        return Err(NotaryError::Conflict {
                            reference: *reference,
                            consumed_by,
                        });
                    }
                }
            }
            for reference in consumed {
                spent.insert(*reference, update_id);
            }
        }

        tracing::info!(update = %update_id, inputs = consumed.len(), "notarised update");
        Ok(UpdateSignature::sign(&update_id, &self.keypair))
    }
}
