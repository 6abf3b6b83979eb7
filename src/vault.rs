//! Durable store for finalised updates.
//!
//! Provides a `Vault` trait and a sled-backed implementation. A vault keeps
//! every finalised update it receives, plus an index from obligation id to
//! the current unconsumed version for obligations its owner participates in.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::identity::PartyId;
use crate::obligation::{Obligation, ObligationId};
use crate::transaction::{SignedUpdate, StateAndRef, StateRef, UpdateId};

/// Errors from vault operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Ledger-state lookup plus durable storage.
pub trait Vault: Send + Sync {
    /// Store a finalised update and advance the current-version index.
    ///
    /// Idempotent: returns `Ok(false)` if the update was already stored.
    fn persist(&self, update: &SignedUpdate) -> Result<bool, VaultError>;

    /// Current unconsumed version of an obligation, if this vault tracks it.
    fn find_current_version(&self, id: &ObligationId) -> Result<Option<StateAndRef>, VaultError>;

    fn get_update(&self, id: &UpdateId) -> Result<Option<SignedUpdate>, VaultError>;

    /// Whether a stored update has consumed `reference`.
    fn is_consumed(&self, reference: &StateRef) -> Result<bool, VaultError>;

    /// Every unconsumed version this vault tracks.
    fn unconsumed(&self) -> Result<Vec<StateAndRef>, VaultError>;

    fn flush(&self) -> Result<(), VaultError>;

    /// The version stored at `reference`, whether consumed or not.
    fn find_by_ref(&self, reference: &StateRef) -> Result<Option<Obligation>, VaultError> {
        Ok(self
            .get_update(&reference.update_id)?
            .and_then(|u| u.update.outputs.get(reference.index as usize).cloned()))
    }
}

/// Sled-backed vault.
pub struct SledVault {
    owner: PartyId,
    db: sled::Db,
    /// UpdateId -> SignedUpdate
    updates: sled::Tree,
    /// ObligationId -> StateAndRef
    current: sled::Tree,
    /// StateRef key -> consuming UpdateId
    consumed: sled::Tree,
}

impl SledVault {
    /// Open or create a vault at the given path for `owner`.
    pub fn open(path: &std::path::Path, owner: PartyId) -> Result<Self, VaultError> {
        let db = sled::open(path).map_err(|e| VaultError::Io(e.to_string()))?;
        Self::from_db(db, owner)
    }

    /// Open a temporary in-memory vault (for testing and the demo).
    pub fn open_temporary(owner: PartyId) -> Result<Self, VaultError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| VaultError::Io(e.to_string()))?;
        Self::from_db(db, owner)
    }

    fn from_db(db: sled::Db, owner: PartyId) -> Result<Self, VaultError> {
        let updates = db
            .open_tree("updates")
            .map_err(|e| VaultError::Io(e.to_string()))?;
        let current = db
            .open_tree("current")
            .map_err(|e| VaultError::Io(e.to_string()))?;
        let consumed = db
            .open_tree("consumed")
            .map_err(|e| VaultError::Io(e.to_string()))?;
        Ok(SledVault {
            owner,
            db,
            updates,
            current,
            consumed,
        })
    }

    pub fn owner(&self) -> PartyId {
        self.owner
    }

    fn read_current(&self, id: &ObligationId) -> Result<Option<StateAndRef>, VaultError> {
        match self
            .current
            .get(id.0)
            .map_err(|e| VaultError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let state = crate::deserialize(&bytes)
                    .map_err(|e| VaultError::Serialization(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

impl Vault for SledVault {
    fn persist(&self, signed: &SignedUpdate) -> Result<bool, VaultError> {
        let update_id = signed.id();
        let record =
            crate::serialize(signed).map_err(|e| VaultError::Serialization(e.to_string()))?;
        let mut tracked = Vec::new();
        for output in signed.update.outputs_with_refs() {
            if output.state.is_participant(&self.owner) {
                let value = crate::serialize(&output)
                    .map_err(|e| VaultError::Serialization(e.to_string()))?;
                tracked.push((output.state.id, value));
            }
        }

        // All three trees move together or not at all.
        let result = (&self.updates, &self.current, &self.consumed).transaction(
            |(updates, current, consumed)| {
                if updates.get(update_id.0)?.is_some() {
                    return Ok(false);
                }
                for input in &signed.update.inputs {
                    consumed.insert(&input.reference.to_key()[..], &update_id.0[..])?;
                    if let Some(bytes) = current.get(input.state.id.0)? {
                        let held: StateAndRef = crate::deserialize(&bytes).map_err(|e| {
                            ConflictableTransactionError::Abort(VaultError::Serialization(
                                e.to_string(),
                            ))
                        })?;
                        if held.reference == input.reference {
                            current.remove(&input.state.id.0[..])?;
                        }
                    }
                }
                for (id, value) in &tracked {
                    current.insert(&id.0[..], value.as_slice())?;
                }
                updates.insert(&update_id.0[..], record.as_slice())?;
                Ok(true)
            },
        );

        let stored = match result {
            Ok(stored) => stored,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(VaultError::Io(e.to_string())),
        };
        if stored {
            tracing::debug!(owner = %self.owner, update = %update_id, "persisted update");
        }
        Ok(stored)
    }

    fn find_current_version(&self, id: &ObligationId) -> Result<Option<StateAndRef>, VaultError> {
        self.read_current(id)
    }

    fn get_update(&self, id: &UpdateId) -> Result<Option<SignedUpdate>, VaultError> {
        match self
            .updates
            .get(id.0)
            .map_err(|e| VaultError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let update = crate::deserialize(&bytes)
                    .map_err(|e| VaultError::Serialization(e.to_string()))?;
                Ok(Some(update))
            }
            None => Ok(None),
        }
    }

    fn is_consumed(&self, reference: &StateRef) -> Result<bool, VaultError> {
        self.consumed
            .contains_key(reference.to_key())
            .map_err(|e| VaultError::Io(e.to_string()))
    }

    fn unconsumed(&self) -> Result<Vec<StateAndRef>, VaultError> {
        let mut states = Vec::new();
        for entry in self.current.iter() {
            let (_, value) = entry.map_err(|e| VaultError::Io(e.to_string()))?;
            let state = crate::deserialize(&value)
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            states.push(state);
        }
        Ok(states)
    }

    fn flush(&self) -> Result<(), VaultError> {
        self.db
            .flush()
            .map_err(|e| VaultError::Io(e.to_string()))?;
        Ok(())
    }
}
