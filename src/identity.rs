//! Party identities.
//!
//! A party is known to the ledger only by [`PartyId`], the fingerprint of its
//! signing key. Resolving an id back to a verifiable key is delegated to an
//! [`IdentityResolver`]; [`IdentityDirectory`] is the in-process network map
//! used by nodes and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::SigningPublicKey;
use crate::Hash;

/// Opaque, comparable identity reference (fingerprint of a signing key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId(pub Hash);

impl PartyId {
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartyId({self})")
    }
}

/// Comma-separated short ids, for error messages.
pub fn join_parties<'a>(parties: impl IntoIterator<Item = &'a PartyId>) -> String {
    parties
        .into_iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A named participant and its signing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub public_key: SigningPublicKey,
}

impl Party {
    pub fn new(name: impl Into<String>, public_key: SigningPublicKey) -> Self {
        Party {
            name: name.into(),
            public_key,
        }
    }

    pub fn id(&self) -> PartyId {
        PartyId(self.public_key.fingerprint())
    }
}

/// Resolves identity references to the keys their signatures verify against.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, id: &PartyId) -> Option<SigningPublicKey>;

    /// Human-readable name, for logs only.
    fn name_of(&self, id: &PartyId) -> Option<String> {
        let _ = id;
        None
    }
}

/// In-memory identity directory shared by every node of a local network.
#[derive(Default)]
pub struct IdentityDirectory {
    parties: RwLock<HashMap<PartyId, Party>>,
}

impl IdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a party, returning its id. Re-registering replaces the entry.
    pub fn register(&self, party: Party) -> PartyId {
        let id = party.id();
        self.parties
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, party);
        id
    }

    pub fn party(&self, id: &PartyId) -> Option<Party> {
        self.parties
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl IdentityResolver for IdentityDirectory {
    fn resolve(&self, id: &PartyId) -> Option<SigningPublicKey> {
        self.party(id).map(|p| p.public_key)
    }

    fn name_of(&self, id: &PartyId) -> Option<String> {
        self.party(id).map(|p| p.name)
    }
}
