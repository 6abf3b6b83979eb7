//! # Concord
//!
//! Bilateral obligations (IOUs) on a shared ledger without a trusted
//! coordinator:
//! - **Deterministic contract verification**: every participant runs the same
//!   pure rule set over a proposed update and reaches the same verdict
//! - **Multi-party signing**: the initiator fans a candidate update out to every
//!   required counterparty; each re-verifies independently before signing
//! - **Notarised finality**: a notary only guarantees that a consumed record is
//!   spent once; it never inspects business rules
//!
//! Identities, transport, storage, and the notary are consumed through traits
//! (`IdentityResolver`, `Transport`, `Vault`, `NotaryService`). Simple reference
//! implementations are provided so the protocol can run end to end in-process.

pub mod config;
pub mod contract;
pub mod crypto;
pub mod demo;
pub mod flows;
pub mod identity;
pub mod network;
pub mod node;
pub mod notary;
pub mod obligation;
pub mod transaction;
pub mod vault;

/// Protocol constants
pub mod constants {
    /// Current wire protocol version carried in every envelope.
    pub const PROTOCOL_VERSION_ID: u32 = 1;
    /// Maximum encoded network message size (4 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
    /// Maximum number of declared signers on a single command.
    ///
    /// The obligation contract never needs more than three (old lender,
    /// borrower, new lender); the bound only protects decoding.
    pub const MAX_COMMAND_SIGNERS: usize = 16;
    /// Default time a counterparty has to verify and sign a proposal.
    pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
    /// Default time the notary has to reach a decision.
    pub const DEFAULT_NOTARY_TIMEOUT_MS: u64 = 30_000;
    /// Default time a participant has to acknowledge a finalised update.
    pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;
    /// Capacity of each node's inbound message queue.
    pub const INBOX_CAPACITY: usize = 256;
    /// Name of the optional configuration file inside the data directory.
    pub const CONFIG_FILE_NAME: &str = "concord.toml";
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// All Concord domains are ASCII string literals such as
/// `"concord.update.id"`.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// The length comparison is not constant-time; every caller compares
/// fixed-size 32-byte hashes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
///
/// This encoding is also the canonical form hashed into update ids, so it
/// must stay deterministic: no hash maps in serialized types.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES` to prevent OOM
/// from malicious oversized payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
