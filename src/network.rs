//! Protocol messages and the transport interface between parties.
//!
//! Every proposal message carries the complete candidate update (consumed
//! references and records, produced records, command and signer set) plus
//! the signatures collected so far, so a receiver never has to trust or look
//! up anything the sender did not send.
//!
//! Delivery is request/response: [`Transport::send`] returns the peer's reply
//! or fails within the given timeout. Sessions are independent of each other.
//! [`memory`] provides the in-process transport used by nodes and tests.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::PartyId;
use crate::transaction::{SignedUpdate, UpdateId, UpdateSignature};

/// Protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Signature collection ──
    /// Candidate update with the initiator's signature, for the receiver to
    /// verify and sign
    ProposeUpdate(Box<SignedUpdate>),

    /// The receiver's signature over the proposed update
    UpdateSigned(UpdateSignature),

    /// The receiver refused to sign; `reason` is its verifier's verdict
    UpdateRejected { reason: String },

    // ── Finality ──
    /// A notarised update for the receiver to verify and store
    FinalizedUpdate(Box<SignedUpdate>),

    /// The receiver stored the finalised update
    Acknowledged(UpdateId),

    /// The receiver could not process the request
    Error(String),
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ProposeUpdate(_) => "ProposeUpdate",
            Message::UpdateSigned(_) => "UpdateSigned",
            Message::UpdateRejected { .. } => "UpdateRejected",
            Message::FinalizedUpdate(_) => "FinalizedUpdate",
            Message::Acknowledged(_) => "Acknowledged",
            Message::Error(_) => "Error",
        }
    }
}

/// Transport errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
    #[error("malformed message")]
    Malformed,
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u32),
    #[error("no route to party {0}")]
    UnknownPeer(PartyId),
    #[error("party {0} is unreachable")]
    Unreachable(PartyId),
    #[error("party {0} did not respond in time")]
    Timeout(PartyId),
}

/// Point-to-point request/response delivery between parties.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The party this transport sends on behalf of.
    fn local_party(&self) -> PartyId;

    /// Send `msg` to `to` and wait at most `timeout` for the reply.
    async fn send(
        &self,
        to: &PartyId,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;
}

/// Size-limited bincode config used for both serialization and deserialization.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 4 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 4 * 1024 * 1024 }>()
}

/// Serialize a message to bytes (length-prefixed).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, TransportError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(TransportError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a length-prefixed message.
///
/// Rejects messages whose declared length exceeds `MAX_NETWORK_MESSAGE_BYTES`
/// and anything that does not decode to a known message, including unknown
/// variants.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let msg = Message::UpdateRejected {
            reason: "paid must increase in case of part settlement".into(),
        };
        let bytes = encode_message(&msg).unwrap();
        match decode_message(&bytes) {
            Some(Message::UpdateRejected { reason }) => {
                assert_eq!(reason, "paid must increase in case of part settlement")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_truncated() {
        let bytes = encode_message(&Message::Acknowledged(UpdateId([1u8; 32]))).unwrap();
        assert!(decode_message(&bytes[..bytes.len() - 1]).is_none());
        assert!(decode_message(&bytes[..3]).is_none());
    }

    #[test]
    fn decode_rejects_oversized_length_prefix() {
        let mut bytes = ((crate::constants::MAX_NETWORK_MESSAGE_BYTES + 1) as u32)
            .to_le_bytes()
            .to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(decode_message(&bytes).is_none());
    }

    #[test]
    fn decode_rejects_unknown_variant() {
        // Variant index far beyond the enum.
        let mut payload = 99u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        let mut bytes = (payload.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        assert!(decode_message(&bytes).is_none());
    }

    #[test]
    fn message_kind_names() {
        assert_eq!(Message::Error("x".into()).kind(), "Error");
        assert_eq!(
            Message::Acknowledged(UpdateId([0u8; 32])).kind(),
            "Acknowledged"
        );
    }
}
