//! In-process transport.
//!
//! [`MemoryNetwork`] routes encoded messages between parties over bounded
//! tokio channels. Each registered party gets an inbox of [`Envelope`]s; the
//! receiver answers through the envelope's oneshot reply channel. Messages
//! are encoded on send and decoded on receipt, exactly as they would be on a
//! socket.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{decode_message, encode_message, Message, Transport, TransportError};
use crate::identity::PartyId;

/// One inbound request.
pub struct Envelope {
    pub version: u32,
    pub from: PartyId,
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl Envelope {
    /// Decode the carried message, rejecting unsupported protocol versions.
    pub fn message(&self) -> Result<Message, TransportError> {
        if self.version != crate::constants::PROTOCOL_VERSION_ID {
            return Err(TransportError::VersionMismatch(self.version));
        }
        decode_message(&self.payload).ok_or(TransportError::Malformed)
    }

    /// Answer the sender. A sender that already gave up is not an error.
    pub fn respond(self, msg: &Message) {
        match encode_message(msg) {
            Ok(bytes) => {
                if self.reply.send(bytes).is_err() {
                    tracing::debug!(to = %self.from, kind = msg.kind(), "requester went away");
                }
            }
            Err(e) => tracing::error!(to = %self.from, error = %e, "failed to encode reply"),
        }
    }
}

/// Registry of party inboxes.
#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: RwLock<HashMap<PartyId, mpsc::Sender<Envelope>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `party`, returning its transport and inbox.
    pub fn register(self: &Arc<Self>, party: PartyId) -> (MemoryTransport, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(crate::constants::INBOX_CAPACITY);
        self.inboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(party, tx);
        let transport = MemoryTransport {
            local: party,
            network: Arc::clone(self),
        };
        (transport, rx)
    }

    /// Detach `party`; later sends to it fail with `UnknownPeer`.
    pub fn disconnect(&self, party: &PartyId) {
        self.inboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(party);
    }

    fn inbox(&self, party: &PartyId) -> Option<mpsc::Sender<Envelope>> {
        self.inboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(party)
            .cloned()
    }
}

/// A party's handle onto a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: PartyId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_party(&self) -> PartyId {
        self.local
    }

    async fn send(
        &self,
        to: &PartyId,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let inbox = self
            .network
            .inbox(to)
            .ok_or(TransportError::UnknownPeer(*to))?;
        let payload = encode_message(&msg)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            version: crate::constants::PROTOCOL_VERSION_ID,
            from: self.local,
            payload,
            reply: reply_tx,
        };

        let exchange = async {
            inbox
                .send(envelope)
                .await
                .map_err(|_| TransportError::Unreachable(*to))?;
            reply_rx.await.map_err(|_| TransportError::Unreachable(*to))
        };
        let bytes = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(*to))??;
        decode_message(&bytes).ok_or(TransportError::Malformed)
    }
}
