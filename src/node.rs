//! A participant node.
//!
//! A [`Node`] owns one party's key, vault, and view of the network. It
//! initiates issue/transfer/settle proposals and, through [`Node::serve`],
//! answers the proposals and finalised updates other parties send it.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::keys::SigningKeypair;
use crate::flows::{collect, finality, FlowContext, FlowError};
use crate::identity::PartyId;
use crate::network::memory::Envelope;
use crate::network::Message;
use crate::obligation::ObligationId;
use crate::transaction::builder::{Intent, ProposalBuilder};
use crate::transaction::{SignedUpdate, StateAndRef};
use crate::vault::{Vault, VaultError};

/// Load or generate a persistent party keypair.
///
/// Reads from `data_dir/party.key` if it exists; otherwise generates
/// a new keypair and writes it to that path.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<SigningKeypair, std::io::Error> {
    let key_path = data_dir.join("party.key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        // Format: [pk_len: u32 LE] [pk_bytes] [sk_bytes]
        let Some(len_bytes) = bytes.get(..4) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "key file too short",
            ));
        };
        let mut len = [0u8; 4];
        len.copy_from_slice(len_bytes);
        let pk_len = u32::from_le_bytes(len) as usize;
        if bytes.len() < 4 + pk_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "key file truncated",
            ));
        }
        let pk_bytes = bytes[4..4 + pk_len].to_vec();
        let sk_bytes = bytes[4 + pk_len..].to_vec();
        let keypair = SigningKeypair::from_bytes(pk_bytes, sk_bytes).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid key data")
        })?;
        tracing::info!("Loaded party key: {}", PartyId(keypair.public.fingerprint()));
        Ok(keypair)
    } else {
        std::fs::create_dir_all(data_dir)?;
        let keypair = SigningKeypair::generate();
        let pk_len = (keypair.public.0.len() as u32).to_le_bytes();
        let mut bytes = Vec::with_capacity(4 + keypair.public.0.len() + keypair.secret.0.len());
        bytes.extend_from_slice(&pk_len);
        bytes.extend_from_slice(&keypair.public.0);
        bytes.extend_from_slice(&keypair.secret.0);
        std::fs::write(&key_path, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("Generated party key: {}", PartyId(keypair.public.fingerprint()));
        Ok(keypair)
    }
}

/// One party's node.
#[derive(Clone)]
pub struct Node {
    name: String,
    ctx: FlowContext,
}

impl Node {
    pub fn new(name: impl Into<String>, ctx: FlowContext) -> Self {
        Node {
            name: name.into(),
            ctx,
        }
    }

    pub fn id(&self) -> PartyId {
        self.ctx.me
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &FlowContext {
        &self.ctx
    }

    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.ctx.vault
    }

    /// Unconsumed obligations this party participates in.
    pub fn obligations(&self) -> Result<Vec<StateAndRef>, VaultError> {
        self.ctx.vault.unconsumed()
    }

    pub fn find_obligation(&self, id: &ObligationId) -> Result<Option<StateAndRef>, VaultError> {
        self.ctx.vault.find_current_version(id)
    }

    /// Borrow `amount` from `lender`.
    pub async fn issue(&self, amount: u64, lender: PartyId) -> Result<SignedUpdate, FlowError> {
        self.propose(Intent::Issue { amount, lender }).await
    }

    /// Hand an obligation this party is owed to `new_lender`.
    pub async fn transfer(
        &self,
        obligation_id: ObligationId,
        new_lender: PartyId,
    ) -> Result<SignedUpdate, FlowError> {
        self.propose(Intent::Transfer {
            obligation_id,
            new_lender,
        })
        .await
    }

    /// Pay `pay_amount` towards an obligation this party owes.
    pub async fn settle(
        &self,
        obligation_id: ObligationId,
        pay_amount: u64,
    ) -> Result<SignedUpdate, FlowError> {
        self.propose(Intent::Settle {
            obligation_id,
            pay_amount,
        })
        .await
    }

    /// Build, sign, collect, and finalise one proposal.
    pub async fn propose(&self, intent: Intent) -> Result<SignedUpdate, FlowError> {
        let ctx = &self.ctx;
        let proposal = ProposalBuilder::new(ctx.me, ctx.notary.identity(), ctx.vault.as_ref())
            .build(intent)?;
        let counterparties = proposal.counterparties(&ctx.me);
        let signed = SignedUpdate::new(proposal.update, &ctx.keypair);
        tracing::info!(
            node = %self.name,
            update = %signed.id(),
            counterparties = counterparties.len(),
            "proposing update"
        );

        let signed = collect::collect_signatures(ctx, signed, &counterparties).await?;
        finality::finalize(ctx, signed).await
    }

    /// Submit an already co-signed update to the notary again, typically the
    /// one carried by [`FlowError::NotaryTimeout`].
    pub async fn resubmit(&self, signed: SignedUpdate) -> Result<SignedUpdate, FlowError> {
        finality::finalize(&self.ctx, signed).await
    }

    /// Answer inbound requests until the inbox closes.
    pub fn serve(&self, mut inbox: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let reply = handle_envelope(&ctx, &envelope);
                envelope.respond(&reply);
            }
            tracing::debug!(node = %name, "inbox closed");
        })
    }
}

/// Dispatch one inbound request to the matching flow responder.
pub fn handle_envelope(ctx: &FlowContext, envelope: &Envelope) -> Message {
    let from = envelope.from;
    match envelope.message() {
        Ok(Message::ProposeUpdate(signed)) => collect::handle_proposal(ctx, from, &signed),
        Ok(Message::FinalizedUpdate(signed)) => finality::handle_finalized(ctx, from, &signed),
        Ok(other) => {
            tracing::debug!(from = %from, kind = other.kind(), "unexpected request");
            Message::Error(format!("unexpected {} request", other.kind()))
        }
        Err(e) => {
            tracing::warn!(from = %from, error = %e, "undecodable request");
            Message::Error(e.to_string())
        }
    }
}
