//! In-process network and scripted walkthrough.
//!
//! [`LocalNetwork`] wires parties, a notary, and an identity directory over a
//! [`MemoryNetwork`]. [`run_demo`] uses it to walk one obligation through its
//! whole life: Bob borrows from Alice, Alice sells the debt to Charlie, and
//! Bob pays Charlie back in two instalments.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::{ConcordConfig, FlowConfig};
use crate::crypto::keys::SigningKeypair;
use crate::flows::{AcceptAll, FlowContext, FlowError, SigningPolicy};
use crate::identity::{IdentityDirectory, Party, PartyId};
use crate::network::memory::{MemoryNetwork, MemoryTransport};
use crate::network::Transport;
use crate::node::{load_or_generate_keypair, Node};
use crate::notary::{NotaryService, UniquenessNotary};
use crate::obligation::ObligationId;
use crate::transaction::UpdateId;
use crate::vault::{SledVault, Vault, VaultError};

/// Parties, notary, and routing for a single process.
pub struct LocalNetwork {
    directory: Arc<IdentityDirectory>,
    network: Arc<MemoryNetwork>,
    notary: Arc<dyn NotaryService>,
    config: FlowConfig,
    servers: Vec<JoinHandle<()>>,
}

impl LocalNetwork {
    /// A network with a fresh [`UniquenessNotary`].
    pub fn new(config: FlowConfig) -> Self {
        let directory = Arc::new(IdentityDirectory::new());
        let notary_key = SigningKeypair::generate();
        directory.register(Party::new("Notary", notary_key.public.clone()));
        let notary = Arc::new(UniquenessNotary::new(notary_key, directory.clone()));
        Self::with_notary(config, directory, notary)
    }

    /// A network using `notary`, whose key must already be in `directory`.
    pub fn with_notary(
        config: FlowConfig,
        directory: Arc<IdentityDirectory>,
        notary: Arc<dyn NotaryService>,
    ) -> Self {
        LocalNetwork {
            directory,
            network: MemoryNetwork::new(),
            notary,
            config,
            servers: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Arc<IdentityDirectory> {
        &self.directory
    }

    pub fn memory_network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn notary(&self) -> &Arc<dyn NotaryService> {
        &self.notary
    }

    /// Add a party with a fresh key and an in-memory vault.
    pub fn join_ephemeral(&mut self, name: &str) -> Result<Node, VaultError> {
        let keypair = SigningKeypair::generate();
        let vault = SledVault::open_temporary(PartyId(keypair.public.fingerprint()))?;
        Ok(self.join(name, keypair, Arc::new(vault)))
    }

    /// Add a party and start answering its inbox.
    pub fn join(&mut self, name: &str, keypair: SigningKeypair, vault: Arc<dyn Vault>) -> Node {
        self.attach(name, keypair, vault, Arc::new(AcceptAll), |t| Arc::new(t))
    }

    /// Add an in-memory party that applies `policy` before signing.
    pub fn join_with_policy(
        &mut self,
        name: &str,
        policy: Arc<dyn SigningPolicy>,
    ) -> Result<Node, VaultError> {
        let keypair = SigningKeypair::generate();
        let vault = SledVault::open_temporary(PartyId(keypair.public.fingerprint()))?;
        Ok(self.attach(name, keypair, Arc::new(vault), policy, |t| Arc::new(t)))
    }

    /// Add an in-memory party whose outbound traffic goes through `wrap`.
    pub fn join_with_transport<F>(&mut self, name: &str, wrap: F) -> Result<Node, VaultError>
    where
        F: FnOnce(MemoryTransport) -> Arc<dyn Transport>,
    {
        let keypair = SigningKeypair::generate();
        let vault = SledVault::open_temporary(PartyId(keypair.public.fingerprint()))?;
        Ok(self.attach(name, keypair, Arc::new(vault), Arc::new(AcceptAll), wrap))
    }

    fn attach<F>(
        &mut self,
        name: &str,
        keypair: SigningKeypair,
        vault: Arc<dyn Vault>,
        policy: Arc<dyn SigningPolicy>,
        wrap: F,
    ) -> Node
    where
        F: FnOnce(MemoryTransport) -> Arc<dyn Transport>,
    {
        let id = self
            .directory
            .register(Party::new(name, keypair.public.clone()));
        let (transport, inbox) = self.network.register(id);
        let ctx = FlowContext::new(
            keypair,
            self.directory.clone(),
            wrap(transport),
            vault,
            self.notary.clone(),
            self.config.clone(),
        )
        .with_policy(policy);
        let node = Node::new(name, ctx);
        self.servers.push(node.serve(inbox));
        tracing::debug!(party = %id, name, "joined local network");
        node
    }

    /// Stop every node's inbox loop.
    pub fn shutdown(&mut self) {
        for server in self.servers.drain(..) {
            server.abort();
        }
    }
}

impl Drop for LocalNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Errors from the walkthrough.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("flow failed: {0}")]
    Flow(#[from] FlowError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unexpected(String),
}

/// What the walkthrough did.
#[derive(Clone, Debug)]
pub struct DemoSummary {
    pub obligation: ObligationId,
    pub updates: Vec<UpdateId>,
}

/// Issue, transfer, and settle one obligation across three parties.
pub async fn run_demo(config: &ConcordConfig, amount: u64) -> Result<DemoSummary, DemoError> {
    let mut net = LocalNetwork::new(config.flow.clone());
    let alice = join_party(&mut net, config, "Alice")?;
    let bob = join_party(&mut net, config, "Bob")?;
    let charlie = join_party(&mut net, config, "Charlie")?;
    let mut updates = Vec::new();

    tracing::info!("[1] Bob borrows {} from Alice", amount);
    let issued = bob.issue(amount, alice.id()).await?;
    updates.push(issued.id());
    let obligation = issued
        .update
        .outputs
        .first()
        .map(|o| o.id)
        .ok_or_else(|| DemoError::Unexpected("issue produced no obligation".into()))?;
    log_holdings(&[&alice, &bob, &charlie])?;

    tracing::info!("[2] Alice transfers the obligation to Charlie");
    let transferred = alice.transfer(obligation, charlie.id()).await?;
    updates.push(transferred.id());
    log_holdings(&[&alice, &bob, &charlie])?;

    let first = amount / 2;
    if first > 0 {
        tracing::info!("[3] Bob pays {} to Charlie", first);
        let settled = bob.settle(obligation, first).await?;
        updates.push(settled.id());
        log_holdings(&[&alice, &bob, &charlie])?;
    }

    let outstanding = bob
        .find_obligation(&obligation)?
        .map(|s| s.state.outstanding())
        .ok_or_else(|| DemoError::Unexpected("obligation vanished before final payment".into()))?;
    tracing::info!("[4] Bob pays the remaining {}", outstanding);
    let closed = bob.settle(obligation, outstanding).await?;
    updates.push(closed.id());
    log_holdings(&[&alice, &bob, &charlie])?;

    if bob.find_obligation(&obligation)?.is_some() || charlie.find_obligation(&obligation)?.is_some() {
        return Err(DemoError::Unexpected("obligation still open after full settlement".into()));
    }
    for node in [&alice, &bob, &charlie] {
        node.vault().flush()?;
    }
    tracing::info!(updates = updates.len(), "demo complete");
    Ok(DemoSummary {
        obligation,
        updates,
    })
}

fn join_party(net: &mut LocalNetwork, config: &ConcordConfig, name: &str) -> Result<Node, DemoError> {
    if config.node.ephemeral {
        return Ok(net.join_ephemeral(name)?);
    }
    let dir = config.node.data_path().join(name.to_lowercase());
    let keypair = load_or_generate_keypair(&dir)?;
    let vault = SledVault::open(&dir.join("vault"), PartyId(keypair.public.fingerprint()))?;
    Ok(net.join(name, keypair, Arc::new(vault)))
}

fn log_holdings(nodes: &[&Node]) -> Result<(), VaultError> {
    for node in nodes {
        for held in node.obligations()? {
            tracing::info!(party = node.name(), "    {}", held.state);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_runs_to_completion() {
        let config = ConcordConfig::default();
        let summary = run_demo(&config, 100).await.unwrap();
        assert_eq!(summary.updates.len(), 4);
    }

    #[tokio::test]
    async fn demo_with_persistent_vaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConcordConfig::default();
        config.node.ephemeral = false;
        config.node.data_dir = dir.path().to_string_lossy().into_owned();
        let summary = run_demo(&config, 1).await.unwrap();
        // Nothing to pay in halves: issue, transfer, one full settlement.
        assert_eq!(summary.updates.len(), 3);
        assert!(dir.path().join("alice").join("party.key").exists());
    }
}
