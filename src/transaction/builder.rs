//! Proposal builder for constructing valid obligation updates.
//!
//! Usage:
//! ```ignore
//! let proposal = ProposalBuilder::new(me, notary, &vault)
//!     .build(Intent::Settle { obligation_id, pay_amount: 5 })?;
//! ```
//!
//! The builder resolves the consumed version through the vault, derives the
//! produced version and the exact signer set, and runs the contract before
//! returning. Nothing it rejects ever reaches the network.

use std::collections::BTreeSet;

use crate::contract::{self, VerificationError};
use crate::identity::PartyId;
use crate::obligation::{Obligation, ObligationId};
use crate::transaction::{Command, CommandKind, LedgerUpdate, StateAndRef};
use crate::vault::{Vault, VaultError};

/// What the caller wants to happen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    /// Borrow `amount` from `lender`; run by the borrower.
    Issue { amount: u64, lender: PartyId },
    /// Re-assign the obligation to `new_lender`; run by the current lender.
    Transfer {
        obligation_id: ObligationId,
        new_lender: PartyId,
    },
    /// Pay `pay_amount` towards the obligation; run by the borrower.
    Settle {
        obligation_id: ObligationId,
        pay_amount: u64,
    },
}

/// A locally verified candidate update.
#[derive(Clone, Debug)]
pub struct Proposal {
    pub update: LedgerUpdate,
    /// Every party whose signature the command requires
    pub signers: BTreeSet<PartyId>,
}

impl Proposal {
    /// Required signers other than `initiator`.
    pub fn counterparties(&self, initiator: &PartyId) -> Vec<PartyId> {
        self.signers
            .iter()
            .filter(|p| *p != initiator)
            .copied()
            .collect()
    }
}

/// Builder for obligation updates on behalf of one party.
pub struct ProposalBuilder<'a> {
    initiator: PartyId,
    notary: PartyId,
    vault: &'a dyn Vault,
}

impl<'a> ProposalBuilder<'a> {
    pub fn new(initiator: PartyId, notary: PartyId, vault: &'a dyn Vault) -> Self {
        ProposalBuilder {
            initiator,
            notary,
            vault,
        }
    }

    /// Build and verify the update for `intent`.
    pub fn build(&self, intent: Intent) -> Result<Proposal, ProposalError> {
        let (kind, inputs, outputs) = match intent {
            Intent::Issue { amount, lender } => {
                let issued = Obligation::new(amount, lender, self.initiator);
                (CommandKind::Issue, vec![], vec![issued])
            }
            Intent::Transfer {
                obligation_id,
                new_lender,
            } => {
                let current = self.current_version(&obligation_id)?;
                if current.state.lender != self.initiator {
                    return Err(ProposalError::Authorization(
                        "this flow must be run by the current lender".into(),
                    ));
                }
                let moved = current.state.with_new_lender(new_lender);
                (CommandKind::Transfer, vec![current], vec![moved])
            }
            Intent::Settle {
                obligation_id,
                pay_amount,
            } => {
                let current = self.current_version(&obligation_id)?;
                if current.state.borrower != self.initiator {
                    return Err(ProposalError::Authorization(
                        "this flow must be run by the borrower".into(),
                    ));
                }
                let successor = settlement_successor(&current.state, pay_amount)?;
                (CommandKind::Settle, vec![current], successor.into_iter().collect())
            }
        };

        let signers = {
            let consumed: Vec<&Obligation> = inputs.iter().map(|i| &i.state).collect();
            let produced: Vec<&Obligation> = outputs.iter().collect();
            contract::required_signers(kind, &consumed, &produced)
        };

        let update = LedgerUpdate {
            inputs,
            outputs,
            commands: vec![Command::new(kind, signers.iter().copied())],
            notary: self.notary,
        };
        contract::verify(&update)?;

        tracing::debug!(
            update = %update.id(),
            action = %kind,
            signers = signers.len(),
            "built proposal"
        );
        Ok(Proposal { update, signers })
    }

    fn current_version(&self, id: &ObligationId) -> Result<StateAndRef, ProposalError> {
        self.vault
            .find_current_version(id)?
            .ok_or(ProposalError::NotFound(*id))
    }
}

/// Successor version after paying `pay_amount`; `None` once fully settled.
fn settlement_successor(
    current: &Obligation,
    pay_amount: u64,
) -> Result<Option<Obligation>, ProposalError> {
    if pay_amount == 0 {
        return Err(ProposalError::InvalidPayment(
            "the pay amount must be positive".into(),
        ));
    }
    let outstanding = current.outstanding();
    if pay_amount > outstanding {
        return Err(ProposalError::InvalidPayment(format!(
            "paying {pay_amount} exceeds the outstanding {outstanding}"
        )));
    }
    let next = current
        .pay(pay_amount)
        .ok_or_else(|| ProposalError::InvalidPayment("arithmetic overflow in paid amount".into()))?;
    // Paying off the remainder closes the obligation.
    Ok((!next.is_fully_paid()).then_some(next))
}

/// Errors raised before any signature is requested.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("not authorised: {0}")]
    Authorization(String),
    #[error("invalid payment: {0}")]
    InvalidPayment(String),
    #[error("obligation {0} has no current version in the vault")]
    NotFound(ObligationId),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Vault(#[from] VaultError),
}
