//! The obligation record.
//!
//! An [`Obligation`] is one debt owed by a borrower to a lender. Records are
//! immutable values: every change produces a new version that carries the
//! same [`ObligationId`], and the previous version is consumed by the update
//! that produced it. Validity rules live in [`crate::contract`], not here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PartyId;
use crate::Hash;

/// Identifier shared by every version of the same logical obligation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObligationId(pub Hash);

impl ObligationId {
    /// Fresh random identifier, assigned once at issuance.
    pub fn random() -> Self {
        ObligationId(rand::random())
    }
}

impl fmt::Display for ObligationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ObligationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObligationId({self})")
    }
}

/// One version of a bilateral obligation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    /// Stable across every version
    pub id: ObligationId,
    /// Amount owed, in the ledger's single currency unit
    pub amount: u64,
    /// Party owed the amount
    pub lender: PartyId,
    /// Party owing the amount
    pub borrower: PartyId,
    /// How much of `amount` has been paid so far
    pub paid: u64,
}

impl Obligation {
    /// A new, unpaid obligation with a fresh id.
    pub fn new(amount: u64, lender: PartyId, borrower: PartyId) -> Self {
        Obligation {
            id: ObligationId::random(),
            amount,
            lender,
            borrower,
            paid: 0,
        }
    }

    /// Parties that must authorise any update consuming this version.
    pub fn participants(&self) -> [PartyId; 2] {
        [self.lender, self.borrower]
    }

    pub fn is_participant(&self, party: &PartyId) -> bool {
        self.lender == *party || self.borrower == *party
    }

    /// Amount still owed.
    pub fn outstanding(&self) -> u64 {
        self.amount.saturating_sub(self.paid)
    }

    pub fn is_fully_paid(&self) -> bool {
        self.paid >= self.amount
    }

    /// Successor version with `amount` added to `paid`.
    ///
    /// Returns `None` on arithmetic overflow. Whether the result is a valid
    /// settlement is for the contract to decide.
    pub fn pay(&self, amount: u64) -> Option<Obligation> {
        let paid = self.paid.checked_add(amount)?;
        Some(Obligation {
            paid,
            ..self.clone()
        })
    }

    /// Successor version owed to `lender` instead.
    pub fn with_new_lender(&self, lender: PartyId) -> Obligation {
        Obligation {
            lender,
            ..self.clone()
        }
    }
}

impl fmt::Display for Obligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "obligation {} ({}/{} paid, lender {}, borrower {})",
            self.id, self.paid, self.amount, self.lender, self.borrower
        )
    }
}
