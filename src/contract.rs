//! The obligation contract.
//!
//! [`verify`] is a pure function of a [`LedgerUpdate`]: the consumed and
//! produced obligation versions, the single action tag, and the declared
//! signer set. Every participant runs it before signing, so it must not
//! consult clocks, storage, or the network. A rejection's `Display` text is
//! the reason shown to the initiator and matched by tests.

use std::collections::BTreeSet;

use crate::identity::{join_parties, PartyId};
use crate::obligation::Obligation;
use crate::transaction::{Command, CommandKind, LedgerUpdate};

/// Why an update was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("unrecognized command: expected exactly one action, found {0}")]
    UnrecognizedCommand(usize),

    // Issue
    #[error("no inputs should be consumed when issuing an obligation")]
    IssueConsumesInputs,
    #[error("only one output should be created when issuing an obligation")]
    IssueOutputCount,
    #[error("a newly issued obligation must have a positive amount")]
    NonPositiveAmount,
    #[error("a newly issued obligation must have nothing paid")]
    IssuedWithPayment,

    // Transfer
    #[error("a transfer should consume exactly one input")]
    TransferInputCount,
    #[error("a transfer should create exactly one output")]
    TransferOutputCount,
    #[error("only the lender property may change")]
    OnlyLenderMayChange,
    #[error("the lender property must change in a transfer")]
    LenderUnchanged,

    // Settle
    #[error("one input should be consumed when settling an obligation")]
    SettleInputCount,
    #[error("no more than one output should be created when settling an obligation")]
    SettleOutputCount,
    #[error("paid must increase in case of part settlement")]
    PaidMustIncrease,
    #[error("only the paid amount can change during part settlement")]
    OnlyPaidMayChange,
    #[error("paid cannot exceed the obligation amount")]
    Overpaid,

    // Any action
    #[error("the lender and borrower cannot have the same identity")]
    SameParty,
    #[error(
        "exact signer set mismatch for {action}: expected [{}], got [{}]",
        join_parties(.expected),
        join_parties(.actual)
    )]
    SignerMismatch {
        action: CommandKind,
        expected: Vec<PartyId>,
        actual: Vec<PartyId>,
    },
}

/// Verify an update against the obligation rules.
pub fn verify(update: &LedgerUpdate) -> Result<(), VerificationError> {
    let command = single_command(update)?;
    let inputs: Vec<&Obligation> = update.inputs.iter().map(|i| &i.state).collect();
    let outputs: Vec<&Obligation> = update.outputs.iter().collect();

    match command.kind {
        CommandKind::Issue => verify_issue(&inputs, &outputs)?,
        CommandKind::Transfer => verify_transfer(&inputs, &outputs)?,
        CommandKind::Settle => verify_settle(&inputs, &outputs)?,
    }

    // Shape checks above guarantee the signer rule has what it needs.
    let expected = required_signers(command.kind, &inputs, &outputs);
    let actual = command.signer_set();
    if expected != actual {
        return Err(VerificationError::SignerMismatch {
            action: command.kind,
            expected: expected.into_iter().collect(),
            actual: actual.into_iter().collect(),
        });
    }
    Ok(())
}

/// The exact signer set an action requires.
///
/// - Issue: the produced record's lender and borrower
/// - Transfer: old lender, borrower, and new lender
/// - Settle: the consumed record's participants
///
/// Records missing for the action contribute nothing; [`verify`] rejects
/// such shapes before comparing signers.
pub fn required_signers(
    kind: CommandKind,
    inputs: &[&Obligation],
    outputs: &[&Obligation],
) -> BTreeSet<PartyId> {
    match kind {
        CommandKind::Issue => outputs
            .first()
            .map(|o| o.participants().into_iter().collect())
            .unwrap_or_default(),
        CommandKind::Transfer => {
            let mut signers: BTreeSet<PartyId> = inputs
                .first()
                .map(|o| o.participants().into_iter().collect())
                .unwrap_or_default();
            if let Some(output) = outputs.first() {
                signers.insert(output.lender);
            }
            signers
        }
        CommandKind::Settle => inputs
            .first()
            .map(|o| o.participants().into_iter().collect())
            .unwrap_or_default(),
    }
}

fn single_command(update: &LedgerUpdate) -> Result<&Command, VerificationError> {
    match update.commands.as_slice() {
        [command] => Ok(command),
        other => Err(VerificationError::UnrecognizedCommand(other.len())),
    }
}

fn verify_issue(inputs: &[&Obligation], outputs: &[&Obligation]) -> Result<(), VerificationError> {
    if !inputs.is_empty() {
        return Err(VerificationError::IssueConsumesInputs);
    }
    let [output] = outputs else {
        return Err(VerificationError::IssueOutputCount);
    };
    if output.amount == 0 {
        return Err(VerificationError::NonPositiveAmount);
    }
    if output.lender == output.borrower {
        return Err(VerificationError::SameParty);
    }
    if output.paid != 0 {
        return Err(VerificationError::IssuedWithPayment);
    }
    Ok(())
}

fn verify_transfer(
    inputs: &[&Obligation],
    outputs: &[&Obligation],
) -> Result<(), VerificationError> {
    let [input] = inputs else {
        return Err(VerificationError::TransferInputCount);
    };
    let [output] = outputs else {
        return Err(VerificationError::TransferOutputCount);
    };
    // Undo the lender change; anything left over is an illegal edit.
    if output.with_new_lender(input.lender) != **input {
        return Err(VerificationError::OnlyLenderMayChange);
    }
    if output.lender == input.lender {
        return Err(VerificationError::LenderUnchanged);
    }
    if output.lender == output.borrower {
        return Err(VerificationError::SameParty);
    }
    Ok(())
}

fn verify_settle(inputs: &[&Obligation], outputs: &[&Obligation]) -> Result<(), VerificationError> {
    let [input] = inputs else {
        return Err(VerificationError::SettleInputCount);
    };
    match outputs {
        // Full settlement: the obligation is closed.
        [] => Ok(()),
        [output] => {
            if output.paid <= input.paid {
                return Err(VerificationError::PaidMustIncrease);
            }
            if output.id != input.id
                || output.amount != input.amount
                || output.lender != input.lender
                || output.borrower != input.borrower
            {
                return Err(VerificationError::OnlyPaidMayChange);
            }
            if output.paid > output.amount {
                return Err(VerificationError::Overpaid);
            }
            Ok(())
        }
        _ => Err(VerificationError::SettleOutputCount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obligation::ObligationId;
    use crate::transaction::{StateAndRef, StateRef, UpdateId};

    fn party(b: u8) -> PartyId {
        PartyId([b; 32])
    }

    const A: u8 = 1;
    const B: u8 = 2;
    const C: u8 = 3;
    const NOTARY: u8 = 9;

    fn consumed(state: Obligation) -> StateAndRef {
        StateAndRef {
            state,
            reference: StateRef {
                update_id: UpdateId([0x55; 32]),
                index: 0,
            },
        }
    }

    fn update(
        inputs: Vec<Obligation>,
        outputs: Vec<Obligation>,
        kind: CommandKind,
        signers: &[u8],
    ) -> LedgerUpdate {
        LedgerUpdate {
            inputs: inputs.into_iter().map(consumed).collect(),
            outputs,
            commands: vec![Command::new(kind, signers.iter().map(|b| party(*b)))],
            notary: party(NOTARY),
        }
    }

    fn iou(amount: u64, paid: u64) -> Obligation {
        Obligation {
            id: ObligationId([7u8; 32]),
            amount,
            lender: party(A),
            borrower: party(B),
            paid,
        }
    }

    #[test]
    fn issue_accepts_valid() {
        let u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[A, B]);
        assert_eq!(verify(&u), Ok(()));
    }

    #[test]
    fn issue_rejects_inputs() {
        let u = update(vec![iou(10, 0)], vec![iou(10, 0)], CommandKind::Issue, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::IssueConsumesInputs));
    }

    #[test]
    fn issue_rejects_zero_amount() {
        let u = update(vec![], vec![iou(0, 0)], CommandKind::Issue, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::NonPositiveAmount));
    }

    #[test]
    fn issue_rejects_self_obligation() {
        let mut o = iou(10, 0);
        o.lender = party(B);
        let u = update(vec![], vec![o], CommandKind::Issue, &[B]);
        assert_eq!(verify(&u), Err(VerificationError::SameParty));
    }

    #[test]
    fn issue_rejects_prepaid() {
        let u = update(vec![], vec![iou(10, 3)], CommandKind::Issue, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::IssuedWithPayment));
    }

    #[test]
    fn issue_rejects_two_outputs() {
        let u = update(vec![], vec![iou(10, 0), iou(5, 0)], CommandKind::Issue, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::IssueOutputCount));
    }

    #[test]
    fn issue_rejects_extra_signer() {
        let u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[A, B, C]);
        let err = verify(&u).unwrap_err();
        assert!(err.to_string().contains("exact signer set mismatch"));
    }

    #[test]
    fn issue_rejects_single_signer() {
        let u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[B]);
        assert!(matches!(
            verify(&u),
            Err(VerificationError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn transfer_accepts_valid() {
        let out = iou(10, 0).with_new_lender(party(C));
        let u = update(vec![iou(10, 0)], vec![out], CommandKind::Transfer, &[A, B, C]);
        assert_eq!(verify(&u), Ok(()));
    }

    #[test]
    fn transfer_rejects_missing_new_lender() {
        let out = iou(10, 0).with_new_lender(party(C));
        let u = update(vec![iou(10, 0)], vec![out], CommandKind::Transfer, &[A, B]);
        let err = verify(&u).unwrap_err();
        assert!(err.to_string().contains("exact signer set mismatch"));
    }

    #[test]
    fn transfer_rejects_amount_change() {
        let mut out = iou(10, 0).with_new_lender(party(C));
        out.amount = 20;
        let u = update(vec![iou(10, 0)], vec![out], CommandKind::Transfer, &[A, B, C]);
        assert_eq!(verify(&u), Err(VerificationError::OnlyLenderMayChange));
    }

    #[test]
    fn transfer_rejects_same_lender() {
        let u = update(vec![iou(10, 0)], vec![iou(10, 0)], CommandKind::Transfer, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::LenderUnchanged));
    }

    #[test]
    fn transfer_rejects_lender_becoming_borrower() {
        let out = iou(10, 0).with_new_lender(party(B));
        let u = update(vec![iou(10, 0)], vec![out], CommandKind::Transfer, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::SameParty));
    }

    #[test]
    fn settle_partial_accepts() {
        let u = update(vec![iou(10, 0)], vec![iou(10, 5)], CommandKind::Settle, &[A, B]);
        assert_eq!(verify(&u), Ok(()));
    }

    #[test]
    fn settle_full_accepts_without_output() {
        let u = update(vec![iou(10, 5)], vec![], CommandKind::Settle, &[A, B]);
        assert_eq!(verify(&u), Ok(()));
    }

    #[test]
    fn settle_rejects_unchanged_paid() {
        let u = update(vec![iou(10, 5)], vec![iou(10, 5)], CommandKind::Settle, &[A, B]);
        let err = verify(&u).unwrap_err();
        assert_eq!(err, VerificationError::PaidMustIncrease);
        assert!(err.to_string().contains("paid must increase"));
    }

    #[test]
    fn settle_rejects_lender_change() {
        let out = iou(10, 5).with_new_lender(party(C));
        let u = update(vec![iou(10, 0)], vec![out], CommandKind::Settle, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::OnlyPaidMayChange));
    }

    #[test]
    fn settle_rejects_overpayment() {
        let u = update(vec![iou(10, 0)], vec![iou(10, 11)], CommandKind::Settle, &[A, B]);
        assert_eq!(verify(&u), Err(VerificationError::Overpaid));
    }

    #[test]
    fn settle_rejects_superset_signers() {
        let u = update(vec![iou(10, 0)], vec![iou(10, 5)], CommandKind::Settle, &[A, B, C]);
        assert!(matches!(
            verify(&u),
            Err(VerificationError::SignerMismatch { action: CommandKind::Settle, .. })
        ));
    }

    #[test]
    fn settle_rejects_two_outputs() {
        let u = update(
            vec![iou(10, 0)],
            vec![iou(10, 2), iou(10, 3)],
            CommandKind::Settle,
            &[A, B],
        );
        assert_eq!(verify(&u), Err(VerificationError::SettleOutputCount));
    }

    #[test]
    fn zero_or_multiple_commands_unrecognized() {
        let mut u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[A, B]);
        u.commands.clear();
        assert_eq!(verify(&u), Err(VerificationError::UnrecognizedCommand(0)));

        let mut u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[A, B]);
        let dup = u.commands[0].clone();
        u.commands.push(dup);
        assert_eq!(verify(&u), Err(VerificationError::UnrecognizedCommand(2)));
    }

    #[test]
    fn duplicate_signers_collapse() {
        let u = update(vec![], vec![iou(10, 0)], CommandKind::Issue, &[A, B, A]);
        assert_eq!(verify(&u), Ok(()));
    }
}
