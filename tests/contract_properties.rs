//! Contract property tests: randomized checks of the obligation rules.
//!
//! Each property is exercised over a few hundred sampled obligations rather
//! than a handful of fixed cases. Nothing here touches the network or a
//! vault; the contract is a pure function of the update.
//!
//! Properties verified:
//! - **Conservation**: amount, borrower and identity never change after issue
//! - **Monotonicity**: paid only ever increases and never exceeds amount
//! - **Exact signers**: any deviation from the required set is rejected
//! - **Determinism**: the same update always yields the same verdict and id

use rand::Rng;

use concord::contract::{self, required_signers, VerificationError};
use concord::identity::PartyId;
use concord::obligation::Obligation;
use concord::transaction::{Command, CommandKind, LedgerUpdate, StateAndRef, StateRef, UpdateId};

const ROUNDS: usize = 200;

// ── Helpers ─────────────────────────────────────────────────────────────

fn random_party(rng: &mut impl Rng) -> PartyId {
    PartyId(rng.random())
}

fn notary() -> PartyId {
    PartyId([0xAA; 32])
}

/// A freshly issued obligation with random parties and amount.
fn random_issued(rng: &mut impl Rng) -> Obligation {
    let amount = rng.random_range(1..=1_000_000u64);
    Obligation::new(amount, random_party(rng), random_party(rng))
}

/// `random_issued` with some amount already paid, never fully.
fn random_open(rng: &mut impl Rng) -> Obligation {
    let mut obligation = random_issued(rng);
    obligation.amount = obligation.amount.max(2);
    obligation.paid = rng.random_range(0..obligation.amount);
    obligation
}

fn consumed(state: Obligation) -> StateAndRef {
    StateAndRef {
        state,
        reference: StateRef {
            update_id: UpdateId([0x11; 32]),
            index: 0,
        },
    }
}

fn settle(input: &Obligation, output: Option<Obligation>) -> LedgerUpdate {
    LedgerUpdate {
        inputs: vec![consumed(input.clone())],
        outputs: output.into_iter().collect(),
        commands: vec![Command::new(CommandKind::Settle, input.participants())],
        notary: notary(),
    }
}

fn transfer(input: &Obligation, output: Obligation, signers: Vec<PartyId>) -> LedgerUpdate {
    LedgerUpdate {
        inputs: vec![consumed(input.clone())],
        outputs: vec![output],
        commands: vec![Command::new(CommandKind::Transfer, signers)],
        notary: notary(),
    }
}

// ── Issue ───────────────────────────────────────────────────────────────

#[test]
fn issued_obligations_with_matching_signers_verify() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let issued = random_issued(&mut rng);
        let update = LedgerUpdate {
            inputs: vec![],
            commands: vec![Command::new(CommandKind::Issue, issued.participants())],
            outputs: vec![issued],
            notary: notary(),
        };
        assert_eq!(contract::verify(&update), Ok(()));
    }
}

#[test]
fn issue_with_any_prior_payment_is_rejected() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let mut issued = random_issued(&mut rng);
        issued.paid = rng.random_range(1..=issued.amount);
        let update = LedgerUpdate {
            inputs: vec![],
            commands: vec![Command::new(CommandKind::Issue, issued.participants())],
            outputs: vec![issued],
            notary: notary(),
        };
        assert_eq!(
            contract::verify(&update),
            Err(VerificationError::IssuedWithPayment)
        );
    }
}

// ── Settle ──────────────────────────────────────────────────────────────

#[test]
fn any_partial_payment_within_outstanding_verifies() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let pay = rng.random_range(1..=input.outstanding());
        let output = input.pay(pay).filter(|o| !o.is_fully_paid());
        let result = contract::verify(&settle(&input, output.clone()));
        assert_eq!(result, Ok(()), "input {input:?} pay {pay}");
        match output {
            Some(o) => assert_eq!(o.paid, input.paid + pay),
            None => assert_eq!(pay, input.outstanding()),
        }
    }
}

#[test]
fn paid_never_decreases_or_stalls() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let mut output = input.clone();
        output.paid = rng.random_range(0..=input.paid);
        assert_eq!(
            contract::verify(&settle(&input, Some(output))),
            Err(VerificationError::PaidMustIncrease)
        );
    }
}

#[test]
fn overpayment_is_rejected() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let mut output = input.clone();
        output.paid = input.amount + rng.random_range(1..=1_000u64);
        assert_eq!(
            contract::verify(&settle(&input, Some(output))),
            Err(VerificationError::Overpaid)
        );
    }
}

#[test]
fn settlement_cannot_touch_other_fields() {
    let mut rng = rand::rng();
    for round in 0..ROUNDS {
        let input = random_open(&mut rng);
        let mut output = input.clone();
        output.paid = input.paid + 1;
        match round % 3 {
            0 => output.amount += 1,
            1 => output.lender = random_party(&mut rng),
            _ => output.borrower = random_party(&mut rng),
        }
        assert_eq!(
            contract::verify(&settle(&input, Some(output))),
            Err(VerificationError::OnlyPaidMayChange)
        );
    }
}

// ── Transfer ────────────────────────────────────────────────────────────

#[test]
fn transfer_to_fresh_lender_preserves_everything_else() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let new_lender = random_party(&mut rng);
        let output = input.with_new_lender(new_lender);
        let signers = vec![input.lender, input.borrower, new_lender];
        assert_eq!(contract::verify(&transfer(&input, output.clone(), signers)), Ok(()));
        assert_eq!(output.id, input.id);
        assert_eq!(output.amount, input.amount);
        assert_eq!(output.paid, input.paid);
        assert_eq!(output.borrower, input.borrower);
    }
}

#[test]
fn transfer_with_any_other_signer_set_is_rejected() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let new_lender = random_party(&mut rng);
        let outsider = random_party(&mut rng);
        let output = input.with_new_lender(new_lender);
        let bad_sets = [
            vec![input.lender, input.borrower],
            vec![input.borrower, new_lender],
            vec![input.lender, new_lender],
            vec![input.lender, input.borrower, new_lender, outsider],
            vec![],
        ];
        for signers in bad_sets {
            let err = contract::verify(&transfer(&input, output.clone(), signers)).unwrap_err();
            assert!(matches!(err, VerificationError::SignerMismatch { .. }));
        }
    }
}

#[test]
fn required_signers_match_the_action() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let new_lender = random_party(&mut rng);
        let output = input.with_new_lender(new_lender);

        let issue = required_signers(CommandKind::Issue, &[], &[&input]);
        assert_eq!(issue.len(), 2);
        assert!(issue.contains(&input.lender) && issue.contains(&input.borrower));

        let moved = required_signers(CommandKind::Transfer, &[&input], &[&output]);
        assert_eq!(moved.len(), 3);
        assert!(moved.contains(&new_lender));

        let settled = required_signers(CommandKind::Settle, &[&input], &[]);
        assert_eq!(settled, issue);
    }
}

// ── Determinism ─────────────────────────────────────────────────────────

#[test]
fn verdict_and_id_are_deterministic() {
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        let input = random_open(&mut rng);
        let mut output = input.clone();
        output.paid = rng.random_range(0..=input.amount + 5);
        let update = settle(&input, Some(output));

        let first = contract::verify(&update);
        let copy = update.clone();
        assert_eq!(contract::verify(&copy), first);
        assert_eq!(copy.id(), update.id());
    }
}

#[test]
fn id_commits_to_every_field() {
    let mut rng = rand::rng();
    let input = random_open(&mut rng);
    let base = settle(&input, input.pay(1));
    let base_id = base.id();

    let mut other_notary = base.clone();
    other_notary.notary = random_party(&mut rng);
    assert_ne!(other_notary.id(), base_id);

    let mut other_ref = base.clone();
    other_ref.inputs[0].reference.index = 1;
    assert_ne!(other_ref.id(), base_id);

    let mut other_kind = base.clone();
    other_kind.commands[0].kind = CommandKind::Transfer;
    assert_ne!(other_kind.id(), base_id);
}
