//! Ledger update model.
//!
//! A [`LedgerUpdate`] consumes zero or more existing obligation versions
//! (referenced by [`StateRef`] and carried in full so any participant can
//! re-verify without trusting the sender) and produces new versions. Exactly
//! one [`Command`] names the action and the parties whose signatures it
//! requires. A [`SignedUpdate`] accumulates those signatures as it travels
//! between participants and finally the notary.

pub mod builder;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::contract::{self, VerificationError};
use crate::crypto::keys::{Signature, SigningKeypair};
use crate::identity::{join_parties, IdentityResolver, PartyId};
use crate::obligation::Obligation;
use crate::Hash;

/// Unique update identifier (hash of the update contents).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub Hash);

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateId({self})")
    }
}

/// Pointer to one output of a finalised update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub update_id: UpdateId,
    pub index: u32,
}

impl StateRef {
    /// Fixed-width key for ordered stores.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.update_id.0);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.update_id, self.index)
    }
}

/// An obligation version together with the reference that locates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub state: Obligation,
    pub reference: StateRef,
}

/// The action an update performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Create a new obligation (no inputs)
    Issue,
    /// Re-assign the lender
    Transfer,
    /// Partially or fully pay off
    Settle,
}

impl CommandKind {
    fn discriminant(self) -> u8 {
        match self {
            CommandKind::Issue => 0,
            CommandKind::Transfer => 1,
            CommandKind::Settle => 2,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Issue => "Issue",
            CommandKind::Transfer => "Transfer",
            CommandKind::Settle => "Settle",
        };
        f.write_str(name)
    }
}

/// An action tag plus the parties that must sign for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub signers: Vec<PartyId>,
}

impl Command {
    pub fn new(kind: CommandKind, signers: impl IntoIterator<Item = PartyId>) -> Self {
        Command {
            kind,
            signers: signers.into_iter().collect(),
        }
    }

    /// Declared signers as a set (duplicates collapse).
    pub fn signer_set(&self) -> BTreeSet<PartyId> {
        self.signers.iter().copied().collect()
    }
}

/// A proposed change to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    /// Consumed versions, carried in full
    pub inputs: Vec<StateAndRef>,
    /// Produced versions
    pub outputs: Vec<Obligation>,
    /// Action tags; a valid update carries exactly one
    pub commands: Vec<Command>,
    /// Notary that must witness the consumption of `inputs`
    pub notary: PartyId,
}

impl LedgerUpdate {
    /// Compute the update id (hash of every field).
    pub fn id(&self) -> UpdateId {
        let mut hasher = blake3::Hasher::new_derive_key("concord.update.id");
        hasher.update(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            hasher.update(&input.reference.update_id.0);
            hasher.update(&input.reference.index.to_le_bytes());
            hash_obligation_into(&input.state, &mut hasher);
        }
        hasher.update(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            hash_obligation_into(output, &mut hasher);
        }
        hasher.update(&(self.commands.len() as u32).to_le_bytes());
        for command in &self.commands {
            hasher.update(&[command.kind.discriminant()]);
            hasher.update(&(command.signers.len() as u32).to_le_bytes());
            for signer in &command.signers {
                hasher.update(signer.as_bytes());
            }
        }
        hasher.update(self.notary.as_bytes());
        UpdateId(*hasher.finalize().as_bytes())
    }

    /// Run the obligation contract over this update.
    pub fn verify(&self) -> Result<(), VerificationError> {
        contract::verify(self)
    }

    pub fn input_refs(&self) -> Vec<StateRef> {
        self.inputs.iter().map(|i| i.reference).collect()
    }

    /// Outputs paired with the references they will have once finalised.
    pub fn outputs_with_refs(&self) -> Vec<StateAndRef> {
        let update_id = self.id();
        self.outputs
            .iter()
            .enumerate()
            .map(|(index, state)| StateAndRef {
                state: state.clone(),
                reference: StateRef {
                    update_id,
                    index: index as u32,
                },
            })
            .collect()
    }

    /// Union of every command's declared signers.
    pub fn command_signers(&self) -> BTreeSet<PartyId> {
        self.commands.iter().flat_map(|c| c.signers.iter().copied()).collect()
    }

    /// Everyone who should end up holding this update: participants of the
    /// consumed and the produced versions.
    pub fn participants(&self) -> BTreeSet<PartyId> {
        self.inputs
            .iter()
            .map(|i| &i.state)
            .chain(self.outputs.iter())
            .flat_map(|o| o.participants())
            .collect()
    }
}

fn hash_obligation_into(obligation: &Obligation, hasher: &mut blake3::Hasher) {
    hasher.update(&obligation.id.0);
    hasher.update(&obligation.amount.to_le_bytes());
    hasher.update(obligation.lender.as_bytes());
    hasher.update(obligation.borrower.as_bytes());
    hasher.update(&obligation.paid.to_le_bytes());
}

/// The message a party signs to endorse an update.
pub fn update_sign_data(id: &UpdateId) -> Hash {
    crate::hash_concat(&[b"concord.update.sign", &id.0])
}

/// One party's signature over an update id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSignature {
    pub by: PartyId,
    pub signature: Signature,
}

impl UpdateSignature {
    pub fn sign(update_id: &UpdateId, keypair: &SigningKeypair) -> Self {
        UpdateSignature {
            by: PartyId(keypair.public.fingerprint()),
            signature: keypair.sign(&update_sign_data(update_id)),
        }
    }

    pub fn verify(&self, update_id: &UpdateId, resolver: &dyn IdentityResolver) -> Result<(), SignatureError> {
        let key = resolver
            .resolve(&self.by)
            .ok_or(SignatureError::UnknownSigner(self.by))?;
        if PartyId(key.fingerprint()) != self.by {
            return Err(SignatureError::Invalid(self.by));
        }
        if !key.verify(&update_sign_data(update_id), &self.signature) {
            return Err(SignatureError::Invalid(self.by));
        }
        Ok(())
    }
}

/// An update plus the signatures collected so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUpdate {
    pub update: LedgerUpdate,
    pub signatures: Vec<UpdateSignature>,
}

impl SignedUpdate {
    /// Sign a freshly built update with the initiator's key.
    pub fn new(update: LedgerUpdate, keypair: &SigningKeypair) -> Self {
        let sig = UpdateSignature::sign(&update.id(), keypair);
        SignedUpdate {
            update,
            signatures: vec![sig],
        }
    }

    pub fn id(&self) -> UpdateId {
        self.update.id()
    }

    /// Attach a signature, replacing any earlier one by the same party.
    pub fn add_signature(&mut self, sig: UpdateSignature) {
        self.signatures.retain(|s| s.by != sig.by);
        self.signatures.push(sig);
    }

    pub fn with_signature(mut self, sig: UpdateSignature) -> Self {
        self.add_signature(sig);
        self
    }

    pub fn signed_by(&self) -> BTreeSet<PartyId> {
        self.signatures.iter().map(|s| s.by).collect()
    }

    /// Every party whose signature finality requires: command signers and the notary.
    pub fn required_signers(&self) -> BTreeSet<PartyId> {
        let mut required = self.update.command_signers();
        required.insert(self.update.notary);
        required
    }

    pub fn missing_signers(&self) -> BTreeSet<PartyId> {
        let signed = self.signed_by();
        self.required_signers()
            .into_iter()
            .filter(|p| !signed.contains(p))
            .collect()
    }

    /// Check every attached signature, then require all signers other than
    /// `allowed_missing` to be present.
    pub fn verify_signatures_except(
        &self,
        allowed_missing: &[PartyId],
        resolver: &dyn IdentityResolver,
    ) -> Result<(), SignatureError> {
        let id = self.id();
        for sig in &self.signatures {
            sig.verify(&id, resolver)?;
        }
        let missing: Vec<PartyId> = self
            .missing_signers()
            .into_iter()
            .filter(|p| !allowed_missing.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(SignatureError::Missing(missing));
        }
        Ok(())
    }

    /// Full check: every required signer, notary included, has signed.
    pub fn verify_required_signatures(
        &self,
        resolver: &dyn IdentityResolver,
    ) -> Result<(), SignatureError> {
        self.verify_signatures_except(&[], resolver)
    }
}

/// Signature check failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature by {0} does not verify")]
    Invalid(PartyId),
    #[error("signer {0} cannot be resolved to a key")]
    UnknownSigner(PartyId),
    #[error("missing signatures from {}", join_parties(.0))]
    Missing(Vec<PartyId>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityDirectory, Party};

    struct Fixture {
        dir: IdentityDirectory,
        lender: SigningKeypair,
        borrower: SigningKeypair,
        notary: SigningKeypair,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = IdentityDirectory::new();
            let lender = SigningKeypair::generate();
            let borrower = SigningKeypair::generate();
            let notary = SigningKeypair::generate();
            dir.register(Party::new("Lender", lender.public.clone()));
            dir.register(Party::new("Borrower", borrower.public.clone()));
            dir.register(Party::new("Notary", notary.public.clone()));
            Fixture {
                dir,
                lender,
                borrower,
                notary,
            }
        }

        fn id(kp: &SigningKeypair) -> PartyId {
            PartyId(kp.public.fingerprint())
        }

        fn issue(&self) -> LedgerUpdate {
            let lender = Self::id(&self.lender);
            let borrower = Self::id(&self.borrower);
            LedgerUpdate {
                inputs: vec![],
                outputs: vec![Obligation::new(10, lender, borrower)],
                commands: vec![Command::new(CommandKind::Issue, [lender, borrower])],
                notary: Self::id(&self.notary),
            }
        }
    }

    #[test]
    fn update_id_deterministic() {
        let f = Fixture::new();
        let update = f.issue();
        assert_eq!(update.id(), update.id());
        assert_eq!(update.clone().id(), update.id());
    }

    #[test]
    fn update_id_changes_with_content() {
        let f = Fixture::new();
        let update = f.issue();
        let mut tampered = update.clone();
        tampered.outputs[0].amount = 11;
        assert_ne!(update.id(), tampered.id());
    }

    #[test]
    fn outputs_with_refs_point_at_update() {
        let f = Fixture::new();
        let update = f.issue();
        let refs = update.outputs_with_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].reference.update_id, update.id());
        assert_eq!(refs[0].reference.index, 0);
    }

    #[test]
    fn fully_signed_update_verifies() {
        let f = Fixture::new();
        let update = f.issue();
        let id = update.id();
        let signed = SignedUpdate::new(update, &f.borrower)
            .with_signature(UpdateSignature::sign(&id, &f.lender))
            .with_signature(UpdateSignature::sign(&id, &f.notary));
        assert!(signed.missing_signers().is_empty());
        assert!(signed.verify_required_signatures(&f.dir).is_ok());
    }

    #[test]
    fn missing_signers_reported() {
        let f = Fixture::new();
        let signed = SignedUpdate::new(f.issue(), &f.borrower);
        let lender = Fixture::id(&f.lender);
        let notary = Fixture::id(&f.notary);
        assert_eq!(signed.missing_signers(), BTreeSet::from([lender, notary]));
        assert!(signed
            .verify_signatures_except(&[lender, notary], &f.dir)
            .is_ok());
        match signed.verify_signatures_except(&[notary], &f.dir) {
            Err(SignatureError::Missing(missing)) => assert_eq!(missing, vec![lender]),
            other => panic!("expected Missing, got {:?}", other),
        }
    }

    #[test]
    fn tampered_update_invalidates_signatures() {
        let f = Fixture::new();
        let mut signed = SignedUpdate::new(f.issue(), &f.borrower);
        signed.update.outputs[0].amount = 1_000;
        let borrower = Fixture::id(&f.borrower);
        assert_eq!(
            signed.verify_signatures_except(&[Fixture::id(&f.lender), Fixture::id(&f.notary)], &f.dir),
            Err(SignatureError::Invalid(borrower))
        );
    }

    #[test]
    fn unknown_signer_rejected() {
        let f = Fixture::new();
        let stranger = SigningKeypair::generate();
        let update = f.issue();
        let id = update.id();
        let signed = SignedUpdate::new(update, &f.borrower)
            .with_signature(UpdateSignature::sign(&id, &stranger));
        assert_eq!(
            signed.verify_signatures_except(&[Fixture::id(&f.lender), Fixture::id(&f.notary)], &f.dir),
            Err(SignatureError::UnknownSigner(Fixture::id(&stranger)))
        );
    }

    #[test]
    fn add_signature_replaces_same_signer() {
        let f = Fixture::new();
        let update = f.issue();
        let id = update.id();
        let mut signed = SignedUpdate::new(update, &f.borrower);
        signed.add_signature(UpdateSignature::sign(&id, &f.borrower));
        assert_eq!(signed.signatures.len(), 1);
    }

    #[test]
    fn signed_update_survives_serialization() {
        let f = Fixture::new();
        let signed = SignedUpdate::new(f.issue(), &f.borrower);
        let bytes = crate::serialize(&signed).unwrap();
        let back: SignedUpdate = crate::deserialize(&bytes).unwrap();
        assert_eq!(back.id(), signed.id());
        assert_eq!(back, signed);
    }
}
