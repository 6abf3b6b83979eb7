//! Dilithium5 party keys.
//!
//! Everything above this module sees keys and signatures as opaque bytes:
//! a [`PartyId`](crate::identity::PartyId) is the fingerprint of a
//! [`SigningPublicKey`], and a [`Signature`] either verifies against that key
//! or it does not.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

/// Public half of a party key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// Secret half of a party key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// Detached signature over an update digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Rebuild a keypair loaded from disk. `None` if either half is malformed.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&public).ok()?;
        dilithium5::SecretKey::from_bytes(&secret).ok()?;
        Some(SigningKeypair {
            public: SigningPublicKey(public),
            secret: SigningSecretKey(secret),
        })
    }

    /// Sign `message`. A corrupt secret key produces a signature that never
    /// verifies.
    pub fn sign(&self, message: &[u8]) -> Signature {
        match dilithium5::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => Signature(dilithium5::detached_sign(message, &sk).as_bytes().to_vec()),
            Err(_) => {
                tracing::error!("refusing to sign with a corrupt secret key");
                Signature(Vec::new())
            }
        }
    }
}

impl SigningPublicKey {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let (Ok(pk), Ok(sig)) = (
            dilithium5::PublicKey::from_bytes(&self.0),
            dilithium5::DetachedSignature::from_bytes(&signature.0),
        ) else {
            return false;
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain("concord.signing.fingerprint", &self.0)
    }
}

/// Read a byte string and check its length. `allow_empty` admits the
/// zero-length placeholder a corrupt key signs with.
fn sized_bytes<'de, D: serde::Deserializer<'de>>(
    d: D,
    what: &str,
    expected: usize,
    allow_empty: bool,
) -> Result<Vec<u8>, D::Error> {
    let bytes: Vec<u8> = Deserialize::deserialize(d)?;
    if bytes.len() == expected || (allow_empty && bytes.is_empty()) {
        return Ok(bytes);
    }
    Err(serde::de::Error::custom(format!(
        "{what} must be {expected} bytes, got {}",
        bytes.len()
    )))
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        sized_bytes(d, "public key", dilithium5::public_key_bytes(), false).map(SigningPublicKey)
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        sized_bytes(d, "signature", dilithium5::signature_bytes(), true).map(Signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_binds_key_and_message() {
        let a = SigningKeypair::generate();
        let b = SigningKeypair::generate();
        let sig = a.sign(b"obligation");
        assert!(a.public.verify(b"obligation", &sig));
        assert!(!a.public.verify(b"other", &sig));
        assert!(!b.public.verify(b"obligation", &sig));
    }

    #[test]
    fn corrupt_secret_signs_nothing_verifiable() {
        let mut kp = SigningKeypair::generate();
        kp.secret = SigningSecretKey(vec![1, 2, 3]);
        let sig = kp.sign(b"payload");
        assert!(sig.0.is_empty());
        assert!(!kp.public.verify(b"payload", &sig));
    }

    #[test]
    fn wire_sizes_are_enforced() {
        let short = crate::serialize(&vec![7u8; 12]).unwrap();
        assert!(crate::deserialize::<Signature>(&short).is_err());
        assert!(crate::deserialize::<SigningPublicKey>(&short).is_err());

        let empty = crate::serialize(&Vec::<u8>::new()).unwrap();
        assert!(crate::deserialize::<Signature>(&empty).is_ok());
        assert!(crate::deserialize::<SigningPublicKey>(&empty).is_err());
    }

    #[test]
    fn public_key_survives_the_wire() {
        let kp = SigningKeypair::generate();
        let bytes = crate::serialize(&kp.public).unwrap();
        let back: SigningPublicKey = crate::deserialize(&bytes).unwrap();
        assert_eq!(back.fingerprint(), kp.public.fingerprint());
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        let kp = SigningKeypair::generate();
        assert!(SigningKeypair::from_bytes(kp.public.0.clone(), kp.secret.0.clone()).is_some());
        assert!(SigningKeypair::from_bytes(vec![0u8; 10], vec![0u8; 100]).is_none());
    }
}
