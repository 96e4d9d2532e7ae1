//! Deterministic participant identities derived from a seed.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

const USER_KEY_CONTEXT: &str = "mpc-paygate 2024-06-01 user signing key";
const NODE_KEY_CONTEXT: &str = "mpc-paygate 2024-06-01 node key";

/// Number of hash bytes that make up a [`UserId`].
const USER_ID_LEN: usize = 20;

/// The identifier of a user, i.e. the owner of stored programs and secrets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// The identifier of a party as it participates in a computation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl UserId {
    /// Derives the user id belonging to a verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let hash = blake3::hash(key.as_bytes());
        Self(hex::encode(&hash.as_bytes()[..USER_ID_LEN]))
    }

    /// The hex representation of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartyId {
    /// Derives the party id belonging to a node key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(blake3::hash(key.as_bytes()).to_string())
    }

    /// The hex representation of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for PartyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The seed could not be turned into key material.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("seed must contain at least one non-whitespace character")]
pub struct InvalidSeedError;

/// The capability to sign messages as a specific user.
pub struct SigningCapability(SigningKey);

impl SigningCapability {
    /// Signs `msg` with the user key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.0.sign(msg)
    }

    /// The public half of the user key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    /// Checks that `signature` was produced by this capability over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        self.0.verifying_key().verify(msg, signature).is_ok()
    }
}

impl fmt::Debug for SigningCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningCapability")
            .field(&hex::encode(self.0.verifying_key().as_bytes()))
            .finish()
    }
}

/// A cluster participant: who we are as a party, as a user, and how we sign.
///
/// Created once at startup and held for the lifetime of the process.
#[derive(Debug)]
pub struct PartyIdentity {
    party_id: PartyId,
    user_id: UserId,
    signer: SigningCapability,
}

impl PartyIdentity {
    /// Derives the identity for `seed`.
    ///
    /// The derivation is deterministic, the same seed always yields the same identity.
    pub fn from_seed(seed: &str) -> Result<Self, InvalidSeedError> {
        if seed.trim().is_empty() {
            return Err(InvalidSeedError);
        }
        let user_key = SigningKey::from_bytes(&blake3::derive_key(
            USER_KEY_CONTEXT,
            seed.as_bytes(),
        ));
        let node_key = SigningKey::from_bytes(&blake3::derive_key(
            NODE_KEY_CONTEXT,
            seed.as_bytes(),
        ));
        Ok(Self {
            party_id: PartyId::from_verifying_key(&node_key.verifying_key()),
            user_id: UserId::from_verifying_key(&user_key.verifying_key()),
            signer: SigningCapability(user_key),
        })
    }

    /// Our party id.
    pub fn party_id(&self) -> &PartyId {
        &self.party_id
    }

    /// Our user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The signing capability of our user key.
    pub fn signer(&self) -> &SigningCapability {
        &self.signer
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn same_seed_same_identity() {
        let a = PartyIdentity::from_seed("my_seed").unwrap();
        let b = PartyIdentity::from_seed("my_seed").unwrap();
        assert_eq!(a.party_id(), b.party_id());
        assert_eq!(a.user_id(), b.user_id());
        assert_eq!(a.signer().verifying_key(), b.signer().verifying_key());
    }

    #[test]
    fn user_and_party_ids_are_hex() {
        let id = PartyIdentity::from_seed("abc").unwrap();
        assert_eq!(id.user_id().as_str().len(), 2 * USER_ID_LEN);
        assert_eq!(id.party_id().as_str().len(), 64);
        assert!(id.user_id().as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn blank_seed_is_rejected() {
        assert_eq!(PartyIdentity::from_seed("").unwrap_err(), InvalidSeedError);
        assert_eq!(
            PartyIdentity::from_seed(" \t\n").unwrap_err(),
            InvalidSeedError
        );
    }

    #[test]
    fn signatures_verify() {
        let id = PartyIdentity::from_seed("abc").unwrap();
        let sig = id.signer().sign(b"hello");
        assert!(id.signer().verify(b"hello", &sig));
        assert!(!id.signer().verify(b"world", &sig));
    }

    #[test]
    fn debug_does_not_leak_the_signing_key() {
        let id = PartyIdentity::from_seed("abc").unwrap();
        let secret = hex::encode(blake3::derive_key(USER_KEY_CONTEXT, b"abc"));
        assert!(!format!("{id:?}").contains(&secret));
    }

    proptest! {
        #[test]
        fn distinct_seeds_distinct_identities(a in "[a-z0-9]{1,16}", b in "[a-z0-9]{1,16}") {
            prop_assume!(a != b);
            let id_a = PartyIdentity::from_seed(&a).unwrap();
            let id_b = PartyIdentity::from_seed(&b).unwrap();
            prop_assert_ne!(id_a.user_id(), id_b.user_id());
            prop_assert_ne!(id_a.party_id(), id_b.party_id());
        }

        #[test]
        fn derivation_is_deterministic(seed in "\\PC*[a-z]\\PC*") {
            let a = PartyIdentity::from_seed(&seed).unwrap();
            let b = PartyIdentity::from_seed(&seed).unwrap();
            prop_assert_eq!(a.user_id(), b.user_id());
            prop_assert_eq!(a.party_id(), b.party_id());
        }
    }
}
