//! Keys of the channel participants.
//!
//! The same [`PublicKey`] type names both ledger accounts and signers, the ledger identifying an
//! account by the key that created it.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hex::FromHex;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Errors parsing a key
#[derive(Debug, Snafu)]
pub enum Error {
    /// Not 32 hex-encoded bytes
    #[snafu(display("invalid hex: {}", source))]
    InvalidHex {
        /// Cause
        source: hex::FromHexError,
    },
}

/// Public half of an ed25519 key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short tag identifying this key in a signature list
    pub fn hint(&self) -> [u8; 4] {
        let mut hint = [0; 4];
        hint.copy_from_slice(&self.0[28..]);
        hint
    }

    /// Check `signature` over `message`, any malformed input being reported as a mismatch
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let key = match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match ed25519_dalek::Signature::from_slice(signature) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::from_hex(s).map(Self).context(InvalidHex)
    }
}

/// Signing key of a participant, never leaving its owner
#[derive(Clone)]
pub struct KeyPair(SigningKey);

impl KeyPair {
    /// Generate a fresh key from the OS randomness
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);

        Self::from_seed(seed)
    }

    /// Derive the key from its secret seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(SigningKey::from_bytes(&seed))
    }

    /// Secret seed, to be stored in a config
    pub fn seed(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Public half of this key
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Sign a raw message
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.public()).finish()
    }
}
