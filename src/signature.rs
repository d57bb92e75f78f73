//! Signature engine: sign and verify transaction hashes.
//!
//! A signature is opaque bytes tagged by a short hint of the key that made it. The hint only
//! speeds up lookups, verification always checks the bytes against the expected key.

use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, Snafu};

use crate::{
    keys::{KeyPair, PublicKey},
    ledger::Hash,
};

/// Errors of signature checks
#[derive(Debug, Snafu)]
pub enum Error {
    /// Expected signature is absent
    #[snafu(display("missing signature #{} of {} on {}", index, signer, hash))]
    Missing {
        /// Position in the checked set
        index: usize,
        /// Signed hash
        hash: Hash,
        /// Expected signer
        signer: PublicKey,
    },
    /// Signature does not verify
    #[snafu(display("signature #{} of {} on {} does not verify", index, signer, hash))]
    Mismatch {
        /// Position in the checked set
        index: usize,
        /// Signed hash
        hash: Hash,
        /// Expected signer
        signer: PublicKey,
    },
}

/// Signature as carried in a transaction envelope
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DecoratedSignature {
    /// Tail of the signer key, xored with the payload tail for signed payloads
    pub hint: [u8; 4],
    /// Raw ed25519 signature
    pub signature: Vec<u8>,
}

/// Sign a transaction hash
pub fn sign(hash: &Hash, key: &KeyPair) -> DecoratedSignature {
    DecoratedSignature {
        hint: key.public().hint(),
        signature: key.sign(hash.as_bytes()),
    }
}

/// Hint of a signature made over a signed payload
pub fn payload_hint(signer: &PublicKey, payload: &[u8]) -> [u8; 4] {
    let mut hint = signer.hint();
    let tail = &payload[payload.len().saturating_sub(4)..];
    hint.iter_mut()
        .zip(tail.iter())
        .for_each(|(h, p)| *h ^= p);
    hint
}

/// Present `signature`, made over `payload`, as satisfying a signed-payload signer
pub fn as_payload_signature(
    signer: &PublicKey,
    payload: &[u8],
    signature: &DecoratedSignature,
) -> DecoratedSignature {
    DecoratedSignature {
        hint: payload_hint(signer, payload),
        signature: signature.signature.clone(),
    }
}

/// Check that `signature` was made by `signer` over `hash`
///
/// A `false` is the normal answer for someone else's signature, not an error.
pub fn verify(hash: &Hash, signer: &PublicKey, signature: &DecoratedSignature) -> bool {
    signer.verify(hash.as_bytes(), &signature.signature)
}

/// One expected signature, see [`verify_set`]
#[derive(Clone, Debug)]
pub struct Check<'a> {
    /// Signed transaction hash
    pub hash: Hash,
    /// Expected signer
    pub signer: PublicKey,
    /// Signature found, if any
    pub signature: Option<&'a DecoratedSignature>,
}

/// Verify every check in parallel, failing on the first one not holding
pub fn verify_set(checks: &[Check<'_>]) -> Result<(), Error> {
    checks
        .par_iter()
        .enumerate()
        .try_for_each(|(index, check)| -> Result<(), Error> {
            let signature = check.signature.context(Missing {
                index,
                hash: check.hash,
                signer: check.signer,
            })?;

            ensure!(
                verify(&check.hash, &check.signer, signature),
                Mismatch {
                    index,
                    hash: check.hash,
                    signer: check.signer,
                }
            );

            Ok(())
        })
}

/// Set of signatures keyed by `(hint, bytes)`, merging idempotently
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet(BTreeSet<DecoratedSignature>);

impl SignatureSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signature, returning whether it was new
    pub fn insert(&mut self, signature: DecoratedSignature) -> bool {
        self.0.insert(signature)
    }

    /// Union with another set
    pub fn merge(&mut self, other: &SignatureSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Number of signatures
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no signature is stored
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the signatures, ordered by hint then bytes
    pub fn iter(&self) -> impl Iterator<Item = &DecoratedSignature> {
        self.0.iter()
    }

    /// First signature of `signer` over `hash`, whatever its hint
    pub fn find(&self, hash: &Hash, signer: &PublicKey) -> Option<&DecoratedSignature> {
        self.0.iter().find(|sig| verify(hash, signer, sig))
    }
}

impl FromIterator<DecoratedSignature> for SignatureSet {
    fn from_iter<I: IntoIterator<Item = DecoratedSignature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SignatureSet {
    type Item = &'a DecoratedSignature;
    type IntoIter = std::collections::btree_set::Iter<'a, DecoratedSignature>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
