//! Model of the ledger the channel lives on.
//!
//! Only what the channel relies on is modeled: sequence-gated transactions with their
//! preconditions and signers, results telling success apart, and the ledger entry changes a
//! transaction produced. Objects travel as bincode bytes.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

mod meta;
mod transaction;

pub use meta::{
    AccountEntry, LedgerEntry, LedgerEntryChange, LedgerKey, OperationMeta, ResultCode,
    Thresholds, TransactionMeta, TransactionResult, TrustLineEntry,
};
pub use transaction::{
    Asset, Memo, Operation, OperationBody, Preconditions, Signer, SignerKey, TimeBounds,
    Transaction, TransactionEnvelope,
};

/// Envelope type tag prefixed to a transaction before hashing
const ENVELOPE_TYPE_TX: [u8; 4] = [0, 0, 0, 2];

/// Errors of the ledger object codec
#[derive(Debug, Snafu)]
pub enum Error {
    /// Object could not be encoded
    #[snafu(display("encode: {}", source))]
    Encode {
        /// Cause
        source: bincode::Error,
    },
    /// Bytes are not the expected object
    #[snafu(display("decode: {}", source))]
    Decode {
        /// Cause
        source: bincode::Error,
    },
}

/// Sha256 digest, identifying transactions and networks
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Digest of `data`
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// Identifier of the network named by `passphrase`
pub fn network_id(passphrase: &str) -> Hash {
    Hash::digest(passphrase.as_bytes())
}

/// Hash under which `tx` is signed on the network named by `passphrase`
pub fn transaction_hash(tx: &Transaction, passphrase: &str) -> Result<Hash, Error> {
    let encoded = encode(tx)?;

    let mut hasher = Sha256::new();
    hasher.update(network_id(passphrase).as_bytes());
    hasher.update(ENVELOPE_TYPE_TX);
    hasher.update(&encoded);

    Ok(Hash(hasher.finalize().into()))
}

/// Serialize a ledger object to its wire bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(value).context(Encode)
}

/// Deserialize a ledger object from its wire bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::deserialize(bytes).context(Decode)
}
