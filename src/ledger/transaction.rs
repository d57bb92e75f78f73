use std::fmt;

use serde::{Deserialize, Serialize};

use super::{transaction_hash, Error, Hash};
use crate::{keys::PublicKey, signature::SignatureSet};

/// Asset held by the channel accounts
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Network native asset, no trustline needed
    Native,
    /// Asset issued by an account
    Credit {
        /// Short code, such as `USD`
        code: String,
        /// Issuing account
        issuer: PublicKey,
    },
}

impl Asset {
    /// Whether this is the native asset
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }
}

impl Default for Asset {
    fn default() -> Self {
        Self::Native
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Credit { code, issuer } => write!(f, "{}:{}", code, issuer),
        }
    }
}

/// Key able to sign for an account or a transaction
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignerKey {
    /// Plain ed25519 key
    Ed25519(PublicKey),
    /// Satisfied only by a signature of `signer` over `payload`
    SignedPayload {
        /// Key expected to sign
        signer: PublicKey,
        /// Bytes expected to be signed
        payload: Vec<u8>,
    },
}

/// Signer of an account with its weight
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    /// Signing key
    pub key: SignerKey,
    /// Weight, zero removing the signer
    pub weight: u8,
}

/// Unix time window in which a transaction is valid, zero meaning unbounded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Earliest close time
    pub min_time: u64,
    /// Latest close time
    pub max_time: u64,
}

/// Conditions for a transaction to be valid, on top of its sequence number
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    /// Time window
    pub time_bounds: Option<TimeBounds>,
    /// Lowest source account sequence number accepted, otherwise it must be the previous one
    pub min_sequence_number: Option<i64>,
    /// Seconds since the source sequence number last changed
    pub min_sequence_age: u64,
    /// Ledgers since the source sequence number last changed
    pub min_sequence_ledger_gap: u32,
    /// Signers required on top of the source account thresholds
    pub extra_signers: Vec<SignerKey>,
}

/// Free form note attached to a transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Memo {
    /// No memo
    None,
    /// Opaque bytes
    Bytes(Vec<u8>),
}

impl Default for Memo {
    fn default() -> Self {
        Self::None
    }
}

/// Operation and the account it acts on, the transaction source if unset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Account the operation applies to
    pub source_account: Option<PublicKey>,
    /// What to do
    pub body: OperationBody,
}

impl Operation {
    /// Operation acting on the transaction source
    pub fn new(body: OperationBody) -> Self {
        Self {
            source_account: None,
            body,
        }
    }

    /// Operation acting on `account`
    pub fn with_source(account: PublicKey, body: OperationBody) -> Self {
        Self {
            source_account: Some(account),
            body,
        }
    }
}

/// Operations the channel transactions use
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    /// Raise the sequence number to `bump_to`, a no-op when lower
    BumpSequence {
        /// Target sequence number
        bump_to: i64,
    },
    /// Change weights, thresholds and signers
    SetOptions {
        /// Weight of the account own key
        master_weight: Option<u8>,
        /// Threshold for low operations
        low_threshold: Option<u8>,
        /// Threshold for medium operations
        med_threshold: Option<u8>,
        /// Threshold for high operations
        high_threshold: Option<u8>,
        /// Signer to add, update or remove
        signer: Option<Signer>,
    },
    /// Send `amount` of `asset`
    Payment {
        /// Receiving account
        destination: PublicKey,
        /// Sent asset
        asset: Asset,
        /// Sent amount
        amount: i64,
    },
    /// Create or update a trustline
    ChangeTrust {
        /// Trusted asset
        asset: Asset,
        /// Maximum held
        limit: i64,
    },
    /// Pay the reserves of the entries `sponsored_id` creates until the matching end
    BeginSponsoringFutureReserves {
        /// Sponsored account
        sponsored_id: PublicKey,
    },
    /// End a sponsorship started for the source account
    EndSponsoringFutureReserves,
}

/// Ledger transaction, without its signatures
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Account consuming the sequence number
    pub source_account: PublicKey,
    /// Fee paid, channel transactions carry none and are fee-bumped by the submitter
    pub fee: u32,
    /// Sequence number consumed
    pub sequence_number: i64,
    /// Validity conditions
    pub preconditions: Preconditions,
    /// Note
    pub memo: Memo,
    /// Applied in order, all or nothing
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// Hash under which this transaction is signed
    pub fn hash(&self, network_passphrase: &str) -> Result<Hash, Error> {
        transaction_hash(self, network_passphrase)
    }
}

/// Transaction with its signatures, as submitted and as seen on the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    /// Signed transaction
    pub tx: Transaction,
    /// Signatures over its hash, or over signed payloads
    pub signatures: SignatureSet,
}

impl TransactionEnvelope {
    /// Envelope without any signature yet
    pub fn unsigned(tx: Transaction) -> Self {
        Self {
            tx,
            signatures: SignatureSet::new(),
        }
    }
}
