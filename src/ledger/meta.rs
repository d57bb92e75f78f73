use serde::{Deserialize, Serialize};

use super::{Asset, Signer};
use crate::keys::PublicKey;

/// Outcome of applying a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Every operation applied
    Success,
    /// An operation failed, nothing but the fee and sequence number applied
    Failed,
    /// Before the time bounds
    TooEarly,
    /// After the time bounds
    TooLate,
    /// Sequence number or minimum sequence number not matching the source account
    BadSequence,
    /// Minimum sequence age or ledger gap not yet reached
    BadMinSequenceAgeOrGap,
    /// Not enough signature weight, or an extra signer missing
    BadAuth,
}

/// Result of a transaction as seen on the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Fee actually charged
    pub fee_charged: i64,
    /// Outcome
    pub code: ResultCode,
}

impl TransactionResult {
    /// Whether the transaction applied
    pub fn successful(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Weight of the master key and signature thresholds of an account
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Weight of the account own key
    pub master_weight: u8,
    /// Needed for low operations, such as sequence bumps
    pub low: u8,
    /// Needed for medium operations, such as payments
    pub med: u8,
    /// Needed for high operations, such as signer changes
    pub high: u8,
}

/// Account state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Account
    pub account_id: PublicKey,
    /// Native balance
    pub balance: i64,
    /// Last consumed sequence number
    pub sequence_number: i64,
    /// Weights and thresholds
    pub thresholds: Thresholds,
    /// Signers other than the master key
    pub signers: Vec<Signer>,
}

/// Holding of a credit asset by an account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLineEntry {
    /// Holding account
    pub account_id: PublicKey,
    /// Held asset
    pub asset: Asset,
    /// Held amount
    pub balance: i64,
    /// Maximum held
    pub limit: i64,
    /// Whether the issuer allows holding
    pub authorized: bool,
}

/// Ledger state entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntry {
    /// Account
    Account(AccountEntry),
    /// Trustline
    TrustLine(TrustLineEntry),
}

impl LedgerEntry {
    /// Account owning this entry
    pub fn account_id(&self) -> &PublicKey {
        match self {
            Self::Account(entry) => &entry.account_id,
            Self::TrustLine(entry) => &entry.account_id,
        }
    }

    /// Amount of `asset` this entry holds, if it holds that asset at all
    pub fn balance_of(&self, asset: &Asset) -> Option<i64> {
        match (self, asset) {
            (Self::Account(entry), Asset::Native) => Some(entry.balance),
            (Self::TrustLine(entry), asset) if &entry.asset == asset => Some(entry.balance),
            _ => None,
        }
    }
}

/// Identifier of a ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKey {
    /// Account
    Account(PublicKey),
    /// Trustline of an account for an asset
    TrustLine {
        /// Holding account
        account_id: PublicKey,
        /// Held asset
        asset: Asset,
    },
}

/// Change to a ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryChange {
    /// Entry before the change
    State(LedgerEntry),
    /// New entry
    Created(LedgerEntry),
    /// Entry after the change
    Updated(LedgerEntry),
    /// Deleted entry
    Removed(LedgerKey),
}

impl LedgerEntryChange {
    /// Entry as left by this change, `None` for states and removals
    pub fn post_state(&self) -> Option<&LedgerEntry> {
        match self {
            Self::Created(entry) | Self::Updated(entry) => Some(entry),
            Self::State(_) | Self::Removed(_) => None,
        }
    }
}

/// Changes made by one operation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMeta {
    /// Changes, in application order
    pub changes: Vec<LedgerEntryChange>,
}

/// Changes made by a transaction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// Changes made before the operations, such as the fee and sequence number
    pub tx_changes_before: Vec<LedgerEntryChange>,
    /// Changes of every operation
    pub operations: Vec<OperationMeta>,
}

impl TransactionMeta {
    /// Every entry as left by a change, in application order
    pub fn post_states(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.tx_changes_before
            .iter()
            .chain(self.operations.iter().flat_map(|op| op.changes.iter()))
            .filter_map(LedgerEntryChange::post_state)
    }

    /// Last state of the account `account_id`
    pub fn last_account(&self, account_id: &PublicKey) -> Option<&AccountEntry> {
        self.post_states()
            .filter_map(|entry| match entry {
                LedgerEntry::Account(account) if &account.account_id == account_id => {
                    Some(account)
                }
                _ => None,
            })
            .last()
    }

    /// Last state of the trustline of `account_id` for `asset`
    pub fn last_trustline(&self, account_id: &PublicKey, asset: &Asset) -> Option<&TrustLineEntry> {
        self.post_states()
            .filter_map(|entry| match entry {
                LedgerEntry::TrustLine(line)
                    if &line.account_id == account_id && &line.asset == asset =>
                {
                    Some(line)
                }
                _ => None,
            })
            .last()
    }
}
