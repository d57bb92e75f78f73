//! Channel state machine.
//!
//! A [`Channel`] holds one participant's view: the open agreement, the latest close agreement
//! signed by both participants, and at most one close agreement still missing signatures. Every
//! operation takes `&mut self`, so holding the channel is holding its lock; nothing in here does
//! I/O. Ingestion of ledger transactions moves the channel through its [`State`]s.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    agreement::{
        CloseDetails, CloseEnvelope, CloseKind, CloseTransactions, OpenDetails, OpenEnvelope,
        OpenTransactions,
    },
    keys::{KeyPair, PublicKey},
    ledger::{self, Asset},
    signature,
    txbuild::{self, CloseParams, DeclarationParams, FormationParams},
};

mod close;
mod ingest;
mod open;
mod payment;
mod snapshot;

pub use ingest::{IngestOutcome, IngestRecord};
pub use open::OpenParams;
pub use snapshot::Snapshot;

/// Refusals of channel operations
#[derive(Debug, Snafu)]
pub enum Error {
    /// Channel account of the payer can't cover what it would owe
    #[snafu(display("underfunded: {} available, {} owed", available, owed))]
    Underfunded {
        /// Cached balance of the payer channel account
        available: i64,
        /// Owed once the payment is agreed
        owed: i64,
    },
    /// Signature missing or not verifying
    #[snafu(display("invalid signature: {}", source))]
    InvalidSignature {
        /// Failed check
        source: signature::Error,
    },
    /// Key is neither participant signer
    #[snafu(display("not a signer of the channel: {}", signer))]
    NotSigner {
        /// Foreign key
        signer: PublicKey,
    },
    /// Formation not executed, or channel closing
    #[snafu(display("channel is not open"))]
    NotOpen,
    /// Coordinated close proposed or agreed
    #[snafu(display("coordinated close already proposed or accepted"))]
    AlreadyClosing,
    /// Another agreement is in progress
    #[snafu(display("agreement conflicts with the unauthorized one"))]
    ConflictingUnauthorized,
    /// Agreement is not the next iteration
    #[snafu(display("iteration number {} instead of {}", got, expected))]
    IterationMismatch {
        /// Received iteration
        got: i64,
        /// Next iteration
        expected: i64,
    },
    /// Observation period differs from the agreed one
    #[snafu(display("unexpected observation period"))]
    ObservationPeriodMismatch,
    /// Open expires in the past or too far ahead
    #[snafu(display("expiry out of range: {}", expires_at))]
    ExpiryOutOfRange {
        /// Proposed expiry
        expires_at: DateTime<Utc>,
    },
    /// Confirmer is not the expected participant
    #[snafu(display("confirming signer is not {}", expected))]
    ConfirmerMismatch {
        /// Expected confirmer
        expected: PublicKey,
    },
    /// Payment confirmed as a close, or the reverse
    #[snafu(display("unexpected close agreement kind: {:?}", kind))]
    UnexpectedCloseKind {
        /// Received kind
        kind: CloseKind,
    },
    /// Payment moving value to its proposer
    #[snafu(display("close agreement is a payment to the proposer"))]
    PullPaymentRejected,
    /// Payment amount below zero
    #[snafu(display("negative payment amount: {}", amount))]
    NegativePayment {
        /// Proposed amount
        amount: i64,
    },
    /// No agreement in progress to complete
    #[snafu(display("no unauthorized close agreement to finalize"))]
    NoPendingAgreement,
    /// Formation left the ledger in another shape than agreed
    #[snafu(display("formation executed with unexpected ledger entries: {}", reason))]
    IngestionInvalidFormation {
        /// What differs
        reason: String,
    },

    /// Responder tried to propose the open
    #[snafu(display("only the initiator proposes the open"))]
    NotInitiator,
    /// Open already agreed
    #[snafu(display("channel already open"))]
    AlreadyOpen,
    /// Open details differ from the ones held
    #[snafu(display("open details differ from the agreed ones"))]
    OpenDetailsMismatch,
    /// Formation sequence does not follow the initiator account
    #[snafu(display("starting sequence {} instead of {}", got, expected))]
    StartingSequenceMismatch {
        /// Proposed starting sequence
        got: i64,
        /// Expected starting sequence
        expected: i64,
    },
    /// Stated amount differs from the balance change
    #[snafu(display("payment amount {} does not match a balance change of {}", amount, delta))]
    PaymentAmountMismatch {
        /// Stated amount
        amount: i64,
        /// Balance change
        delta: i64,
    },
    /// Coordinated close at another balance than the latest one
    #[snafu(display("balance {} instead of {}", got, expected))]
    BalanceMismatch {
        /// Proposed balance
        got: i64,
        /// Latest balance
        expected: i64,
    },
    /// Balance does not fit
    #[snafu(display("balance overflow"))]
    BalanceOverflow,
    /// No agreement signed by both participants
    #[snafu(display("agreement not signed by both participants"))]
    NotAuthorized,
    /// Snapshot taken by another participant
    #[snafu(display("snapshot signer {} is not the local signer", signer))]
    SnapshotSignerMismatch {
        /// Signer of the snapshot
        signer: PublicKey,
    },

    /// Transaction could not be built
    #[snafu(display("build transaction: {}", source))]
    Build {
        /// Cause
        source: txbuild::Error,
    },
    /// Bytes are not the expected ledger object
    #[snafu(display("decode ledger object: {}", source))]
    Decode {
        /// Cause
        source: ledger::Error,
    },
    /// Ledger object could not be encoded
    #[snafu(display("encode ledger object: {}", source))]
    Encode {
        /// Cause
        source: ledger::Error,
    },
}

/// Result of channel operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Immutable parameters of a channel
#[derive(Clone, Debug)]
pub struct Config {
    /// Network the transactions are signed for
    pub network_passphrase: String,
    /// Furthest in the future an open can expire
    pub max_open_expiry: Duration,
    /// Channel account of this participant
    pub local_channel_account: PublicKey,
    /// Channel account of the other participant
    pub remote_channel_account: PublicKey,
    /// Signer of this participant
    pub local_signer: KeyPair,
    /// Signer of the other participant
    pub remote_signer: PublicKey,
}

/// Last known state of a channel account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccount {
    /// Account
    pub address: PublicKey,
    /// Last consumed sequence number
    pub sequence_number: i64,
    /// Held amount of the channel asset
    pub balance: i64,
}

impl ChannelAccount {
    fn new(address: PublicKey) -> Self {
        Self {
            address,
            sequence_number: 0,
            balance: 0,
        }
    }
}

/// Stage of the channel lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// No open agreement
    None,
    /// Open agreed but the formation not seen on the ledger
    Opening,
    /// Formation executed and validated
    Open,
    /// Declaration of the latest agreement executed
    Closing,
    /// Declaration of an older agreement executed, to be contested
    ClosingWithOutdatedState,
    /// A close executed
    Closed,
}

/// One participant's view of a channel
#[derive(Debug)]
pub struct Channel {
    network_passphrase: String,
    max_open_expiry: Duration,
    initiator: bool,
    local_channel_account: ChannelAccount,
    remote_channel_account: ChannelAccount,
    local_signer: KeyPair,
    remote_signer: PublicKey,

    open_agreement: Option<OpenEnvelope>,
    open_executed_and_validated: bool,
    latest_authorized_close_agreement: Option<CloseEnvelope>,
    latest_unauthorized_close_agreement: Option<CloseEnvelope>,

    last_ingested_cursor: Option<String>,
}

impl Channel {
    /// Create a channel, the initiator being the participant with the greatest channel account
    pub fn new(config: Config) -> Self {
        let initiator =
            config.local_channel_account.to_string() > config.remote_channel_account.to_string();

        Self {
            network_passphrase: config.network_passphrase,
            max_open_expiry: config.max_open_expiry,
            initiator,
            local_channel_account: ChannelAccount::new(config.local_channel_account),
            remote_channel_account: ChannelAccount::new(config.remote_channel_account),
            local_signer: config.local_signer,
            remote_signer: config.remote_signer,
            open_agreement: None,
            open_executed_and_validated: false,
            latest_authorized_close_agreement: None,
            latest_unauthorized_close_agreement: None,
            last_ingested_cursor: None,
        }
    }

    /// Whether this participant is the initiator
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Network the transactions are signed for
    pub fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    /// Channel account of this participant
    pub fn local_channel_account(&self) -> &ChannelAccount {
        &self.local_channel_account
    }

    /// Channel account of the other participant
    pub fn remote_channel_account(&self) -> &ChannelAccount {
        &self.remote_channel_account
    }

    /// Signer of this participant
    pub fn local_signer(&self) -> PublicKey {
        self.local_signer.public()
    }

    /// Signer of the other participant
    pub fn remote_signer(&self) -> PublicKey {
        self.remote_signer
    }

    /// Update the cached balance of the local channel account
    pub fn update_local_channel_account_balance(&mut self, balance: i64) {
        self.local_channel_account.balance = balance;
    }

    /// Update the cached balance of the remote channel account
    pub fn update_remote_channel_account_balance(&mut self, balance: i64) {
        self.remote_channel_account.balance = balance;
    }

    /// Update the sequence number of the local channel account, as read from the ledger
    pub fn update_local_channel_account_sequence_number(&mut self, sequence_number: i64) {
        self.local_channel_account.sequence_number = sequence_number;
    }

    /// Update the sequence number of the remote channel account, as read from the ledger
    pub fn update_remote_channel_account_sequence_number(&mut self, sequence_number: i64) {
        self.remote_channel_account.sequence_number = sequence_number;
    }

    /// Agreed open, or the one proposed so far
    pub fn open_agreement(&self) -> Option<&OpenEnvelope> {
        self.open_agreement.as_ref()
    }

    /// Whether the formation was seen on the ledger with the expected result
    pub fn is_open_executed_and_validated(&self) -> bool {
        self.open_executed_and_validated
    }

    /// Latest close agreement signed by both participants
    pub fn latest_authorized_close_agreement(&self) -> Option<&CloseEnvelope> {
        self.latest_authorized_close_agreement.as_ref()
    }

    /// Close agreement in progress, missing signatures
    pub fn latest_unauthorized_close_agreement(&self) -> Option<&CloseEnvelope> {
        self.latest_unauthorized_close_agreement.as_ref()
    }

    /// Cursor of the last ingested transaction
    pub fn last_ingested_cursor(&self) -> Option<&str> {
        self.last_ingested_cursor.as_deref()
    }

    /// Drop the close agreement in progress, letting a new one be proposed
    pub fn abandon_unauthorized(&mut self) -> Option<CloseEnvelope> {
        let abandoned = self.latest_unauthorized_close_agreement.take();
        if let Some(envelope) = &abandoned {
            tracing::info!(
                "abandoned unauthorized agreement at iteration {}",
                envelope.details.iteration_number
            );
        }

        abandoned
    }

    /// Balance of the latest authorized agreement, positive when owed by the initiator
    pub fn balance(&self) -> i64 {
        self.latest_authorized_close_agreement
            .as_ref()
            .map(|envelope| envelope.details.balance)
            .unwrap_or_default()
    }

    /// Iteration of the next agreement, the one in progress if any
    pub fn next_iteration_number(&self) -> i64 {
        if let Some(envelope) = &self.latest_unauthorized_close_agreement {
            return envelope.details.iteration_number;
        }

        self.latest_authorized_close_agreement
            .as_ref()
            .map(|envelope| envelope.details.iteration_number + 1)
            .unwrap_or(1)
    }

    /// Current stage, derived from the agreements and the initiator account sequence number
    pub fn state(&self) -> State {
        let open = match &self.open_agreement {
            None => return State::None,
            Some(open) => open,
        };
        if !self.open_executed_and_validated {
            return State::Opening;
        }
        let latest = match &self.latest_authorized_close_agreement {
            None => return State::Opening,
            Some(latest) => latest,
        };

        let sequence_number = self.initiator_channel_account().sequence_number;
        let latest_declaration = latest.transactions.declaration.tx.sequence_number;

        match txbuild::iteration_of_sequence(open.details.starting_sequence, sequence_number) {
            None | Some((0, false)) => State::Open,
            Some((_, true)) => State::Closed,
            Some(_) if sequence_number < latest_declaration => State::ClosingWithOutdatedState,
            Some(_) => State::Closing,
        }
    }

    fn initiator_channel_account(&self) -> &ChannelAccount {
        if self.initiator {
            &self.local_channel_account
        } else {
            &self.remote_channel_account
        }
    }

    fn responder_channel_account(&self) -> &ChannelAccount {
        if self.initiator {
            &self.remote_channel_account
        } else {
            &self.local_channel_account
        }
    }

    fn initiator_signer(&self) -> PublicKey {
        if self.initiator {
            self.local_signer.public()
        } else {
            self.remote_signer
        }
    }

    fn responder_signer(&self) -> PublicKey {
        if self.initiator {
            self.remote_signer
        } else {
            self.local_signer.public()
        }
    }

    /// Amount the local account pays out under `balance`
    fn amount_to_remote(&self, balance: i64) -> i64 {
        if self.initiator {
            balance.max(0)
        } else {
            balance.checked_neg().unwrap_or(i64::MAX).max(0)
        }
    }

    /// Amount the remote account pays out under `balance`
    fn amount_to_local(&self, balance: i64) -> i64 {
        if self.initiator {
            balance.checked_neg().unwrap_or(i64::MAX).max(0)
        } else {
            balance.max(0)
        }
    }

    fn is_signer(&self, signer: &PublicKey) -> bool {
        signer == &self.local_signer.public() || signer == &self.remote_signer
    }

    fn open_details(&self) -> Result<&OpenDetails> {
        self.open_agreement
            .as_ref()
            .map(|open| &open.details)
            .ok_or(Error::NotOpen)
    }

    /// Whether a coordinated close was proposed or accepted
    fn coordinated_close_started(&self) -> bool {
        self.latest_authorized_close_agreement
            .iter()
            .chain(self.latest_unauthorized_close_agreement.iter())
            .any(|envelope| envelope.details.kind == CloseKind::Coordinated)
    }

    fn open_txs(&self, details: &OpenDetails) -> Result<OpenTransactions> {
        let close = self.close_txs_with(
            details.starting_sequence,
            &details.asset,
            &CloseDetails {
                kind: CloseKind::Payment,
                observation_period_time: details.observation_period_time,
                observation_period_ledger_gap: details.observation_period_ledger_gap,
                iteration_number: 1,
                balance: 0,
                payment_amount: 0,
                proposing_signer: details.proposing_signer,
                confirming_signer: details.confirming_signer,
                memo: vec![],
            },
        )?;

        let formation = txbuild::formation(FormationParams {
            network_passphrase: &self.network_passphrase,
            initiator_signer: self.initiator_signer(),
            responder_signer: self.responder_signer(),
            initiator_channel_account: self.initiator_channel_account().address,
            responder_channel_account: self.responder_channel_account().address,
            starting_sequence: details.starting_sequence,
            asset: details.asset.clone(),
            expires_at: details.expires_at,
            declaration_tx_hash: close.declaration.hash,
            close_tx_hash: close.close.hash,
            confirming_signer: details.confirming_signer,
        })
        .context(Build)?;

        Ok(OpenTransactions {
            declaration: close.declaration,
            close: close.close,
            formation,
        })
    }

    /// Rebuild the transactions of a close agreement from its details
    pub fn close_txs_for(&self, details: &CloseDetails) -> Result<CloseTransactions> {
        let open = self.open_details()?;

        self.close_txs_with(open.starting_sequence, &open.asset, details)
    }

    fn close_txs_with(
        &self,
        starting_sequence: i64,
        asset: &Asset,
        details: &CloseDetails,
    ) -> Result<CloseTransactions> {
        let (amount_to_initiator, amount_to_responder) = if details.balance >= 0 {
            (0, details.balance)
        } else {
            (
                details.balance.checked_neg().ok_or(Error::BalanceOverflow)?,
                0,
            )
        };

        let close = txbuild::close(CloseParams {
            network_passphrase: &self.network_passphrase,
            observation_period_time: details.observation_period_time,
            observation_period_ledger_gap: details.observation_period_ledger_gap,
            initiator_signer: self.initiator_signer(),
            responder_signer: self.responder_signer(),
            initiator_channel_account: self.initiator_channel_account().address,
            responder_channel_account: self.responder_channel_account().address,
            starting_sequence,
            iteration_number: details.iteration_number,
            amount_to_initiator,
            amount_to_responder,
            asset: asset.clone(),
        })
        .context(Build)?;

        let declaration = txbuild::declaration(DeclarationParams {
            network_passphrase: &self.network_passphrase,
            initiator_channel_account: self.initiator_channel_account().address,
            starting_sequence,
            iteration_number: details.iteration_number,
            executed_iteration_number: 0,
            confirming_signer: details.confirming_signer,
            close_tx_hash: close.hash,
        })
        .context(Build)?;

        Ok(CloseTransactions { declaration, close })
    }
}
