//! Templates of the ledger transactions realizing an agreement.
//!
//! Iteration `i` of a channel starting at sequence `s` owns two sequence numbers: `s + 2i` for
//! its declaration and `s + 2i + 1` for its close. Iteration zero is the formation, at `s`.
//! Every function here is pure, the same parameters always giving the same hash.

use std::{convert::TryFrom, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::{
    keys::PublicKey,
    ledger::{
        self, Asset, Hash, Memo, Operation, OperationBody, Preconditions, Signer, SignerKey,
        TimeBounds, Transaction,
    },
};

/// Sequence numbers used by each iteration
pub const SEQUENCES_PER_ITERATION: i64 = 2;

/// Errors building a transaction
#[derive(Debug, Snafu)]
pub enum Error {
    /// Iteration below zero
    #[snafu(display("negative iteration number: {}", iteration_number))]
    NegativeIteration {
        /// Given iteration
        iteration_number: i64,
    },
    /// Starting sequence below zero
    #[snafu(display("negative starting sequence: {}", starting_sequence))]
    NegativeStartingSequence {
        /// Given sequence
        starting_sequence: i64,
    },
    /// Sequence of the iteration does not fit
    #[snafu(display("sequence overflow at iteration {}", iteration_number))]
    SequenceOverflow {
        /// Given iteration
        iteration_number: i64,
    },
    /// Payout below zero
    #[snafu(display("negative amount: {}", amount))]
    NegativeAmount {
        /// Given amount
        amount: i64,
    },
    /// Expiry not representable as ledger time
    #[snafu(display("expiry before epoch: {}", expires_at))]
    ExpiryBeforeEpoch {
        /// Given expiry
        expires_at: DateTime<Utc>,
    },
    /// Transaction could not be hashed
    #[snafu(display("hash: {}", source))]
    HashTransaction {
        /// Cause
        source: ledger::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Transaction with the hash it is signed under
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Built {
    /// Unsigned transaction
    pub tx: Transaction,
    /// Its hash
    pub hash: Hash,
}

impl Built {
    fn new(tx: Transaction, network_passphrase: &str) -> Result<Self> {
        let hash = tx.hash(network_passphrase).context(HashTransaction)?;

        Ok(Self { tx, hash })
    }
}

/// First sequence number of `iteration_number`, its declaration one
pub fn sequence_of_iteration(starting_sequence: i64, iteration_number: i64) -> Result<i64> {
    ensure!(
        starting_sequence >= 0,
        NegativeStartingSequence { starting_sequence }
    );
    ensure!(iteration_number >= 0, NegativeIteration { iteration_number });

    iteration_number
        .checked_mul(SEQUENCES_PER_ITERATION)
        .and_then(|offset| starting_sequence.checked_add(offset))
        .context(SequenceOverflow { iteration_number })
}

/// Iteration owning `sequence_number`, and whether it is the close slot of it
pub fn iteration_of_sequence(starting_sequence: i64, sequence_number: i64) -> Option<(i64, bool)> {
    let offset = sequence_number.checked_sub(starting_sequence)?;
    if offset < 0 {
        return None;
    }

    Some((
        offset / SEQUENCES_PER_ITERATION,
        offset % SEQUENCES_PER_ITERATION == 1,
    ))
}

/// Parameters of [`declaration`]
#[derive(Clone, Debug)]
pub struct DeclarationParams<'a> {
    /// Network the hash is computed for
    pub network_passphrase: &'a str,
    /// Source of every channel transaction
    pub initiator_channel_account: PublicKey,
    /// Sequence of the formation
    pub starting_sequence: i64,
    /// Iteration declared
    pub iteration_number: i64,
    /// Latest iteration known to be executed, zero if none
    pub executed_iteration_number: i64,
    /// Signer confirming the agreement
    pub confirming_signer: PublicKey,
    /// Hash of the close transaction paired with this declaration
    pub close_tx_hash: Hash,
}

/// Build the declaration opening the observation period of an iteration
///
/// Requires a signature of the confirming signer over the close hash, so whoever submits it
/// publishes that signature.
pub fn declaration(p: DeclarationParams<'_>) -> Result<Built> {
    let sequence_number = sequence_of_iteration(p.starting_sequence, p.iteration_number)?;
    let min_sequence_number =
        sequence_of_iteration(p.starting_sequence, p.executed_iteration_number)?;

    let tx = Transaction {
        source_account: p.initiator_channel_account,
        fee: 0,
        sequence_number,
        preconditions: Preconditions {
            time_bounds: None,
            min_sequence_number: Some(min_sequence_number),
            min_sequence_age: 0,
            min_sequence_ledger_gap: 0,
            extra_signers: vec![SignerKey::SignedPayload {
                signer: p.confirming_signer,
                payload: p.close_tx_hash.as_bytes().to_vec(),
            }],
        },
        memo: Memo::None,
        operations: vec![Operation::new(OperationBody::BumpSequence { bump_to: 0 })],
    };

    Built::new(tx, p.network_passphrase)
}

/// Parameters of [`close`]
#[derive(Clone, Debug)]
pub struct CloseParams<'a> {
    /// Network the hash is computed for
    pub network_passphrase: &'a str,
    /// Delay between the declaration and this close
    pub observation_period_time: Duration,
    /// Ledgers between the declaration and this close
    pub observation_period_ledger_gap: u32,
    /// Signer of the initiator
    pub initiator_signer: PublicKey,
    /// Signer of the responder
    pub responder_signer: PublicKey,
    /// Channel account of the initiator, source of the transaction
    pub initiator_channel_account: PublicKey,
    /// Channel account of the responder
    pub responder_channel_account: PublicKey,
    /// Sequence of the formation
    pub starting_sequence: i64,
    /// Iteration closed
    pub iteration_number: i64,
    /// Paid by the responder account
    pub amount_to_initiator: i64,
    /// Paid by the initiator account
    pub amount_to_responder: i64,
    /// Channel asset
    pub asset: Asset,
}

/// Build the close paying out an iteration and giving each account back to its owner
pub fn close(p: CloseParams<'_>) -> Result<Built> {
    ensure!(
        p.amount_to_initiator >= 0,
        NegativeAmount {
            amount: p.amount_to_initiator
        }
    );
    ensure!(
        p.amount_to_responder >= 0,
        NegativeAmount {
            amount: p.amount_to_responder
        }
    );

    let sequence_number = sequence_of_iteration(p.starting_sequence, p.iteration_number)?
        .checked_add(1)
        .context(SequenceOverflow {
            iteration_number: p.iteration_number,
        })?;

    let mut operations = vec![
        Operation::with_source(
            p.initiator_channel_account,
            remove_signer(p.responder_signer),
        ),
        Operation::with_source(
            p.responder_channel_account,
            remove_signer(p.initiator_signer),
        ),
    ];
    if p.amount_to_initiator > 0 {
        operations.push(Operation::with_source(
            p.responder_channel_account,
            OperationBody::Payment {
                destination: p.initiator_channel_account,
                asset: p.asset.clone(),
                amount: p.amount_to_initiator,
            },
        ));
    }
    if p.amount_to_responder > 0 {
        operations.push(Operation::with_source(
            p.initiator_channel_account,
            OperationBody::Payment {
                destination: p.responder_channel_account,
                asset: p.asset.clone(),
                amount: p.amount_to_responder,
            },
        ));
    }

    let tx = Transaction {
        source_account: p.initiator_channel_account,
        fee: 0,
        sequence_number,
        preconditions: Preconditions {
            time_bounds: None,
            min_sequence_number: None,
            min_sequence_age: p.observation_period_time.as_secs(),
            min_sequence_ledger_gap: p.observation_period_ledger_gap,
            extra_signers: vec![],
        },
        memo: Memo::None,
        operations,
    };

    Built::new(tx, p.network_passphrase)
}

fn remove_signer(counterparty: PublicKey) -> OperationBody {
    OperationBody::SetOptions {
        master_weight: Some(0),
        low_threshold: Some(1),
        med_threshold: Some(1),
        high_threshold: Some(1),
        signer: Some(Signer {
            key: SignerKey::Ed25519(counterparty),
            weight: 0,
        }),
    }
}

/// Parameters of [`formation`]
#[derive(Clone, Debug)]
pub struct FormationParams<'a> {
    /// Network the hash is computed for
    pub network_passphrase: &'a str,
    /// Signer of the initiator
    pub initiator_signer: PublicKey,
    /// Signer of the responder
    pub responder_signer: PublicKey,
    /// Channel account of the initiator, source of the transaction
    pub initiator_channel_account: PublicKey,
    /// Channel account of the responder
    pub responder_channel_account: PublicKey,
    /// Sequence of the formation
    pub starting_sequence: i64,
    /// Channel asset
    pub asset: Asset,
    /// After which the formation can't be submitted
    pub expires_at: DateTime<Utc>,
    /// Declaration of the first iteration
    pub declaration_tx_hash: Hash,
    /// Close of the first iteration
    pub close_tx_hash: Hash,
    /// Signer confirming the open
    pub confirming_signer: PublicKey,
}

/// Channel-account thresholds once formed
pub const FORMED_THRESHOLD: u8 = 2;

/// Build the formation putting both channel accounts under joint control
///
/// Each account sponsors the reserves of the other one. Submitting it publishes the confirming
/// signer signatures over the first declaration and close.
pub fn formation(p: FormationParams<'_>) -> Result<Built> {
    let max_time = u64::try_from(p.expires_at.timestamp()).ok().context(ExpiryBeforeEpoch {
        expires_at: p.expires_at,
    })?;

    let mut operations = vec![];
    for (sponsor, sponsored, extra_signer) in [
        (
            p.initiator_channel_account,
            p.responder_channel_account,
            p.initiator_signer,
        ),
        (
            p.responder_channel_account,
            p.initiator_channel_account,
            p.responder_signer,
        ),
    ] {
        operations.push(Operation::with_source(
            sponsor,
            OperationBody::BeginSponsoringFutureReserves {
                sponsored_id: sponsored,
            },
        ));
        operations.push(Operation::with_source(
            sponsored,
            OperationBody::SetOptions {
                master_weight: Some(0),
                low_threshold: Some(FORMED_THRESHOLD),
                med_threshold: Some(FORMED_THRESHOLD),
                high_threshold: Some(FORMED_THRESHOLD),
                signer: Some(Signer {
                    key: SignerKey::Ed25519(extra_signer),
                    weight: 1,
                }),
            },
        ));
        if !p.asset.is_native() {
            operations.push(Operation::with_source(
                sponsored,
                OperationBody::ChangeTrust {
                    asset: p.asset.clone(),
                    limit: i64::MAX,
                },
            ));
        }
        operations.push(Operation::with_source(
            sponsored,
            OperationBody::EndSponsoringFutureReserves,
        ));
    }

    let tx = Transaction {
        source_account: p.initiator_channel_account,
        fee: 0,
        sequence_number: sequence_of_iteration(p.starting_sequence, 0)?,
        preconditions: Preconditions {
            time_bounds: Some(TimeBounds {
                min_time: 0,
                max_time,
            }),
            min_sequence_number: None,
            min_sequence_age: 0,
            min_sequence_ledger_gap: 0,
            extra_signers: vec![
                SignerKey::SignedPayload {
                    signer: p.confirming_signer,
                    payload: p.declaration_tx_hash.as_bytes().to_vec(),
                },
                SignerKey::SignedPayload {
                    signer: p.confirming_signer,
                    payload: p.close_tx_hash.as_bytes().to_vec(),
                },
            ],
        },
        memo: Memo::None,
        operations,
    };

    Built::new(tx, p.network_passphrase)
}
