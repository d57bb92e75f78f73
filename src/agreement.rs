//! Agreements exchanged by the participants, with the signatures collected so far.
//!
//! An agreement is a value: both participants holding the same one means they hold equal
//! details and signatures. Transactions are rebuilt from the details by whoever receives one,
//! so they are carried along but never part of the equality.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    keys::{KeyPair, PublicKey},
    ledger::{Asset, Hash},
    signature::{self, Check, DecoratedSignature},
    txbuild::Built,
};

/// Parameters both participants agree on to open a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDetails {
    /// Delay a close waits after its declaration
    pub observation_period_time: Duration,
    /// Ledgers a close waits after its declaration
    pub observation_period_ledger_gap: u32,
    /// Single asset of the channel
    pub asset: Asset,
    /// After which the formation can't be submitted anymore
    pub expires_at: DateTime<Utc>,
    /// Sequence of the formation, one after the initiator channel account one
    pub starting_sequence: i64,
    /// Signer proposing the open
    pub proposing_signer: PublicKey,
    /// Signer confirming the open
    pub confirming_signer: PublicKey,
}

/// Signatures of one participant on the open transactions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSignatures {
    /// On the first close
    pub close: Option<DecoratedSignature>,
    /// On the first declaration
    pub declaration: Option<DecoratedSignature>,
    /// On the formation
    pub formation: Option<DecoratedSignature>,
}

impl OpenSignatures {
    /// Whether no signature is present
    pub fn is_empty(&self) -> bool {
        self.close.is_none() && self.declaration.is_none() && self.formation.is_none()
    }

    /// Sign the close then the declaration, the declaration depending on the close hash
    pub fn sign_declaration_and_close(txs: &OpenTransactions, key: &KeyPair) -> Self {
        let close = signature::sign(&txs.close.hash, key);
        let declaration = signature::sign(&txs.declaration.hash, key);

        Self {
            close: Some(close),
            declaration: Some(declaration),
            formation: None,
        }
    }

    /// Sign all three transactions
    pub fn sign_all(txs: &OpenTransactions, key: &KeyPair) -> Self {
        Self {
            formation: Some(signature::sign(&txs.formation.hash, key)),
            ..Self::sign_declaration_and_close(txs, key)
        }
    }

    /// Checks of the present signatures of `signer`, the formation one only if `with_formation`
    pub fn checks<'a>(
        &'a self,
        txs: &OpenTransactions,
        signer: PublicKey,
        with_formation: bool,
    ) -> Vec<Check<'a>> {
        let mut checks = vec![
            Check {
                hash: txs.close.hash,
                signer,
                signature: self.close.as_ref(),
            },
            Check {
                hash: txs.declaration.hash,
                signer,
                signature: self.declaration.as_ref(),
            },
        ];
        if with_formation {
            checks.push(Check {
                hash: txs.formation.hash,
                signer,
                signature: self.formation.as_ref(),
            });
        }

        checks
    }
}

/// Transactions realizing an open
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTransactions {
    /// Declaration of the first iteration
    pub declaration: Built,
    /// Close of the first iteration
    pub close: Built,
    /// Formation of the channel
    pub formation: Built,
}

/// Open agreement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenEnvelope {
    /// Agreed parameters
    pub details: OpenDetails,
    /// Signatures of the proposer
    pub proposer_signatures: OpenSignatures,
    /// Signatures of the confirmer, empty until confirmed
    pub confirmer_signatures: OpenSignatures,
    /// Transactions built from the details
    pub transactions: OpenTransactions,
}

impl PartialEq for OpenEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details
            && self.proposer_signatures == other.proposer_signatures
            && self.confirmer_signatures == other.confirmer_signatures
    }
}

impl Eq for OpenEnvelope {}

impl OpenEnvelope {
    /// Signatures made by `signer`, if it takes part in the agreement
    pub fn signatures_for(&self, signer: &PublicKey) -> Option<&OpenSignatures> {
        if signer == &self.details.proposing_signer {
            Some(&self.proposer_signatures)
        } else if signer == &self.details.confirming_signer {
            Some(&self.confirmer_signatures)
        } else {
            None
        }
    }

    /// Whether every transaction carries a valid signature of both participants
    pub fn is_authorized(&self) -> bool {
        let mut checks = self.proposer_signatures.checks(
            &self.transactions,
            self.details.proposing_signer,
            true,
        );
        checks.extend(self.confirmer_signatures.checks(
            &self.transactions,
            self.details.confirming_signer,
            true,
        ));

        signature::verify_set(&checks).is_ok()
    }

    /// First close agreement, implied by the open
    pub fn close_agreement(&self) -> CloseEnvelope {
        let strip = |sigs: &OpenSignatures| CloseSignatures {
            declaration: sigs.declaration.clone(),
            close: sigs.close.clone(),
        };

        CloseEnvelope {
            details: CloseDetails {
                kind: CloseKind::Payment,
                observation_period_time: self.details.observation_period_time,
                observation_period_ledger_gap: self.details.observation_period_ledger_gap,
                iteration_number: 1,
                balance: 0,
                payment_amount: 0,
                proposing_signer: self.details.proposing_signer,
                confirming_signer: self.details.confirming_signer,
                memo: vec![],
            },
            proposer_signatures: strip(&self.proposer_signatures),
            confirmer_signatures: strip(&self.confirmer_signatures),
            transactions: CloseTransactions {
                declaration: self.transactions.declaration.clone(),
                close: self.transactions.close.clone(),
            },
        }
    }
}

/// What a close agreement was made for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseKind {
    /// Moves the balance, closable after the observation period
    Payment,
    /// Ends the channel at the current balance, no payment follows
    Coordinated,
}

/// Parameters of a close agreement, each payment being one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseDetails {
    /// Payment or coordinated close
    pub kind: CloseKind,
    /// Delay the close waits after the declaration, zero for a coordinated close
    pub observation_period_time: Duration,
    /// Ledgers the close waits after the declaration, zero for a coordinated close
    pub observation_period_ledger_gap: u32,
    /// Strictly increasing, one being the open
    pub iteration_number: i64,
    /// Owed by the initiator to the responder when positive, the other way when negative
    pub balance: i64,
    /// Amount moved by this agreement
    pub payment_amount: i64,
    /// Signer proposing the agreement, the payer
    pub proposing_signer: PublicKey,
    /// Signer confirming the agreement, the payee
    pub confirming_signer: PublicKey,
    /// Free form note
    pub memo: Vec<u8>,
}

impl CloseDetails {
    /// Whether no wait is needed between declaration and close
    pub fn has_no_observation_period(&self) -> bool {
        self.observation_period_time == Duration::ZERO && self.observation_period_ledger_gap == 0
    }
}

/// Signatures of one participant on a close agreement
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignatures {
    /// On the declaration
    pub declaration: Option<DecoratedSignature>,
    /// On the close
    pub close: Option<DecoratedSignature>,
}

impl CloseSignatures {
    /// Whether no signature is present
    pub fn is_empty(&self) -> bool {
        self.declaration.is_none() && self.close.is_none()
    }

    /// Sign the close then the declaration, the declaration depending on the close hash
    pub fn sign(txs: &CloseTransactions, key: &KeyPair) -> Self {
        let close = signature::sign(&txs.close.hash, key);
        let declaration = signature::sign(&txs.declaration.hash, key);

        Self {
            declaration: Some(declaration),
            close: Some(close),
        }
    }

    /// Checks of both signatures of `signer`
    pub fn checks<'a>(&'a self, txs: &CloseTransactions, signer: PublicKey) -> [Check<'a>; 2] {
        [
            Check {
                hash: txs.declaration.hash,
                signer,
                signature: self.declaration.as_ref(),
            },
            Check {
                hash: txs.close.hash,
                signer,
                signature: self.close.as_ref(),
            },
        ]
    }

    /// Verify both signatures of `signer`
    pub fn verify(&self, txs: &CloseTransactions, signer: PublicKey) -> Result<(), signature::Error> {
        signature::verify_set(&self.checks(txs, signer))
    }
}

/// Transactions realizing a close agreement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTransactions {
    /// Declaration, opening the observation period
    pub declaration: Built,
    /// Close, paying out once the observation period is over
    pub close: Built,
}

/// Close agreement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseEnvelope {
    /// Agreed parameters
    pub details: CloseDetails,
    /// Signatures of the proposer
    pub proposer_signatures: CloseSignatures,
    /// Signatures of the confirmer, empty until confirmed
    pub confirmer_signatures: CloseSignatures,
    /// Transactions built from the details
    pub transactions: CloseTransactions,
}

impl PartialEq for CloseEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details
            && self.proposer_signatures == other.proposer_signatures
            && self.confirmer_signatures == other.confirmer_signatures
    }
}

impl Eq for CloseEnvelope {}

impl CloseEnvelope {
    /// Signatures made by `signer`, if it takes part in the agreement
    pub fn signatures_for(&self, signer: &PublicKey) -> Option<&CloseSignatures> {
        if signer == &self.details.proposing_signer {
            Some(&self.proposer_signatures)
        } else if signer == &self.details.confirming_signer {
            Some(&self.confirmer_signatures)
        } else {
            None
        }
    }

    /// Hash of the declaration
    pub fn declaration_hash(&self) -> Hash {
        self.transactions.declaration.hash
    }

    /// Hash of the close
    pub fn close_hash(&self) -> Hash {
        self.transactions.close.hash
    }

    /// Whether both transactions carry a valid signature of both participants
    pub fn is_authorized(&self) -> bool {
        let checks = self
            .proposer_signatures
            .checks(&self.transactions, self.details.proposing_signer)
            .into_iter()
            .chain(
                self.confirmer_signatures
                    .checks(&self.transactions, self.details.confirming_signer),
            )
            .collect::<Vec<_>>();

        signature::verify_set(&checks).is_ok()
    }
}
