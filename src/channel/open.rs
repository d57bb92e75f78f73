use std::time::Duration;

use chrono::{DateTime, Utc};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info};

use super::{
    AlreadyOpen, Channel, ConfirmerMismatch, ExpiryOutOfRange, InvalidSignature,
    NoPendingAgreement, NotAuthorized, NotInitiator, NotOpen, NotSigner, OpenDetailsMismatch,
    Result, StartingSequenceMismatch,
};
use crate::{
    agreement::{OpenDetails, OpenEnvelope, OpenSignatures},
    ledger::{Asset, TransactionEnvelope},
    signature::{self, SignatureSet},
};

/// What the initiator proposes to open the channel with
#[derive(Clone, Debug)]
pub struct OpenParams {
    /// Delay a close waits after its declaration
    pub observation_period_time: Duration,
    /// Ledgers a close waits after its declaration
    pub observation_period_ledger_gap: u32,
    /// Single asset of the channel
    pub asset: Asset,
    /// After which the formation can't be submitted anymore
    pub expires_at: DateTime<Utc>,
}

fn merge(stored: &OpenSignatures, received: OpenSignatures) -> OpenSignatures {
    OpenSignatures {
        close: stored.close.clone().or(received.close),
        declaration: stored.declaration.clone().or(received.declaration),
        formation: stored.formation.clone().or(received.formation),
    }
}

impl Channel {
    /// Propose to open the channel, signing the first declaration and close
    ///
    /// A previous proposal not yet confirmed is replaced.
    pub fn propose_open(&mut self, params: OpenParams) -> Result<OpenEnvelope> {
        ensure!(self.initiator, NotInitiator);
        if let Some(open) = &self.open_agreement {
            ensure!(open.confirmer_signatures.is_empty(), AlreadyOpen);
        }
        self.validate_expiry(params.expires_at)?;

        let details = OpenDetails {
            observation_period_time: params.observation_period_time,
            observation_period_ledger_gap: params.observation_period_ledger_gap,
            asset: params.asset,
            expires_at: params.expires_at,
            starting_sequence: self.expected_starting_sequence(),
            proposing_signer: self.local_signer.public(),
            confirming_signer: self.remote_signer,
        };
        let transactions = self.open_txs(&details)?;

        let envelope = OpenEnvelope {
            proposer_signatures: OpenSignatures::sign_declaration_and_close(
                &transactions,
                &self.local_signer,
            ),
            confirmer_signatures: OpenSignatures::default(),
            details,
            transactions,
        };

        info!(
            "proposed open at sequence {} expiring {}",
            envelope.details.starting_sequence, envelope.details.expires_at
        );
        self.open_agreement = Some(envelope.clone());

        Ok(envelope)
    }

    /// Confirm an open
    ///
    /// The responder verifies the proposal and signs all three transactions. The initiator then
    /// verifies the responder signatures and signs the formation, authorizing the open. Receiving
    /// back the authorized open, the responder takes the initiator formation signature.
    pub fn confirm_open(&mut self, envelope: OpenEnvelope) -> Result<OpenEnvelope> {
        let local = self.local_signer.public();

        let (proposer_signatures, confirmer_signatures, transactions) = match &self.open_agreement
        {
            Some(open) => {
                ensure!(open.details == envelope.details, OpenDetailsMismatch);
                (
                    merge(&open.proposer_signatures, envelope.proposer_signatures),
                    merge(&open.confirmer_signatures, envelope.confirmer_signatures),
                    open.transactions.clone(),
                )
            }
            None => {
                ensure!(
                    envelope.details.proposing_signer != local,
                    NoPendingAgreement
                );
                self.validate_open_details(&envelope.details)?;
                let transactions = self.open_txs(&envelope.details)?;
                (
                    envelope.proposer_signatures,
                    envelope.confirmer_signatures,
                    transactions,
                )
            }
        };
        let details = envelope.details;

        let (proposer_signatures, confirmer_signatures) = if details.proposing_signer == local {
            signature::verify_set(&confirmer_signatures.checks(
                &transactions,
                details.confirming_signer,
                true,
            ))
            .context(InvalidSignature)?;

            let mut proposer_signatures = proposer_signatures;
            if proposer_signatures.formation.is_none() {
                proposer_signatures.formation = Some(signature::sign(
                    &transactions.formation.hash,
                    &self.local_signer,
                ));
            }

            (proposer_signatures, confirmer_signatures)
        } else {
            ensure!(
                details.confirming_signer == local,
                ConfirmerMismatch { expected: local }
            );
            signature::verify_set(&proposer_signatures.checks(
                &transactions,
                details.proposing_signer,
                proposer_signatures.formation.is_some(),
            ))
            .context(InvalidSignature)?;

            let confirmer_signatures = if confirmer_signatures.is_empty() {
                OpenSignatures::sign_all(&transactions, &self.local_signer)
            } else {
                signature::verify_set(&confirmer_signatures.checks(&transactions, local, true))
                    .context(InvalidSignature)?;
                confirmer_signatures
            };

            (proposer_signatures, confirmer_signatures)
        };

        let open = OpenEnvelope {
            details,
            proposer_signatures,
            confirmer_signatures,
            transactions,
        };

        if self.latest_authorized_close_agreement.is_none() {
            let first = open.close_agreement();
            if first.is_authorized() {
                debug!("first close agreement authorized");
                self.latest_authorized_close_agreement = Some(first);
            }
        }
        if open.is_authorized() {
            info!("open authorized");
        }
        self.open_agreement = Some(open.clone());

        Ok(open)
    }

    /// Formation of the authorized open, ready to be submitted
    ///
    /// Carries the confirmer signatures over the first declaration and close as signed payloads.
    pub fn open_tx(&self) -> Result<TransactionEnvelope> {
        let open = self.open_agreement.as_ref().context(NotOpen)?;
        ensure!(open.is_authorized(), NotAuthorized);

        let confirmer = &open.confirmer_signatures;
        let mut signatures: SignatureSet = open
            .proposer_signatures
            .formation
            .iter()
            .chain(confirmer.formation.iter())
            .cloned()
            .collect();
        for (hash, sig) in [
            (&open.transactions.declaration.hash, &confirmer.declaration),
            (&open.transactions.close.hash, &confirmer.close),
        ] {
            if let Some(sig) = sig {
                signatures.insert(signature::as_payload_signature(
                    &open.details.confirming_signer,
                    hash.as_bytes(),
                    sig,
                ));
            }
        }

        Ok(TransactionEnvelope {
            tx: open.transactions.formation.tx.clone(),
            signatures,
        })
    }

    fn expected_starting_sequence(&self) -> i64 {
        self.initiator_channel_account()
            .sequence_number
            .saturating_add(1)
    }

    fn validate_expiry(&self, expires_at: DateTime<Utc>) -> Result<()> {
        let remaining = (expires_at - Utc::now()).to_std().ok();

        ensure!(
            matches!(remaining, Some(remaining) if remaining <= self.max_open_expiry),
            ExpiryOutOfRange { expires_at }
        );

        Ok(())
    }

    fn validate_open_details(&self, details: &OpenDetails) -> Result<()> {
        for signer in [&details.proposing_signer, &details.confirming_signer] {
            ensure!(self.is_signer(signer), NotSigner { signer: *signer });
        }
        ensure!(details.proposing_signer == self.initiator_signer(), NotInitiator);
        ensure!(
            details.confirming_signer == self.responder_signer(),
            ConfirmerMismatch {
                expected: self.responder_signer()
            }
        );

        self.validate_expiry(details.expires_at)?;

        let expected = self.expected_starting_sequence();
        ensure!(
            details.starting_sequence == expected,
            StartingSequenceMismatch {
                got: details.starting_sequence,
                expected,
            }
        );

        Ok(())
    }
}
