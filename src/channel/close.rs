use std::time::Duration;

use snafu::{ensure, OptionExt};

use super::{
    AlreadyClosing, BalanceMismatch, Channel, ConflictingUnauthorized, NoPendingAgreement,
    NotAuthorized, NotOpen, ObservationPeriodMismatch, PaymentAmountMismatch, Result, State,
    UnexpectedCloseKind,
};
use crate::{
    agreement::{CloseDetails, CloseEnvelope, CloseKind, CloseSignatures},
    ledger::TransactionEnvelope,
    signature::{self, SignatureSet},
};

impl Channel {
    /// Propose closing right away at the current balance
    ///
    /// Once agreed, the close needs no observation period and no further payment is accepted.
    pub fn propose_close(&mut self) -> Result<CloseEnvelope> {
        ensure!(self.state() == State::Open, NotOpen);
        ensure!(!self.coordinated_close_started(), AlreadyClosing);
        ensure!(
            self.latest_unauthorized_close_agreement.is_none(),
            ConflictingUnauthorized
        );

        let details = CloseDetails {
            kind: CloseKind::Coordinated,
            observation_period_time: Duration::ZERO,
            observation_period_ledger_gap: 0,
            iteration_number: self.next_iteration_number(),
            balance: self.balance(),
            payment_amount: 0,
            proposing_signer: self.local_signer.public(),
            confirming_signer: self.remote_signer,
            memo: vec![],
        };

        self.propose_close_agreement(details)
    }

    /// Confirm a coordinated close, as its confirmer or back at its proposer
    pub fn confirm_close(&mut self, envelope: CloseEnvelope) -> Result<CloseEnvelope> {
        let details = &envelope.details;

        ensure!(self.state() == State::Open, NotOpen);
        if self.latest_unauthorized_close_agreement.is_some() {
            self.validate_pending(details)?;
        } else {
            ensure!(!self.coordinated_close_started(), AlreadyClosing);
        }
        self.validate_participants(details)?;

        ensure!(
            details.kind == CloseKind::Coordinated,
            UnexpectedCloseKind { kind: details.kind }
        );
        ensure!(details.has_no_observation_period(), ObservationPeriodMismatch);
        let expected = self.balance();
        ensure!(
            details.balance == expected,
            BalanceMismatch {
                got: details.balance,
                expected,
            }
        );
        ensure!(
            details.payment_amount == 0,
            PaymentAmountMismatch {
                amount: details.payment_amount,
                delta: 0,
            }
        );

        self.confirm_close_agreement(envelope)
    }

    /// Authorize the confirmed close with the final signatures of its proposer
    pub fn finalize_close(&mut self, signatures: CloseSignatures) -> Result<CloseEnvelope> {
        self.finalize_close_agreement(signatures)
    }

    /// Declaration and close of the latest authorized agreement, ready to be submitted in order
    ///
    /// The declaration carries the confirmer signature over the close as a signed payload.
    pub fn close_txs(&self) -> Result<(TransactionEnvelope, TransactionEnvelope)> {
        let latest = self
            .latest_authorized_close_agreement
            .as_ref()
            .context(NotAuthorized)?;

        Ok(close_envelopes(latest))
    }

    /// Declaration and close of the agreement in progress, with the signatures held so far
    ///
    /// A confirmer holds every signature once it signed, and can close on it even if the
    /// proposer never sends its final signatures.
    pub fn unauthorized_close_txs(&self) -> Result<(TransactionEnvelope, TransactionEnvelope)> {
        let pending = self
            .latest_unauthorized_close_agreement
            .as_ref()
            .context(NoPendingAgreement)?;

        Ok(close_envelopes(pending))
    }
}

/// Signed declaration and close of `agreement`, with the signatures it holds so far
pub(super) fn close_envelopes(
    agreement: &CloseEnvelope,
) -> (TransactionEnvelope, TransactionEnvelope) {
    let proposer = &agreement.proposer_signatures;
    let confirmer = &agreement.confirmer_signatures;

    let mut declaration_signatures: SignatureSet = proposer
        .declaration
        .iter()
        .chain(confirmer.declaration.iter())
        .cloned()
        .collect();
    if let Some(close) = &confirmer.close {
        declaration_signatures.insert(signature::as_payload_signature(
            &agreement.details.confirming_signer,
            agreement.close_hash().as_bytes(),
            close,
        ));
    }

    let close_signatures = proposer
        .close
        .iter()
        .chain(confirmer.close.iter())
        .cloned()
        .collect();

    (
        TransactionEnvelope {
            tx: agreement.transactions.declaration.tx.clone(),
            signatures: declaration_signatures,
        },
        TransactionEnvelope {
            tx: agreement.transactions.close.tx.clone(),
            signatures: close_signatures,
        },
    )
}
