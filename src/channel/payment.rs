use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info};

use super::{
    AlreadyClosing, BalanceOverflow, Channel, ConfirmerMismatch, ConflictingUnauthorized,
    InvalidSignature, IterationMismatch, NegativePayment, NoPendingAgreement, NotAuthorized,
    NotOpen, NotSigner, ObservationPeriodMismatch, PaymentAmountMismatch, PullPaymentRejected,
    Result, State, Underfunded, UnexpectedCloseKind,
};
use crate::agreement::{CloseDetails, CloseEnvelope, CloseKind, CloseSignatures};

impl Channel {
    /// Propose paying `amount` to the other participant
    pub fn propose_payment(&mut self, amount: i64) -> Result<CloseEnvelope> {
        self.propose_payment_with_memo(amount, vec![])
    }

    /// Propose paying `amount` to the other participant, with a note attached
    ///
    /// A zero amount is accepted, moving nothing but the iteration.
    pub fn propose_payment_with_memo(&mut self, amount: i64, memo: Vec<u8>) -> Result<CloseEnvelope> {
        ensure!(self.state() == State::Open, NotOpen);
        ensure!(!self.coordinated_close_started(), AlreadyClosing);
        ensure!(
            self.latest_unauthorized_close_agreement.is_none(),
            ConflictingUnauthorized
        );
        ensure!(amount >= 0, NegativePayment { amount });

        let balance = if self.initiator {
            self.balance().checked_add(amount)
        } else {
            self.balance().checked_sub(amount)
        }
        .context(BalanceOverflow)?;

        if amount > 0 {
            let owed = self.amount_to_remote(balance);
            let available = self.local_channel_account.balance;
            ensure!(owed <= available, Underfunded { available, owed });
        }

        let open = self.open_details()?;
        let details = CloseDetails {
            kind: CloseKind::Payment,
            observation_period_time: open.observation_period_time,
            observation_period_ledger_gap: open.observation_period_ledger_gap,
            iteration_number: self.next_iteration_number(),
            balance,
            payment_amount: amount,
            proposing_signer: self.local_signer.public(),
            confirming_signer: self.remote_signer,
            memo,
        };

        self.propose_close_agreement(details)
    }

    /// Confirm a payment
    ///
    /// The payee checks the proposal and returns it signed. The payer, receiving it back, takes
    /// the payee signatures and holds the payment as authorized.
    pub fn confirm_payment(&mut self, envelope: CloseEnvelope) -> Result<CloseEnvelope> {
        self.validate_payment(&envelope.details)?;

        self.confirm_close_agreement(envelope)
    }

    /// Authorize the confirmed payment with the final signatures of the payer
    pub fn finalize_payment(&mut self, signatures: CloseSignatures) -> Result<CloseEnvelope> {
        self.finalize_close_agreement(signatures)
    }

    fn validate_payment(&self, details: &CloseDetails) -> Result<()> {
        ensure!(self.state() == State::Open, NotOpen);
        ensure!(!self.coordinated_close_started(), AlreadyClosing);
        self.validate_pending(details)?;
        self.validate_participants(details)?;
        ensure!(
            details.kind == CloseKind::Payment,
            UnexpectedCloseKind { kind: details.kind }
        );

        let open = self.open_details()?;
        ensure!(
            details.observation_period_time == open.observation_period_time
                && details.observation_period_ledger_gap == open.observation_period_ledger_gap,
            ObservationPeriodMismatch
        );

        let delta = details
            .balance
            .checked_sub(self.balance())
            .context(BalanceOverflow)?;
        let pushed = if details.proposing_signer == self.initiator_signer() {
            delta >= 0
        } else {
            delta <= 0
        };
        ensure!(pushed, PullPaymentRejected);

        let amount = details.payment_amount;
        ensure!(amount >= 0, NegativePayment { amount });
        ensure!(
            delta.checked_abs() == Some(amount),
            PaymentAmountMismatch { amount, delta }
        );

        if amount > 0 {
            self.validate_proposer_funds(details)?;
        }

        Ok(())
    }

    /// Details must be the ones in progress, if any
    pub(super) fn validate_pending(&self, details: &CloseDetails) -> Result<()> {
        if let Some(pending) = &self.latest_unauthorized_close_agreement {
            ensure!(&pending.details == details, ConflictingUnauthorized);
        }

        Ok(())
    }

    /// Signers and iteration of an incoming close agreement
    pub(super) fn validate_participants(&self, details: &CloseDetails) -> Result<()> {
        for signer in [&details.proposing_signer, &details.confirming_signer] {
            ensure!(self.is_signer(signer), NotSigner { signer: *signer });
        }

        let local = self.local_signer.public();
        let expected = if details.proposing_signer == local {
            self.remote_signer
        } else {
            local
        };
        ensure!(
            details.confirming_signer == expected,
            ConfirmerMismatch { expected }
        );

        let expected = self.next_iteration_number();
        ensure!(
            details.iteration_number == expected,
            IterationMismatch {
                got: details.iteration_number,
                expected,
            }
        );

        Ok(())
    }

    fn validate_proposer_funds(&self, details: &CloseDetails) -> Result<()> {
        let (account, owed) = if details.proposing_signer == self.local_signer.public() {
            (
                &self.local_channel_account,
                self.amount_to_remote(details.balance),
            )
        } else {
            (
                &self.remote_channel_account,
                self.amount_to_local(details.balance),
            )
        };

        ensure!(
            owed <= account.balance,
            Underfunded {
                available: account.balance,
                owed,
            }
        );

        Ok(())
    }

    /// Sign `details` and hold them as the agreement in progress
    pub(super) fn propose_close_agreement(&mut self, details: CloseDetails) -> Result<CloseEnvelope> {
        let transactions = self.close_txs_for(&details)?;

        let envelope = CloseEnvelope {
            proposer_signatures: CloseSignatures::sign(&transactions, &self.local_signer),
            confirmer_signatures: CloseSignatures::default(),
            details,
            transactions,
        };

        debug!(
            "proposed iteration {} with balance {}",
            envelope.details.iteration_number, envelope.details.balance
        );
        self.latest_unauthorized_close_agreement = Some(envelope.clone());

        Ok(envelope)
    }

    /// Confirm an already validated close agreement, as its confirmer or back at its proposer
    pub(super) fn confirm_close_agreement(&mut self, envelope: CloseEnvelope) -> Result<CloseEnvelope> {
        let local = self.local_signer.public();
        let transactions = self.close_txs_for(&envelope.details)?;

        envelope
            .proposer_signatures
            .verify(&transactions, envelope.details.proposing_signer)
            .context(InvalidSignature)?;

        if envelope.details.proposing_signer == local {
            let pending = self
                .latest_unauthorized_close_agreement
                .as_ref()
                .context(NoPendingAgreement)?;
            envelope
                .confirmer_signatures
                .verify(&transactions, envelope.details.confirming_signer)
                .context(InvalidSignature)?;

            let authorized = CloseEnvelope {
                details: envelope.details,
                proposer_signatures: pending.proposer_signatures.clone(),
                confirmer_signatures: envelope.confirmer_signatures,
                transactions,
            };
            self.promote(authorized.clone());

            Ok(authorized)
        } else {
            ensure!(
                envelope.details.confirming_signer == local,
                ConfirmerMismatch { expected: local }
            );

            let confirmed = CloseEnvelope {
                confirmer_signatures: CloseSignatures::sign(&transactions, &self.local_signer),
                details: envelope.details,
                proposer_signatures: envelope.proposer_signatures,
                transactions,
            };
            debug!(
                "confirmed iteration {} with balance {}",
                confirmed.details.iteration_number, confirmed.details.balance
            );
            self.latest_unauthorized_close_agreement = Some(confirmed.clone());

            Ok(confirmed)
        }
    }

    /// Authorize the agreement this participant confirmed, given the proposer final signatures
    pub(super) fn finalize_close_agreement(
        &mut self,
        signatures: CloseSignatures,
    ) -> Result<CloseEnvelope> {
        let local = self.local_signer.public();
        let pending = self
            .latest_unauthorized_close_agreement
            .as_ref()
            .context(NoPendingAgreement)?;
        ensure!(
            pending.details.confirming_signer == local,
            ConfirmerMismatch { expected: local }
        );

        signatures
            .verify(&pending.transactions, pending.details.proposing_signer)
            .context(InvalidSignature)?;

        let authorized = CloseEnvelope {
            proposer_signatures: signatures,
            ..pending.clone()
        };
        ensure!(authorized.is_authorized(), NotAuthorized);
        self.promote(authorized.clone());

        Ok(authorized)
    }

    /// Hold `authorized` as the latest agreement, dropping the one in progress
    pub(super) fn promote(&mut self, authorized: CloseEnvelope) {
        info!(
            "authorized iteration {} with balance {}",
            authorized.details.iteration_number, authorized.details.balance
        );

        self.latest_authorized_close_agreement = Some(authorized);
        self.latest_unauthorized_close_agreement = None;
    }
}
