use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info, warn};

use super::{Channel, Decode, Encode, IngestionInvalidFormation, Result, State};
use crate::{
    agreement::{CloseSignatures, OpenDetails},
    ledger::{
        self, Hash, SignerKey, Thresholds, Transaction, TransactionEnvelope, TransactionMeta,
        TransactionResult,
    },
    txbuild::{self, FORMED_THRESHOLD},
};

/// Transaction accepted by the ledger, as streamed to the participants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRecord {
    /// Opaque position in the stream, to resume from
    pub cursor: String,
    /// Strictly increasing across the stream
    pub order_id: i64,
    /// Encoded [`TransactionEnvelope`]
    pub tx: Vec<u8>,
    /// Encoded [`TransactionResult`]
    pub result: Vec<u8>,
    /// Encoded [`TransactionMeta`]
    pub result_meta: Vec<u8>,
}

/// What an ingested transaction changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The formation executed with the agreed ledger entries
    pub formation: bool,
    /// Iteration of the declaration executed
    pub declaration: Option<i64>,
    /// Iteration of the close executed
    pub close: Option<i64>,
    /// Agreement in progress authorized from the signatures published on the ledger
    pub recovered_signatures: bool,
    /// A cached channel account balance changed
    pub balances_updated: bool,
}

impl Channel {
    /// Update the channel from a transaction accepted by the ledger
    ///
    /// Failed transactions only advance the cursor. A formation executed with unexpected ledger
    /// entries still updates the balances before failing.
    pub fn ingest_tx(&mut self, record: &IngestRecord) -> Result<IngestOutcome> {
        let envelope: TransactionEnvelope = ledger::decode(&record.tx).context(Decode)?;
        let result: TransactionResult = ledger::decode(&record.result).context(Decode)?;
        let meta: TransactionMeta = ledger::decode(&record.result_meta).context(Decode)?;

        self.last_ingested_cursor = Some(record.cursor.clone());

        let mut outcome = IngestOutcome::default();
        if !result.successful() {
            debug!(
                "skipped failed transaction {} at {}",
                envelope.tx.sequence_number, record.cursor
            );
            return Ok(outcome);
        }

        let hash = envelope.tx.hash(&self.network_passphrase).context(Encode)?;

        let formation = match &self.open_agreement {
            Some(open) if open.transactions.formation.hash == hash => {
                Some(self.validate_formation(&open.details, &meta))
            }
            _ => None,
        };
        let invalid_formation = match formation {
            Some(Ok(())) => {
                info!("formation executed");
                self.open_executed_and_validated = true;
                outcome.formation = true;
                None
            }
            Some(Err(err)) => {
                warn!("formation executed but {}", err);
                self.open_executed_and_validated = false;
                Some(err)
            }
            None => None,
        };

        outcome.recovered_signatures = self.recover_unauthorized(&envelope, hash);
        self.ingest_sequence(&envelope.tx, &mut outcome);
        outcome.balances_updated = self.ingest_balances(&meta);

        match invalid_formation {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn validate_formation(&self, details: &OpenDetails, meta: &TransactionMeta) -> Result<()> {
        let expected_thresholds = Thresholds {
            master_weight: 0,
            low: FORMED_THRESHOLD,
            med: FORMED_THRESHOLD,
            high: FORMED_THRESHOLD,
        };
        let expected_signers = [self.initiator_signer(), self.responder_signer()];

        for address in [
            self.initiator_channel_account().address,
            self.responder_channel_account().address,
        ] {
            let account = meta
                .last_account(&address)
                .context(IngestionInvalidFormation {
                    reason: format!("no state of account {}", address),
                })?;

            ensure!(
                account.thresholds == expected_thresholds,
                IngestionInvalidFormation {
                    reason: format!("thresholds of {} are {:?}", address, account.thresholds),
                }
            );
            ensure!(
                account.signers.len() == expected_signers.len()
                    && expected_signers.iter().all(|signer| {
                        account.signers.iter().any(|s| {
                            s.key == SignerKey::Ed25519(*signer) && s.weight == 1
                        })
                    }),
                IngestionInvalidFormation {
                    reason: format!("unexpected signers of {}", address),
                }
            );

            if !details.asset.is_native() {
                let line = meta
                    .last_trustline(&address, &details.asset)
                    .context(IngestionInvalidFormation {
                        reason: format!("no trustline of {} for {}", address, details.asset),
                    })?;
                ensure!(
                    line.authorized,
                    IngestionInvalidFormation {
                        reason: format!("trustline of {} not authorized", address),
                    }
                );
            }
        }

        Ok(())
    }

    /// Authorize the agreement in progress if `envelope` is its declaration
    ///
    /// Submitting the declaration published the confirmer signatures over both transactions.
    fn recover_unauthorized(&mut self, envelope: &TransactionEnvelope, hash: Hash) -> bool {
        let pending = match &self.latest_unauthorized_close_agreement {
            Some(pending) if pending.declaration_hash() == hash => pending,
            _ => return false,
        };

        let mut recovered = pending.clone();
        if pending.details.proposing_signer == self.local_signer.public() {
            let confirmer = pending.details.confirming_signer;
            recovered.confirmer_signatures = CloseSignatures {
                declaration: envelope
                    .signatures
                    .find(&pending.declaration_hash(), &confirmer)
                    .cloned(),
                close: envelope
                    .signatures
                    .find(&pending.close_hash(), &confirmer)
                    .cloned(),
            };
        }

        if !recovered.is_authorized() {
            warn!(
                "declaration of iteration {} executed without the expected signatures",
                pending.details.iteration_number
            );
            return false;
        }

        info!(
            "recovered signatures of iteration {} from the ledger",
            recovered.details.iteration_number
        );
        self.promote(recovered);

        true
    }

    fn ingest_sequence(&mut self, tx: &Transaction, outcome: &mut IngestOutcome) {
        if tx.source_account == self.local_channel_account.address {
            self.local_channel_account.sequence_number = tx.sequence_number;
        } else if tx.source_account == self.remote_channel_account.address {
            self.remote_channel_account.sequence_number = tx.sequence_number;
        }

        if tx.source_account != self.initiator_channel_account().address {
            return;
        }
        let starting_sequence = match &self.open_agreement {
            Some(open) => open.details.starting_sequence,
            None => return,
        };

        match txbuild::iteration_of_sequence(starting_sequence, tx.sequence_number) {
            Some((0, _)) | None => {}
            Some((iteration, false)) => {
                outcome.declaration = Some(iteration);
                if self.state() == State::ClosingWithOutdatedState {
                    warn!(
                        "declaration of outdated iteration {} executed, latest is {}",
                        iteration,
                        self.latest_authorized_close_agreement
                            .as_ref()
                            .map(|latest| latest.details.iteration_number)
                            .unwrap_or_default()
                    );
                } else {
                    info!("declaration of iteration {} executed", iteration);
                }
            }
            Some((iteration, true)) => {
                info!("close of iteration {} executed", iteration);
                outcome.close = Some(iteration);
            }
        }
    }

    fn ingest_balances(&mut self, meta: &TransactionMeta) -> bool {
        let asset = self
            .open_agreement
            .as_ref()
            .map(|open| open.details.asset.clone())
            .unwrap_or_default();

        let mut updated = false;
        for account in [&mut self.local_channel_account, &mut self.remote_channel_account] {
            let balance = meta
                .post_states()
                .filter(|entry| entry.account_id() == &account.address)
                .filter_map(|entry| entry.balance_of(&asset))
                .last();

            if let Some(balance) = balance {
                if balance != account.balance {
                    debug!(
                        "balance of {} went from {} to {}",
                        account.address, account.balance, balance
                    );
                    account.balance = balance;
                    updated = true;
                }
            }
        }

        updated
    }
}
