//! Task owning a [`Channel`], exposed through a cloneable handle.
//!
//! Every operation goes through the task, so they run one at a time, ledger I/O included. The
//! agent answers the messages of the other participant, submits what the channel exports and
//! feeds it the transactions the ledger accepted.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    agreement::{CloseEnvelope, CloseSignatures},
    channel::{self, Channel, IngestOutcome, IngestRecord, OpenParams, Snapshot, State},
    keys::PublicKey,
    ledger::{self, Asset, TransactionEnvelope},
    msg::Message,
};

/// Error of the ledger collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Submit transactions to the ledger
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submit an encoded [`TransactionEnvelope`]
    async fn submit(&self, tx: Vec<u8>) -> Result<(), BoxError>;
}

/// Read accounts from the ledger
#[async_trait]
pub trait Collector: Send + Sync {
    /// Last consumed sequence number of `account`
    async fn get_sequence_number(&self, account: PublicKey) -> Result<i64, BoxError>;
    /// Amount of `asset` held by `account`
    async fn get_balance(&self, account: PublicKey, asset: Asset) -> Result<i64, BoxError>;
}

/// Errors of the [`Agent`]
#[derive(Debug, Snafu)]
pub enum Error {
    /// Channel refused the operation
    #[snafu(display("channel: {}", source))]
    ChannelOperation {
        /// Refusal
        source: channel::Error,
    },
    /// Ledger refused a transaction
    #[snafu(display("submit: {}", source))]
    Submit {
        /// Cause
        source: BoxError,
    },
    /// Balance could not be fetched
    #[snafu(display("collect: {}", source))]
    Collect {
        /// Cause
        source: BoxError,
    },
    /// Transaction could not be encoded for submission
    #[snafu(display("encode transaction: {}", source))]
    EncodeTransaction {
        /// Cause
        source: ledger::Error,
    },
    /// Greeting from someone else than the other participant
    #[snafu(display("peer introduced as {} with signer {}", channel_account, signer))]
    UnknownPeer {
        /// Claimed channel account
        channel_account: PublicKey,
        /// Claimed signer
        signer: PublicKey,
    },
    /// Message out of place in the exchange
    #[snafu(display("unexpected {}", kind))]
    UnexpectedMessage {
        /// Name of the message
        kind: &'static str,
    },

    /// Handler stopped before taking the command
    #[snafu(display("gone on send"))]
    GoneOnSend,
    /// Handler stopped before answering
    #[snafu(display("gone on recv"))]
    GoneOnRecv,
}

type Result<T, E = Error> = std::result::Result<T, E>;

type Response<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum Commands {
    Introduce {
        resp: Response<Message>,
    },
    Receive {
        message: Message,
        resp: Response<Option<Message>>,
    },
    ProposeOpen {
        params: OpenParams,
        resp: Response<Message>,
    },
    ProposePayment {
        amount: i64,
        memo: Vec<u8>,
        resp: Response<Message>,
    },
    ProposeClose {
        resp: Response<Message>,
    },
    AbandonUnauthorized {
        resp: oneshot::Sender<Option<CloseEnvelope>>,
    },
    SubmitDeclaration {
        resp: Response<()>,
    },
    SubmitClose {
        resp: Response<()>,
    },
    Ingest {
        record: IngestRecord,
        resp: Response<Option<IngestOutcome>>,
    },
    GetState {
        resp: oneshot::Sender<State>,
    },
    GetBalance {
        resp: oneshot::Sender<i64>,
    },
    GetSnapshot {
        resp: oneshot::Sender<Snapshot>,
    },
}

/// Handle to the task owning a channel
#[derive(Clone)]
pub struct Agent {
    agent: mpsc::Sender<Commands>,
}

/// Own the channel itself
struct AgentHandler {
    channel: Channel,
    submitter: Arc<dyn Submitter>,
    collector: Arc<dyn Collector>,
    last_order_id: Option<i64>,
}

impl Agent {
    /// Spawn the task owning `channel`, on the current runtime
    pub fn spawn(
        channel: Channel,
        submitter: Arc<dyn Submitter>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        Self {
            agent: AgentHandler {
                channel,
                submitter,
                collector,
                last_order_id: None,
            }
            .spawn(),
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Response<T>) -> Commands) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        self.agent
            .send(command(tx))
            .await
            .map_err(|_| Error::GoneOnSend)?;

        rx.await.map_err(|_| Error::GoneOnRecv)?
    }

    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Commands) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        self.agent
            .send(command(tx))
            .await
            .map_err(|_| Error::GoneOnSend)?;

        rx.await.map_err(|_| Error::GoneOnRecv)
    }

    /// Read both channel accounts from the ledger and return the hello to send
    pub async fn introduce(&self) -> Result<Message> {
        self.call(|resp| Commands::Introduce { resp }).await
    }

    /// Handle a message of the other participant, returning the answer to send back if any
    pub async fn receive(&self, message: Message) -> Result<Option<Message>> {
        self.call(|resp| Commands::Receive { message, resp }).await
    }

    /// Propose to open the channel
    pub async fn propose_open(&self, params: OpenParams) -> Result<Message> {
        self.call(|resp| Commands::ProposeOpen { params, resp })
            .await
    }

    /// Propose a payment of `amount`
    pub async fn propose_payment(&self, amount: i64, memo: Vec<u8>) -> Result<Message> {
        self.call(|resp| Commands::ProposePayment { amount, memo, resp })
            .await
    }

    /// Propose a coordinated close
    pub async fn propose_close(&self) -> Result<Message> {
        self.call(|resp| Commands::ProposeClose { resp }).await
    }

    /// Drop the agreement in progress
    pub async fn abandon_unauthorized(&self) -> Result<Option<CloseEnvelope>> {
        self.query(|resp| Commands::AbandonUnauthorized { resp })
            .await
    }

    /// Submit the declaration of the latest authorized agreement, starting a close
    pub async fn submit_declaration(&self) -> Result<()> {
        self.call(|resp| Commands::SubmitDeclaration { resp })
            .await
    }

    /// Submit the close of the latest authorized agreement
    pub async fn submit_close(&self) -> Result<()> {
        self.call(|resp| Commands::SubmitClose { resp }).await
    }

    /// Feed one transaction accepted by the ledger, `None` if already seen
    pub async fn ingest(&self, record: IngestRecord) -> Result<Option<IngestOutcome>> {
        self.call(|resp| Commands::Ingest { record, resp }).await
    }

    /// Feed every transaction of `records`, until it ends
    ///
    /// Records the channel rejects are logged and skipped.
    pub async fn ingest_stream(&self, records: impl Stream<Item = IngestRecord>) -> Result<()> {
        futures::pin_mut!(records);

        while let Some(record) = records.next().await {
            let cursor = record.cursor.clone();

            match self.ingest(record).await {
                Ok(_) => {}
                Err(Error::ChannelOperation { source }) => {
                    warn!("ingest {}: {}", cursor, source)
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Current stage of the channel
    pub async fn state(&self) -> Result<State> {
        self.query(|resp| Commands::GetState { resp }).await
    }

    /// Balance of the latest authorized agreement
    pub async fn balance(&self) -> Result<i64> {
        self.query(|resp| Commands::GetBalance { resp }).await
    }

    /// Capture the channel state
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.query(|resp| Commands::GetSnapshot { resp }).await
    }
}

impl AgentHandler {
    fn spawn(mut self) -> mpsc::Sender<Commands> {
        let (tx, mut rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Commands::Introduce { resp } => {
                        let _ = resp.send(self.introduce().await);
                    }
                    Commands::Receive { message, resp } => {
                        let _ = resp.send(self.receive(message).await);
                    }
                    Commands::ProposeOpen { params, resp } => {
                        let _ = resp.send(
                            self.channel
                                .propose_open(params)
                                .map(Message::OpenRequest)
                                .context(ChannelOperation),
                        );
                    }
                    Commands::ProposePayment { amount, memo, resp } => {
                        let _ = resp.send(
                            self.channel
                                .propose_payment_with_memo(amount, memo)
                                .map(Message::PaymentRequest)
                                .context(ChannelOperation),
                        );
                    }
                    Commands::ProposeClose { resp } => {
                        let _ = resp.send(
                            self.channel
                                .propose_close()
                                .map(Message::CloseRequest)
                                .context(ChannelOperation),
                        );
                    }
                    Commands::AbandonUnauthorized { resp } => {
                        let _ = resp.send(self.channel.abandon_unauthorized());
                    }
                    Commands::SubmitDeclaration { resp } => {
                        let _ = resp.send(self.submit_declaration().await);
                    }
                    Commands::SubmitClose { resp } => {
                        let _ = resp.send(self.submit_close().await);
                    }
                    Commands::Ingest { record, resp } => {
                        let _ = resp.send(self.ingest(record).await);
                    }
                    Commands::GetState { resp } => {
                        let _ = resp.send(self.channel.state());
                    }
                    Commands::GetBalance { resp } => {
                        let _ = resp.send(self.channel.balance());
                    }
                    Commands::GetSnapshot { resp } => {
                        let _ = resp.send(self.channel.snapshot());
                    }
                }
            }
        });

        tx
    }

    fn asset(&self) -> Asset {
        self.channel
            .open_agreement()
            .map(|open| open.details.asset.clone())
            .unwrap_or_default()
    }

    async fn introduce(&mut self) -> Result<Message> {
        self.refresh_accounts().await?;

        Ok(Message::Hello {
            channel_account: self.channel.local_channel_account().address,
            signer: self.channel.local_signer(),
        })
    }

    async fn refresh_accounts(&mut self) -> Result<()> {
        let asset = self.asset();
        let local = self.channel.local_channel_account().address;
        let remote = self.channel.remote_channel_account().address;

        let sequence_number = self
            .collector
            .get_sequence_number(local)
            .await
            .context(Collect)?;
        self.channel
            .update_local_channel_account_sequence_number(sequence_number);
        let balance = self
            .collector
            .get_balance(local, asset.clone())
            .await
            .context(Collect)?;
        self.channel.update_local_channel_account_balance(balance);

        let sequence_number = self
            .collector
            .get_sequence_number(remote)
            .await
            .context(Collect)?;
        self.channel
            .update_remote_channel_account_sequence_number(sequence_number);
        let balance = self
            .collector
            .get_balance(remote, asset)
            .await
            .context(Collect)?;
        self.channel.update_remote_channel_account_balance(balance);

        Ok(())
    }

    async fn receive(&mut self, message: Message) -> Result<Option<Message>> {
        debug!("received {}", message.kind());

        match message {
            Message::Hello {
                channel_account,
                signer,
            } => {
                ensure!(
                    channel_account == self.channel.remote_channel_account().address
                        && signer == self.channel.remote_signer(),
                    UnknownPeer {
                        channel_account,
                        signer
                    }
                );
                self.refresh_accounts().await?;

                Ok(None)
            }
            Message::OpenRequest(envelope) => {
                let confirmed = self
                    .channel
                    .confirm_open(envelope)
                    .context(ChannelOperation)?;

                Ok(Some(Message::OpenResponse(confirmed.confirmer_signatures)))
            }
            Message::OpenResponse(signatures) => {
                let mut open = self
                    .channel
                    .open_agreement()
                    .cloned()
                    .context(UnexpectedMessage {
                        kind: "open response",
                    })?;

                if self.channel.is_initiator() {
                    open.confirmer_signatures = signatures;
                    let authorized = self
                        .channel
                        .confirm_open(open)
                        .context(ChannelOperation)?;

                    let formation = self.channel.open_tx().context(ChannelOperation)?;
                    self.submit(&formation).await?;
                    info!("submitted formation");

                    Ok(Some(Message::OpenResponse(authorized.proposer_signatures)))
                } else {
                    open.proposer_signatures = signatures;
                    self.channel
                        .confirm_open(open)
                        .context(ChannelOperation)?;

                    Ok(None)
                }
            }
            Message::PaymentRequest(envelope) => {
                let confirmed = self.confirm_payment(envelope).await?;

                Ok(Some(Message::PaymentResponse(
                    confirmed.confirmer_signatures,
                )))
            }
            Message::PaymentResponse(signatures) => match self.proposed_pending(&signatures) {
                Some(envelope) => {
                    let authorized = self
                        .channel
                        .confirm_payment(envelope)
                        .context(ChannelOperation)?;

                    Ok(Some(Message::PaymentResponse(
                        authorized.proposer_signatures,
                    )))
                }
                None => {
                    self.channel
                        .finalize_payment(signatures)
                        .context(ChannelOperation)?;

                    Ok(None)
                }
            },
            Message::CloseRequest(envelope) => {
                let confirmed = self
                    .channel
                    .confirm_close(envelope)
                    .context(ChannelOperation)?;

                Ok(Some(Message::CloseResponse(confirmed.confirmer_signatures)))
            }
            Message::CloseResponse(signatures) => match self.proposed_pending(&signatures) {
                Some(envelope) => {
                    let authorized = self
                        .channel
                        .confirm_close(envelope)
                        .context(ChannelOperation)?;

                    self.submit_declaration().await?;
                    self.submit_close().await?;

                    Ok(Some(Message::CloseResponse(authorized.proposer_signatures)))
                }
                None => {
                    self.channel
                        .finalize_close(signatures)
                        .context(ChannelOperation)?;

                    Ok(None)
                }
            },
        }
    }

    /// Agreement in progress proposed by this participant, completed with `signatures`
    ///
    /// `None` when this participant is the confirmer, the signatures then being the final ones
    /// of the proposer.
    fn proposed_pending(&self, signatures: &CloseSignatures) -> Option<CloseEnvelope> {
        let local = self.channel.local_signer();

        self.channel
            .latest_unauthorized_close_agreement()
            .filter(|pending| pending.details.proposing_signer == local)
            .map(|pending| CloseEnvelope {
                confirmer_signatures: signatures.clone(),
                ..pending.clone()
            })
    }

    /// Confirm a payment, refreshing the balance of the payer once if it seems underfunded
    async fn confirm_payment(&mut self, envelope: CloseEnvelope) -> Result<CloseEnvelope> {
        match self.channel.confirm_payment(envelope.clone()) {
            Err(channel::Error::Underfunded { available, owed }) => {
                warn!(
                    "payer seems underfunded with {} for {}, refreshing its balance",
                    available, owed
                );

                let remote = self.channel.remote_channel_account().address;
                let balance = self
                    .collector
                    .get_balance(remote, self.asset())
                    .await
                    .context(Collect)?;
                self.channel.update_remote_channel_account_balance(balance);

                self.channel
                    .confirm_payment(envelope)
                    .context(ChannelOperation)
            }
            result => result.context(ChannelOperation),
        }
    }

    async fn submit(&self, tx: &TransactionEnvelope) -> Result<()> {
        let encoded = ledger::encode(tx).context(EncodeTransaction)?;

        self.submitter.submit(encoded).await.context(Submit)
    }

    async fn submit_declaration(&mut self) -> Result<()> {
        let (declaration, _) = self.channel.close_txs().context(ChannelOperation)?;
        self.submit(&declaration).await?;
        info!("submitted declaration {}", declaration.tx.sequence_number);

        Ok(())
    }

    async fn submit_close(&mut self) -> Result<()> {
        let (_, close) = self.channel.close_txs().context(ChannelOperation)?;
        self.submit(&close).await?;
        info!("submitted close {}", close.tx.sequence_number);

        Ok(())
    }

    async fn ingest(&mut self, record: IngestRecord) -> Result<Option<IngestOutcome>> {
        if let Some(last) = self.last_order_id {
            if record.order_id <= last {
                debug!("skipped already ingested {}", record.cursor);
                return Ok(None);
            }
        }
        self.last_order_id = Some(record.order_id);

        let outcome = self.channel.ingest_tx(&record).context(ChannelOperation)?;

        if outcome.declaration.is_some() && self.channel.state() == State::ClosingWithOutdatedState
        {
            warn!("outdated declaration executed, contesting it");
            // the other participant may have contested first
            if let Err(err) = self.submit_declaration().await {
                warn!("unable to contest: {}", err);
            }
        }

        Ok(Some(outcome))
    }
}
