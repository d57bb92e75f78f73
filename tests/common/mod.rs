//! In-memory ledger enforcing what the channel transactions rely on
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use paychan::{
    agent::{BoxError, Collector, Submitter},
    channel::{self, Channel, IngestRecord, OpenParams},
    keys::{KeyPair, PublicKey},
    ledger::{
        self, AccountEntry, Asset, Hash, LedgerEntry, LedgerEntryChange, OperationBody,
        OperationMeta, ResultCode, Signer, SignerKey, Thresholds, TransactionEnvelope,
        TransactionMeta, TransactionResult, TrustLineEntry,
    },
};

pub const NETWORK: &str = "integration tests";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Low,
    Med,
    High,
}

#[derive(Clone)]
struct Account {
    entry: AccountEntry,
    sequence_time: u64,
    sequence_ledger: u32,
}

pub struct Ledger {
    accounts: HashMap<PublicKey, Account>,
    trustlines: HashMap<(PublicKey, Asset), TrustLineEntry>,
    time: u64,
    ledger: u32,
    records: Vec<IngestRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            trustlines: HashMap::new(),
            time: 1_000,
            ledger: 1,
            records: vec![],
        }
    }

    /// Account controlled by `signer` alone
    pub fn create_account(&mut self, address: PublicKey, signer: PublicKey, balance: i64, sequence_number: i64) {
        self.accounts.insert(
            address,
            Account {
                entry: AccountEntry {
                    account_id: address,
                    balance,
                    sequence_number,
                    thresholds: Thresholds::default(),
                    signers: vec![Signer {
                        key: SignerKey::Ed25519(signer),
                        weight: 1,
                    }],
                },
                sequence_time: self.time,
                sequence_ledger: self.ledger,
            },
        );
    }

    /// Let time and ledgers go by
    pub fn advance(&mut self, time: Duration, ledgers: u32) {
        self.time += time.as_secs();
        self.ledger += ledgers;
    }

    /// Add `amount` to the native balance of `address`, as a deposit from outside the channel
    pub fn deposit(&mut self, address: PublicKey, amount: i64) {
        if let Some(account) = self.accounts.get_mut(&address) {
            account.entry.balance += amount;
        }
    }

    /// Authorized trustline of `address` holding `balance` of `asset`, as set up with its issuer
    pub fn trust(&mut self, address: PublicKey, asset: Asset, balance: i64) {
        self.trustlines.insert(
            (address, asset.clone()),
            TrustLineEntry {
                account_id: address,
                asset,
                balance,
                limit: i64::MAX,
                authorized: true,
            },
        );
    }

    pub fn account(&self, address: &PublicKey) -> &AccountEntry {
        &self.accounts[address].entry
    }

    pub fn trustline(&self, address: &PublicKey, asset: &Asset) -> &TrustLineEntry {
        &self.trustlines[&(*address, asset.clone())]
    }

    pub fn records(&self) -> &[IngestRecord] {
        &self.records
    }

    pub fn submit(&mut self, envelope: &TransactionEnvelope) -> ResultCode {
        let tx = &envelope.tx;
        let hash = tx.hash(NETWORK).expect("hashable transaction");

        let source = match self.accounts.get(&tx.source_account) {
            Some(source) => source.clone(),
            None => return ResultCode::BadSequence,
        };

        if let Some(bounds) = &tx.preconditions.time_bounds {
            if self.time < bounds.min_time {
                return ResultCode::TooEarly;
            }
            if bounds.max_time != 0 && self.time > bounds.max_time {
                return ResultCode::TooLate;
            }
        }

        let current = source.entry.sequence_number;
        let sequence_valid = match tx.preconditions.min_sequence_number {
            Some(min) => current >= min && current < tx.sequence_number,
            None => current + 1 == tx.sequence_number,
        };
        if !sequence_valid {
            return ResultCode::BadSequence;
        }

        if self.time - source.sequence_time < tx.preconditions.min_sequence_age
            || self.ledger - source.sequence_ledger < tx.preconditions.min_sequence_ledger_gap
        {
            return ResultCode::BadMinSequenceAgeOrGap;
        }

        if !self.authorized(envelope, &hash) {
            return ResultCode::BadAuth;
        }

        let mut changed = self.clone_state();
        {
            let source = changed.0.get_mut(&tx.source_account).expect("source exists");
            source.entry.sequence_number = tx.sequence_number;
            source.sequence_time = self.time;
            source.sequence_ledger = self.ledger;
        }
        let before = vec![LedgerEntryChange::Updated(LedgerEntry::Account(
            changed.0[&tx.source_account].entry.clone(),
        ))];

        let mut operations = vec![];
        let mut code = ResultCode::Success;
        for op in &tx.operations {
            let op_source = op.source_account.unwrap_or(tx.source_account);
            match apply(&mut changed, op_source, &op.body) {
                Some(changes) => operations.push(OperationMeta { changes }),
                None => {
                    code = ResultCode::Failed;
                    break;
                }
            }
        }

        let meta = if code == ResultCode::Success {
            self.accounts = changed.0;
            self.trustlines = changed.1;
            TransactionMeta {
                tx_changes_before: before,
                operations,
            }
        } else {
            let source = self.accounts.get_mut(&tx.source_account).expect("source exists");
            source.entry.sequence_number = tx.sequence_number;
            source.sequence_time = self.time;
            source.sequence_ledger = self.ledger;
            TransactionMeta {
                tx_changes_before: before,
                operations: vec![],
            }
        };

        let order_id = self.records.len() as i64 + 1;
        self.records.push(IngestRecord {
            cursor: format!("{}-{}", self.ledger, order_id),
            order_id,
            tx: ledger::encode(envelope).expect("encodable envelope"),
            result: ledger::encode(&TransactionResult {
                fee_charged: i64::from(tx.fee),
                code,
            })
            .expect("encodable result"),
            result_meta: ledger::encode(&meta).expect("encodable meta"),
        });
        self.ledger += 1;

        code
    }

    fn clone_state(
        &self,
    ) -> (
        HashMap<PublicKey, Account>,
        HashMap<(PublicKey, Asset), TrustLineEntry>,
    ) {
        (self.accounts.clone(), self.trustlines.clone())
    }

    fn authorized(&self, envelope: &TransactionEnvelope, hash: &Hash) -> bool {
        let tx = &envelope.tx;

        let mut needed: HashMap<PublicKey, Level> = HashMap::new();
        needed.insert(tx.source_account, Level::Low);
        for op in &tx.operations {
            let level = match op.body {
                OperationBody::BumpSequence { .. } => Level::Low,
                OperationBody::SetOptions { .. } => Level::High,
                _ => Level::Med,
            };
            let account = op.source_account.unwrap_or(tx.source_account);
            let entry = needed.entry(account).or_insert(level);
            if rank(level) > rank(*entry) {
                *entry = level;
            }
        }

        let accounts_signed = needed.iter().all(|(address, level)| {
            let account = match self.accounts.get(address) {
                Some(account) => &account.entry,
                None => return false,
            };
            let threshold = match level {
                Level::Low => account.thresholds.low,
                Level::Med => account.thresholds.med,
                Level::High => account.thresholds.high,
            }
            .max(1);

            let mut weight = 0u32;
            if account.thresholds.master_weight > 0 && signed_by(envelope, hash, address) {
                weight += u32::from(account.thresholds.master_weight);
            }
            for signer in &account.signers {
                if let SignerKey::Ed25519(key) = &signer.key {
                    if signed_by(envelope, hash, key) {
                        weight += u32::from(signer.weight);
                    }
                }
            }

            weight >= u32::from(threshold)
        });

        let extra_signed = tx.preconditions.extra_signers.iter().all(|extra| match extra {
            SignerKey::Ed25519(key) => signed_by(envelope, hash, key),
            SignerKey::SignedPayload { signer, payload } => envelope
                .signatures
                .iter()
                .any(|sig| signer.verify(payload, &sig.signature)),
        });

        accounts_signed && extra_signed
    }
}

fn rank(level: Level) -> u8 {
    match level {
        Level::Low => 0,
        Level::Med => 1,
        Level::High => 2,
    }
}

fn signed_by(envelope: &TransactionEnvelope, hash: &Hash, key: &PublicKey) -> bool {
    envelope.signatures.find(hash, key).is_some()
}

type State = (
    HashMap<PublicKey, Account>,
    HashMap<(PublicKey, Asset), TrustLineEntry>,
);

fn apply(state: &mut State, source: PublicKey, body: &OperationBody) -> Option<Vec<LedgerEntryChange>> {
    let (accounts, trustlines) = state;

    match body {
        OperationBody::BumpSequence { bump_to } => {
            let account = accounts.get_mut(&source)?;
            if *bump_to > account.entry.sequence_number {
                account.entry.sequence_number = *bump_to;
            }
            Some(vec![updated_account(&account.entry)])
        }
        OperationBody::SetOptions {
            master_weight,
            low_threshold,
            med_threshold,
            high_threshold,
            signer,
        } => {
            let entry = &mut accounts.get_mut(&source)?.entry;
            if let Some(weight) = master_weight {
                entry.thresholds.master_weight = *weight;
            }
            if let Some(low) = low_threshold {
                entry.thresholds.low = *low;
            }
            if let Some(med) = med_threshold {
                entry.thresholds.med = *med;
            }
            if let Some(high) = high_threshold {
                entry.thresholds.high = *high;
            }
            if let Some(signer) = signer {
                entry.signers.retain(|existing| existing.key != signer.key);
                if signer.weight > 0 {
                    entry.signers.push(signer.clone());
                }
            }
            Some(vec![updated_account(entry)])
        }
        OperationBody::Payment {
            destination,
            asset,
            amount,
        } => match asset {
            Asset::Native => {
                let from = &mut accounts.get_mut(&source)?.entry;
                if from.balance < *amount {
                    return None;
                }
                from.balance -= amount;
                let from = updated_account(from);
                let to = &mut accounts.get_mut(destination)?.entry;
                to.balance += amount;
                Some(vec![from, updated_account(to)])
            }
            credit => {
                let from = trustlines.get_mut(&(source, credit.clone()))?;
                if from.balance < *amount {
                    return None;
                }
                from.balance -= amount;
                let from = LedgerEntryChange::Updated(LedgerEntry::TrustLine(from.clone()));
                let to = trustlines.get_mut(&(*destination, credit.clone()))?;
                to.balance += amount;
                Some(vec![
                    from,
                    LedgerEntryChange::Updated(LedgerEntry::TrustLine(to.clone())),
                ])
            }
        },
        OperationBody::ChangeTrust { asset, limit } => {
            accounts.get(&source)?;
            let existed = trustlines.contains_key(&(source, asset.clone()));
            let line = trustlines
                .entry((source, asset.clone()))
                .or_insert_with(|| TrustLineEntry {
                    account_id: source,
                    asset: asset.clone(),
                    balance: 0,
                    limit: *limit,
                    authorized: true,
                });
            line.limit = *limit;
            let entry = LedgerEntry::TrustLine(line.clone());
            Some(vec![if existed {
                LedgerEntryChange::Updated(entry)
            } else {
                LedgerEntryChange::Created(entry)
            }])
        }
        OperationBody::BeginSponsoringFutureReserves { .. }
        | OperationBody::EndSponsoringFutureReserves => {
            accounts.get(&source)?;
            Some(vec![])
        }
    }
}

fn updated_account(entry: &AccountEntry) -> LedgerEntryChange {
    LedgerEntryChange::Updated(LedgerEntry::Account(entry.clone()))
}

/// Ledger shared with agents
#[derive(Clone)]
pub struct SharedLedger(pub Arc<Mutex<Ledger>>);

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self(Arc::new(Mutex::new(ledger)))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> T {
        f(&mut self.0.lock().expect("ledger lock"))
    }
}

#[async_trait]
impl Submitter for SharedLedger {
    async fn submit(&self, tx: Vec<u8>) -> Result<(), BoxError> {
        let envelope: TransactionEnvelope = ledger::decode(&tx)?;

        match self.with(|ledger| ledger.submit(&envelope)) {
            ResultCode::Success => Ok(()),
            code => Err(format!("transaction rejected: {:?}", code).into()),
        }
    }
}

#[async_trait]
impl Collector for SharedLedger {
    async fn get_sequence_number(&self, account: PublicKey) -> Result<i64, BoxError> {
        self.with(|ledger| {
            ledger
                .accounts
                .get(&account)
                .map(|account| account.entry.sequence_number)
                .ok_or_else(|| format!("no account {}", account).into())
        })
    }

    async fn get_balance(&self, account: PublicKey, asset: Asset) -> Result<i64, BoxError> {
        self.with(|ledger| match asset {
            Asset::Native => ledger
                .accounts
                .get(&account)
                .map(|account| account.entry.balance)
                .ok_or_else(|| format!("no account {}", account).into()),
            credit => Ok(ledger
                .trustlines
                .get(&(account, credit))
                .map(|line| line.balance)
                .unwrap_or_default()),
        })
    }
}

/// Both participants of a channel, with their channel accounts on `ledger`
pub struct Participants {
    pub initiator: Channel,
    pub responder: Channel,
    pub initiator_keys: (KeyPair, KeyPair),
    pub responder_keys: (KeyPair, KeyPair),
}

fn participant(account: &KeyPair, signer: &KeyPair, remote_account: &KeyPair, remote_signer: &KeyPair) -> Channel {
    Channel::new(channel::Config {
        network_passphrase: NETWORK.to_string(),
        max_open_expiry: Duration::from_secs(3600),
        local_channel_account: account.public(),
        remote_channel_account: remote_account.public(),
        local_signer: signer.clone(),
        remote_signer: remote_signer.public(),
    })
}

/// Keys of a participant, (channel account, signer)
pub fn keys(seed: u8) -> (KeyPair, KeyPair) {
    (
        KeyPair::from_seed([seed; 32]),
        KeyPair::from_seed([seed.wrapping_add(100); 32]),
    )
}

/// Channels of two participants, with channel accounts at sequences 101 and 202 for the
/// initiator and the responder, each holding `balance`
pub fn participants(ledger: &mut Ledger, balance: i64) -> Participants {
    let (mut first, mut second) = (keys(1), keys(2));
    if first.0.public().to_string() < second.0.public().to_string() {
        std::mem::swap(&mut first, &mut second);
    }

    ledger.create_account(first.0.public(), first.1.public(), balance, 101);
    ledger.create_account(second.0.public(), second.1.public(), balance, 202);

    let mut initiator = participant(&first.0, &first.1, &second.0, &second.1);
    let mut responder = participant(&second.0, &second.1, &first.0, &first.1);
    assert!(initiator.is_initiator());

    for channel in [&mut initiator, &mut responder] {
        let local = ledger.account(&channel.local_channel_account().address).clone();
        let remote = ledger.account(&channel.remote_channel_account().address).clone();
        channel.update_local_channel_account_sequence_number(local.sequence_number);
        channel.update_local_channel_account_balance(local.balance);
        channel.update_remote_channel_account_sequence_number(remote.sequence_number);
        channel.update_remote_channel_account_balance(remote.balance);
    }

    Participants {
        initiator,
        responder,
        initiator_keys: first,
        responder_keys: second,
    }
}

pub fn open_params(observation_period: Duration, asset: Asset) -> OpenParams {
    OpenParams {
        observation_period_time: observation_period,
        observation_period_ledger_gap: 0,
        asset,
        expires_at: Utc::now() + chrono::Duration::minutes(10),
    }
}

impl Participants {
    /// Agree on the open, submit the formation and ingest it on both sides
    pub fn open(&mut self, ledger: &mut Ledger, observation_period: Duration) {
        self.open_with_asset(ledger, observation_period, Asset::Native)
    }

    /// Same as [`Participants::open`], for a channel of `asset`
    pub fn open_with_asset(&mut self, ledger: &mut Ledger, observation_period: Duration, asset: Asset) {
        let proposal = self
            .initiator
            .propose_open(open_params(observation_period, asset))
            .expect("to propose open");
        let confirmed = self.responder.confirm_open(proposal).expect("to confirm open");
        let authorized = self
            .initiator
            .confirm_open(confirmed)
            .expect("to authorize open");
        self.responder
            .confirm_open(authorized)
            .expect("to take formation signature");

        let formation = self.initiator.open_tx().expect("to export formation");
        assert_eq!(ResultCode::Success, ledger.submit(&formation));
        self.ingest_all(ledger);
    }

    /// Ingest on both sides every record not ingested yet
    pub fn ingest_all(&mut self, ledger: &Ledger) {
        for channel in [&mut self.initiator, &mut self.responder] {
            let last = channel
                .last_ingested_cursor()
                .and_then(|cursor| ledger.records().iter().position(|r| r.cursor == cursor));
            let start = last.map(|index| index + 1).unwrap_or_default();

            for record in &ledger.records()[start..] {
                channel.ingest_tx(record).expect("to ingest");
            }
        }
    }

    /// Run a full payment of `amount`, from the initiator when `from_initiator`
    pub fn pay(&mut self, from_initiator: bool, amount: i64) {
        let (payer, payee) = if from_initiator {
            (&mut self.initiator, &mut self.responder)
        } else {
            (&mut self.responder, &mut self.initiator)
        };

        let proposal = payer.propose_payment(amount).expect("to propose payment");
        let confirmed = payee.confirm_payment(proposal).expect("to confirm payment");
        let authorized = payer
            .confirm_payment(confirmed)
            .expect("to take confirmation");
        payee
            .finalize_payment(authorized.proposer_signatures)
            .expect("to finalize payment");
    }
}
