mod common;

use std::time::Duration;

use chrono::Utc;
use common::{participants, Ledger};
use paychan::{
    channel::{Channel, Error, State},
    keys::KeyPair,
    ledger::{Asset, ResultCode},
};

const PERIOD: Duration = Duration::from_secs(60);

fn latest(channel: &Channel) -> (i64, i64) {
    let latest = channel
        .latest_authorized_close_agreement()
        .expect("authorized agreement");

    (latest.details.iteration_number, latest.details.balance)
}

#[test]
fn three_payments_then_close() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, Duration::ZERO);

    channels.pay(true, 50);
    assert_eq!((2, 50), latest(&channels.initiator));
    channels.pay(false, 100);
    assert_eq!((3, -50), latest(&channels.initiator));
    channels.pay(true, 30);

    assert_eq!((4, -20), latest(&channels.initiator));
    assert_eq!((4, -20), latest(&channels.responder));

    let (declaration, close) = channels.initiator.close_txs().expect("to export");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.initiator.state());
    assert_eq!(State::Closed, channels.responder.state());

    let initiator = channels.initiator.local_channel_account().address;
    let responder = channels.responder.local_channel_account().address;
    assert_eq!(1020, ledger.account(&initiator).balance);
    assert_eq!(980, ledger.account(&responder).balance);
    assert_eq!(1020, channels.responder.remote_channel_account().balance);
}

#[test]
fn declaration_of_disappeared_payee_authorizes_payment() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, PERIOD);

    let proposal = channels
        .initiator
        .propose_payment(50)
        .expect("to propose payment");
    channels
        .responder
        .confirm_payment(proposal)
        .expect("to confirm payment");

    let (declaration, _) = channels
        .responder
        .unauthorized_close_txs()
        .expect("payee holds every signature");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));

    channels.ingest_all(&ledger);
    assert_eq!((2, 50), latest(&channels.initiator));
    assert!(channels
        .initiator
        .latest_unauthorized_close_agreement()
        .is_none());
    assert_eq!(State::Closing, channels.initiator.state());

    let (_, close) = channels.initiator.close_txs().expect("to export");
    assert_eq!(ResultCode::BadMinSequenceAgeOrGap, ledger.submit(&close));

    ledger.advance(PERIOD, 10);
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.initiator.state());
    let responder = channels.responder.local_channel_account().address;
    assert_eq!(1050, ledger.account(&responder).balance);
}

#[test]
fn outdated_declaration_is_contested() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, PERIOD);

    channels.pay(true, 50);
    let (outdated_declaration, outdated_close) =
        channels.responder.close_txs().expect("to export");
    channels.pay(false, 20);
    channels.pay(true, 10);
    channels.pay(false, 5);
    assert_eq!((5, 35), latest(&channels.initiator));

    assert_eq!(ResultCode::Success, ledger.submit(&outdated_declaration));
    assert_eq!(
        ResultCode::BadMinSequenceAgeOrGap,
        ledger.submit(&outdated_close)
    );
    channels.ingest_all(&ledger);
    assert_eq!(
        State::ClosingWithOutdatedState,
        channels.initiator.state()
    );

    let (declaration, close) = channels.initiator.close_txs().expect("to export");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));
    channels.ingest_all(&ledger);
    assert_eq!(State::Closing, channels.initiator.state());
    assert_eq!(State::Closing, channels.responder.state());

    ledger.advance(PERIOD, 10);
    assert_eq!(ResultCode::BadSequence, ledger.submit(&outdated_close));
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.responder.state());
    let initiator = channels.initiator.local_channel_account().address;
    let responder = channels.responder.local_channel_account().address;
    assert_eq!(965, ledger.account(&initiator).balance);
    assert_eq!(1035, ledger.account(&responder).balance);
}

#[test]
fn coordinated_close_needs_no_waiting() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, PERIOD);

    channels.pay(true, 100);
    channels.pay(false, 80);
    channels.pay(true, 30);
    assert_eq!((4, 50), latest(&channels.initiator));

    let proposal = channels.initiator.propose_close().expect("to propose close");
    let confirmed = channels
        .responder
        .confirm_close(proposal)
        .expect("to confirm close");
    let authorized = channels
        .initiator
        .confirm_close(confirmed)
        .expect("to take confirmation");
    channels
        .responder
        .finalize_close(authorized.proposer_signatures)
        .expect("to finalize close");

    let (declaration, close) = channels.initiator.close_txs().expect("to export");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.initiator.state());
    assert_eq!(State::Closed, channels.responder.state());
    let responder = channels.responder.local_channel_account().address;
    assert_eq!(1050, ledger.account(&responder).balance);
}

#[test]
fn coordinated_close_without_period_ends_payments() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, Duration::ZERO);
    channels.pay(true, 40);

    let proposal = channels.responder.propose_close().expect("to propose close");
    let confirmed = channels
        .initiator
        .confirm_close(proposal)
        .expect("to confirm close");
    let authorized = channels
        .responder
        .confirm_close(confirmed)
        .expect("to take confirmation");
    channels
        .initiator
        .finalize_close(authorized.proposer_signatures)
        .expect("to finalize close");

    for channel in [&mut channels.initiator, &mut channels.responder] {
        let err = channel.propose_payment(10).expect_err("payment after close");
        assert!(matches!(err, Error::AlreadyClosing));
        let err = channel.propose_close().expect_err("closing twice");
        assert!(matches!(err, Error::AlreadyClosing));
    }

    let (declaration, close) = channels.responder.close_txs().expect("to export");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.initiator.state());
    let responder = channels.responder.local_channel_account().address;
    assert_eq!(1040, ledger.account(&responder).balance);
}

#[test]
fn credit_channel_pays_through_trustlines() {
    let usd = Asset::Credit {
        code: "USD".to_string(),
        issuer: KeyPair::from_seed([50; 32]).public(),
    };
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    let initiator = channels.initiator.local_channel_account().address;
    let responder = channels.responder.local_channel_account().address;
    ledger.trust(initiator, usd.clone(), 500);
    ledger.trust(responder, usd.clone(), 500);

    channels.open_with_asset(&mut ledger, PERIOD, usd.clone());
    assert_eq!(State::Open, channels.initiator.state());
    assert_eq!(500, channels.initiator.local_channel_account().balance);
    assert_eq!(500, channels.responder.remote_channel_account().balance);

    channels.pay(true, 120);
    channels.pay(false, 20);
    assert_eq!((3, 100), latest(&channels.initiator));

    let err = channels
        .initiator
        .propose_payment(450)
        .expect_err("beyond the trustline");
    assert!(matches!(
        err,
        Error::Underfunded {
            available: 500,
            owed: 550
        }
    ));

    let (declaration, close) = channels.initiator.close_txs().expect("to export");
    assert_eq!(ResultCode::Success, ledger.submit(&declaration));
    ledger.advance(PERIOD, 10);
    assert_eq!(ResultCode::Success, ledger.submit(&close));
    channels.ingest_all(&ledger);

    assert_eq!(State::Closed, channels.responder.state());
    assert_eq!(400, ledger.trustline(&initiator, &usd).balance);
    assert_eq!(600, ledger.trustline(&responder, &usd).balance);
    assert_eq!(1000, ledger.account(&initiator).balance);
    assert_eq!(600, channels.responder.local_channel_account().balance);
    assert_eq!(400, channels.responder.remote_channel_account().balance);
}

#[test]
fn underfunded_payer_passes_after_refresh() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 200);
    channels.open(&mut ledger, PERIOD);
    channels.initiator.update_remote_channel_account_balance(40);

    let proposal = channels
        .responder
        .propose_payment(100)
        .expect("to propose payment");
    let err = channels
        .initiator
        .confirm_payment(proposal.clone())
        .expect_err("payer looks underfunded");
    assert!(matches!(
        err,
        Error::Underfunded {
            available: 40,
            owed: 100
        }
    ));

    let payer = channels.responder.local_channel_account().address;
    let balance = ledger.account(&payer).balance;
    channels
        .initiator
        .update_remote_channel_account_balance(balance);

    let confirmed = channels
        .initiator
        .confirm_payment(proposal)
        .expect("to confirm after refresh");
    let authorized = channels
        .responder
        .confirm_payment(confirmed)
        .expect("to take confirmation");
    channels
        .initiator
        .finalize_payment(authorized.proposer_signatures)
        .expect("to finalize");

    assert_eq!((2, -100), latest(&channels.initiator));
}

#[test]
fn payment_pulling_from_payee_is_rejected() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);
    channels.open(&mut ledger, PERIOD);

    let mut proposal = channels
        .initiator
        .propose_payment(10)
        .expect("to propose payment");
    proposal.details.balance = -10;
    proposal.details.payment_amount = -10;

    let err = channels
        .responder
        .confirm_payment(proposal)
        .expect_err("pull payment");
    assert!(matches!(err, Error::PullPaymentRejected));
    assert!(channels
        .responder
        .latest_unauthorized_close_agreement()
        .is_none());
}

#[test]
fn formation_after_expiry_is_refused() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);

    let proposal = channels
        .initiator
        .propose_open(common::open_params(PERIOD, Asset::Native))
        .expect("to propose open");
    let confirmed = channels
        .responder
        .confirm_open(proposal)
        .expect("to confirm open");
    channels
        .initiator
        .confirm_open(confirmed)
        .expect("to authorize open");
    let formation = channels.initiator.open_tx().expect("to export formation");

    let max_time = formation
        .tx
        .preconditions
        .time_bounds
        .expect("formation expires")
        .max_time;
    ledger.advance(Duration::from_secs(max_time), 1);

    assert_eq!(ResultCode::TooLate, ledger.submit(&formation));
    channels.ingest_all(&ledger);
    assert_eq!(State::Opening, channels.initiator.state());
}

#[test]
fn expiry_in_the_past_is_rejected() {
    let mut ledger = Ledger::new();
    let mut channels = participants(&mut ledger, 1000);

    let mut params = common::open_params(PERIOD, Asset::Native);
    params.expires_at = Utc::now() - chrono::Duration::minutes(1);

    let err = channels
        .initiator
        .propose_open(params)
        .expect_err("expired open");
    assert!(matches!(err, Error::ExpiryOutOfRange { .. }));
    assert_eq!(State::None, channels.initiator.state());
}
