//! Requests travelling the whole way from history to `verified`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use treasury_driver::body::OP_WITHDRAW;
use treasury_driver::dispatch::{self, listen};
use treasury_driver::{
    Dispatcher, DriverBuilder, DriverConfig, Extractor, Network, Oracle, RequestState, Stake,
    StakeAdmission, Unstake, UnstakeAdmission, Verifier, VerifyReport,
};
use treasury_driver_testing::fixtures::{
    driver_wallet, reserve_token_tx, save_coin_tx, stake_request, treasury, tx_hash,
    unstake_request, wallet,
};
use treasury_driver_testing::{MemoryRequestStore, MemoryWatermarkStore, MockChain, RecordingSigner};

// ============================================================================
// Step by step
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unstake_request_is_extracted_dispatched_and_verified() {
    let chain = Arc::new(MockChain::new(treasury()));
    let signer = Arc::new(RecordingSigner::new(driver_wallet(), chain.clone()));
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
    let watermark = Arc::new(MemoryWatermarkStore::new());
    let oracle = Oracle::new(chain.clone(), treasury());
    let hash = tx_hash(1).to_hex();

    chain.push_transaction(reserve_token_tx(1, wallet(1), 1_000));
    chain.set_wallet_state(wallet(1), &[], 1_000);
    chain.set_budgets([1_000]);

    // Extract.
    Extractor::new(
        chain.clone(),
        watermark.clone(),
        stakes.clone(),
        unstakes.clone(),
        treasury(),
        Network::Mainnet,
    )
    .run_pass()
    .await
    .unwrap();
    assert_eq!(unstakes.state(&hash), Some(RequestState::New));

    // Admit.
    let (queue, envelopes) = dispatch::queue(4);
    let report = UnstakeAdmission::new(unstakes.clone(), oracle.clone(), queue, 3)
        .run_pass()
        .await
        .unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(unstakes.state(&hash), Some(RequestState::Ongoing));

    // Dispatch. The admission (and with it the queue) is gone, so the
    // dispatcher drains the one envelope and stops.
    let (stake_tx, stake_rx) = mpsc::channel(4);
    let (unstake_tx, unstake_rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let stake_listener = tokio::spawn(listen::<Stake>(stakes.clone(), stake_rx));
    let unstake_listener = tokio::spawn(listen::<Unstake>(unstakes.clone(), unstake_rx));
    Dispatcher::new(chain.clone(), signer.clone(), envelopes, stake_tx, unstake_tx)
        .run(shutdown)
        .await;
    stake_listener.await.unwrap();
    unstake_listener.await.unwrap();

    let sent = unstakes.get(&hash).unwrap();
    assert_eq!(sent.state, RequestState::Sent);
    assert!(sent.sent_at.is_some());

    let messages = signer.sent();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].destination, wallet(1));
    assert_eq!(messages[0].body.opcode(), Some(OP_WITHDRAW));

    // Verify once the wallet has withdrawn.
    chain.set_wallet_state(wallet(1), &[], 0);
    let verifier = Verifier::new(stakes.clone(), unstakes.clone(), oracle);
    let report = verifier.run_pass().await.unwrap();
    assert_eq!(report.verified, 1);

    let verified = unstakes.get(&hash).unwrap();
    assert_eq!(verified.state, RequestState::Verified);
    let verified_at = verified.verified_at;
    assert!(verified_at.is_some());

    // A second sweep finds nothing left to do.
    assert_eq!(verifier.run_pass().await.unwrap(), VerifyReport::default());
    assert_eq!(unstakes.get(&hash).unwrap().verified_at, verified_at);
}

#[tokio::test]
async fn verification_depends_only_on_wallet_state() {
    let chain = Arc::new(MockChain::new(treasury()));
    chain.set_wallet_state(wallet(1), &[], 0);
    chain.set_wallet_state(wallet(2), &[], 500);
    chain.set_wallet_state(wallet(3), &[12], 0);

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
        let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
        for (seed, tokens) in [(1, 1_000), (2, 500)] {
            let mut request = unstake_request(seed, wallet(seed as u8), tokens);
            request.state = RequestState::Sent;
            unstakes.insert(request);
        }
        let mut stake = stake_request(3, wallet(3), 12);
        stake.state = RequestState::Sent;
        stakes.insert(stake);

        let verifier = Verifier::new(
            stakes.clone(),
            unstakes.clone(),
            Oracle::new(chain.clone(), treasury()),
        );
        let report = verifier.run_pass().await.unwrap();
        let states: Vec<RequestState> = unstakes
            .all()
            .into_iter()
            .map(|request| request.state)
            .chain(stakes.all().into_iter().map(|request| request.state))
            .collect();
        outcomes.push((report, states));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    let (report, states) = &outcomes[0];
    assert_eq!((report.verified, report.retriable), (1, 2));
    assert_eq!(
        states,
        &vec![
            RequestState::Verified,
            RequestState::Retriable,
            RequestState::Retriable,
        ]
    );
}

#[tokio::test]
async fn retriable_stake_goes_round_again() {
    let chain = Arc::new(MockChain::new(treasury()));
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let mut request = stake_request(1, wallet(1), 12);
    request.state = RequestState::Retriable;
    request.retried = 1;
    let hash = request.hash.clone();
    stakes.insert(request);
    chain.set_wallet_state(wallet(1), &[12], 0);

    let (queue, mut envelopes) = dispatch::queue(4);
    let report = StakeAdmission::new(
        stakes.clone(),
        Oracle::new(chain.clone(), treasury()),
        queue,
        3,
    )
    .run_pass()
    .await
    .unwrap();

    assert_eq!(report.dispatched, 1);
    assert_eq!(stakes.get(&hash).unwrap().retried, 2);
    assert!(envelopes.try_recv().is_ok());
}

// ============================================================================
// Running driver
// ============================================================================

#[tokio::test(start_paused = true)]
async fn running_driver_moves_requests_to_verified() {
    let chain = Arc::new(MockChain::new(treasury()));
    let signer = Arc::new(
        RecordingSigner::new(driver_wallet(), chain.clone())
            .with_landing_delay(Duration::from_millis(20)),
    );
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
    let watermark = Arc::new(MemoryWatermarkStore::new());

    chain.set_balance(5_000_000_000);
    chain.push_transactions([
        reserve_token_tx(1, wallet(1), 1_000),
        save_coin_tx(2, wallet(2), 12),
    ]);
    chain.set_wallet_state(wallet(1), &[], 1_000);
    chain.set_wallet_state(wallet(2), &[12], 0);
    chain.set_budgets([1_000]);

    let config: DriverConfig = serde_json::from_value(serde_json::json!({
        "treasury_address": treasury().to_raw(),
        "extract_interval_secs": 1,
        "stake_interval_secs": 1,
        "unstake_interval_secs": 1,
        "verify_interval_secs": 3600,
        "max_retry": 3,
        "seqno_poll_interval_ms": 50,
    }))
    .unwrap();
    let driver = DriverBuilder::new(config.validate().unwrap())
        .with_chain(chain.clone())
        .with_signer(signer.clone())
        .with_stake_store(stakes.clone())
        .with_unstake_store(unstakes.clone())
        .with_watermark_store(watermark.clone())
        .build()
        .unwrap();
    let handle = driver.start().await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let unstake_hash = tx_hash(1).to_hex();
    let stake_hash = tx_hash(2).to_hex();
    assert_eq!(unstakes.state(&unstake_hash), Some(RequestState::Sent));
    assert_eq!(stakes.state(&stake_hash), Some(RequestState::Sent));
    assert_eq!(watermark.current(), tx_hash(2).to_hex());

    // Both wallets act on their messages before the next sweep.
    chain.set_wallet_state(wallet(1), &[], 0);
    chain.set_wallet_state(wallet(2), &[], 0);
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(unstakes.state(&unstake_hash), Some(RequestState::Verified));
    assert_eq!(stakes.state(&stake_hash), Some(RequestState::Verified));
    assert_eq!(signer.sent().len(), 2);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_records_the_withdraw_in_flight() {
    let chain = Arc::new(MockChain::new(treasury()));
    let signer = Arc::new(
        RecordingSigner::new(driver_wallet(), chain.clone())
            .with_landing_delay(Duration::from_secs(2)),
    );
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
    let request = unstake_request(1, wallet(1), 1_000);
    let hash = request.hash.clone();
    unstakes.insert(request);
    chain.set_wallet_state(wallet(1), &[], 1_000);
    chain.set_budgets([1_000]);

    let config: DriverConfig = serde_json::from_value(serde_json::json!({
        "treasury_address": treasury().to_raw(),
        "extract_interval_secs": 3600,
        "stake_interval_secs": 3600,
        "unstake_interval_secs": 3600,
        "verify_interval_secs": 3600,
        "max_retry": 3,
        "seqno_poll_interval_ms": 50,
    }))
    .unwrap();
    let handle = DriverBuilder::new(config.validate().unwrap())
        .with_chain(chain.clone())
        .with_signer(signer.clone())
        .with_stake_store(stakes)
        .with_unstake_store(unstakes.clone())
        .with_watermark_store(Arc::new(MemoryWatermarkStore::new()))
        .build()
        .unwrap()
        .start()
        .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(signer.sent().len(), 1);
    assert_eq!(unstakes.state(&hash), Some(RequestState::Ongoing));

    handle.shutdown().await;

    // The withdraw went out, so the sweep must be able to find it.
    let stored = unstakes.get(&hash).unwrap();
    assert_eq!(stored.state, RequestState::Sent);
    assert!(stored.sent_at.is_some());
}
