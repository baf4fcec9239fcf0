//! Dispatcher ordering, failures and response listeners.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use treasury_driver::body::{stake_coin_message, withdraw_message, OP_STAKE_COIN, OP_WITHDRAW};
use treasury_driver::dispatch::{self, listen};
use treasury_driver::{
    DispatchError, DispatchTiming, Dispatcher, Envelope, RequestRef, RequestState, Response,
    Stake, Unstake,
};
use treasury_driver_testing::fixtures::{
    driver_wallet, stake_request, treasury, unstake_request, wallet,
};
use treasury_driver_testing::{ChainEvent, MemoryRequestStore, MockChain, RecordingSigner};
use uuid::Uuid;

struct Harness {
    chain: Arc<MockChain>,
    signer: Arc<RecordingSigner>,
    stake_responses: mpsc::Receiver<Response>,
    unstake_responses: mpsc::Receiver<Response>,
    dispatcher: Dispatcher,
    queue: dispatch::DispatchQueue,
}

fn harness(landing_delay: Duration, timing: DispatchTiming) -> Harness {
    let chain = Arc::new(MockChain::new(treasury()));
    let signer = Arc::new(
        RecordingSigner::new(driver_wallet(), chain.clone()).with_landing_delay(landing_delay),
    );
    let (queue, envelopes) = dispatch::queue(8);
    let (stake_tx, stake_responses) = mpsc::channel(8);
    let (unstake_tx, unstake_responses) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(chain.clone(), signer.clone(), envelopes, stake_tx, unstake_tx)
        .with_timing(timing);
    Harness {
        chain,
        signer,
        stake_responses,
        unstake_responses,
        dispatcher,
        queue,
    }
}

fn fast() -> DispatchTiming {
    DispatchTiming {
        timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
    }
}

fn withdraw_envelope(seed: u64) -> Envelope {
    let request = unstake_request(seed, wallet(seed as u8), 100);
    Envelope {
        id: Uuid::new_v4(),
        request: request.into(),
        message: withdraw_message(wallet(seed as u8), seed).unwrap(),
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[tokio::test(start_paused = true)]
async fn one_message_in_flight_at_a_time() {
    let mut h = harness(Duration::from_millis(200), fast());
    let round = 9;
    h.queue
        .enqueue(
            stake_request(1, wallet(1), round),
            stake_coin_message(wallet(1), 1, round).unwrap(),
        )
        .await
        .unwrap();
    h.queue
        .enqueue(
            unstake_request(2, wallet(2), 100),
            withdraw_message(wallet(2), 2).unwrap(),
        )
        .await
        .unwrap();
    h.queue
        .enqueue(
            unstake_request(3, wallet(3), 100),
            withdraw_message(wallet(3), 3).unwrap(),
        )
        .await
        .unwrap();
    drop(h.queue);

    let (_shutdown_tx, shutdown) = watch::channel(false);
    h.dispatcher.run(shutdown).await;

    assert_eq!(
        h.chain.events(),
        vec![
            ChainEvent::Submitted { seqno: 0, opcode: Some(OP_STAKE_COIN) },
            ChainEvent::Confirmed { seqno: 1 },
            ChainEvent::Submitted { seqno: 1, opcode: Some(OP_WITHDRAW) },
            ChainEvent::Confirmed { seqno: 2 },
            ChainEvent::Submitted { seqno: 2, opcode: Some(OP_WITHDRAW) },
            ChainEvent::Confirmed { seqno: 3 },
        ]
    );

    let stake = h.stake_responses.recv().await.unwrap();
    assert!(stake.is_success());
    assert!(matches!(stake.request, RequestRef::Stake(_)));
    for _ in 0..2 {
        let unstake = h.unstake_responses.recv().await.unwrap();
        assert!(unstake.is_success());
        assert!(matches!(unstake.request, RequestRef::Unstake(_)));
    }
}

#[tokio::test(start_paused = true)]
async fn unmoved_seqno_times_out() {
    let h = harness(Duration::ZERO, DispatchTiming::default());
    h.signer.set_lands(false);

    let started = Instant::now();
    let response = h.dispatcher.dispatch(withdraw_envelope(1)).await;

    assert_eq!(
        response.result,
        Err(DispatchError::SeqnoTimeout {
            seqno: 0,
            waited: Duration::from_secs(30),
        })
    );
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.signer.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_send_never_reaches_the_chain() {
    let h = harness(Duration::ZERO, fast());
    h.signer.set_rejects(true);

    let envelope = withdraw_envelope(1);
    let id = envelope.id;
    let response = h.dispatcher.dispatch(envelope).await;

    assert_eq!(response.id, id);
    assert!(matches!(response.result, Err(DispatchError::Submit(_))));
    assert!(h.chain.events().is_empty());
    assert_eq!(h.chain.seqno(&driver_wallet()), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_an_idle_dispatcher() {
    let h = harness(Duration::ZERO, fast());
    let (shutdown_tx, shutdown) = watch::channel(false);
    let task = tokio::spawn(h.dispatcher.run(shutdown));

    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    // The queue handle is still alive; only the signal ended the loop.
    drop(h.queue);
}

// ============================================================================
// Listeners
// ============================================================================

fn ongoing(seed: u64) -> treasury_driver::UnstakeRequest {
    let mut request = unstake_request(seed, wallet(seed as u8), 100);
    request.state = RequestState::Ongoing;
    request
}

#[tokio::test]
async fn listener_records_dispatch_outcomes() {
    let store = Arc::new(MemoryRequestStore::<Unstake>::new());
    let landed = ongoing(1);
    let lost = ongoing(2);
    store.insert(landed.clone());
    store.insert(lost.clone());

    let (responses_tx, responses) = mpsc::channel(4);
    let before = Utc::now();
    let task = tokio::spawn(listen::<Unstake>(store.clone(), responses));

    responses_tx
        .send(Response {
            id: Uuid::new_v4(),
            request: landed.clone().into(),
            result: Ok(()),
        })
        .await
        .unwrap();
    responses_tx
        .send(Response {
            id: Uuid::new_v4(),
            request: lost.clone().into(),
            result: Err(DispatchError::Submit("rejected".into())),
        })
        .await
        .unwrap();
    drop(responses_tx);
    task.await.unwrap();

    let sent = store.get(&landed.hash).unwrap();
    assert_eq!(sent.state, RequestState::Sent);
    assert!(sent.sent_at.is_some_and(|at| at >= before));
    assert_eq!(store.state(&lost.hash), Some(RequestState::Error));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_send_in_flight() {
    let Harness {
        chain,
        signer,
        stake_responses,
        unstake_responses,
        dispatcher,
        queue,
    } = harness(Duration::from_secs(1), fast());
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
    let in_flight = ongoing(1);
    let queued = ongoing(2);
    for (seed, request) in [(1, &in_flight), (2, &queued)] {
        unstakes.insert(request.clone());
        queue
            .enqueue(request.clone(), withdraw_message(wallet(seed), seed as u64).unwrap())
            .await
            .unwrap();
    }

    let (shutdown_tx, shutdown) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(dispatcher.run(shutdown)),
        tokio::spawn(listen::<Stake>(stakes, stake_responses)),
        tokio::spawn(listen::<Unstake>(unstakes.clone(), unstake_responses)),
    ];

    // The first withdraw is submitted but has not landed yet.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(signer.sent().len(), 1);
    assert_eq!(unstakes.state(&in_flight.hash), Some(RequestState::Ongoing));

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task did not stop")
            .unwrap();
    }

    let sent = unstakes.get(&in_flight.hash).unwrap();
    assert_eq!(sent.state, RequestState::Sent);
    assert!(sent.sent_at.is_some());
    // The queued envelope is dropped untouched.
    assert_eq!(unstakes.state(&queued.hash), Some(RequestState::Ongoing));
    assert_eq!(signer.sent().len(), 1);
    assert_eq!(
        chain.events(),
        vec![
            ChainEvent::Submitted { seqno: 0, opcode: Some(OP_WITHDRAW) },
            ChainEvent::Confirmed { seqno: 1 },
        ]
    );
    drop(queue);
}

#[tokio::test(start_paused = true)]
async fn listeners_stop_once_the_dispatcher_is_gone() {
    let h = harness(Duration::ZERO, fast());
    let stakes = Arc::new(MemoryRequestStore::<Stake>::new());
    let unstakes = Arc::new(MemoryRequestStore::<Unstake>::new());
    let listeners = vec![
        tokio::spawn(listen::<Stake>(stakes, h.stake_responses)),
        tokio::spawn(listen::<Unstake>(unstakes, h.unstake_responses)),
    ];

    let (shutdown_tx, shutdown) = watch::channel(false);
    let dispatcher = tokio::spawn(h.dispatcher.run(shutdown));
    shutdown_tx.send(true).unwrap();
    dispatcher.await.unwrap();

    for listener in listeners {
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener outlived the dispatcher")
            .unwrap();
    }
    drop(h.queue);
}
