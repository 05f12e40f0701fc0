//! End-to-end scenarios through the real pipeline against the mock chain.

use alloy::primitives::{keccak256, Address, Bytes, B256};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

use ember_sniper::chain::contract::{mint_calldata, EmberContract};
use ember_sniper::chain::wallet::Wallet;
use ember_sniper::chain::ChainClient;
use ember_sniper::config::FeeSettings;
use ember_sniper::engine::bundle::BundleDispatcher;
use ember_sniper::engine::dispatch::Dispatcher;
use ember_sniper::engine::evaluator::OpportunityEvaluator;
use ember_sniper::engine::pipeline::{preflight, Pipeline, PipelineSettings};
use ember_sniper::engine::public::PublicDispatcher;
use ember_sniper::engine::sampler::CEILING_PRIORITY_HEADROOM;
use ember_sniper::types::*;

use crate::mock_chain::{MockChain, MockRelay};

const TARGET: u64 = 12;

fn contract() -> Address {
    Address::repeat_byte(0xc4)
}

fn safe_mint() -> Address {
    Address::repeat_byte(0x94)
}

fn fees() -> FeeSettings {
    FeeSettings {
        cost_ceiling: 50 * GWEI,
        priority_fee: 2 * GWEI,
        min_max_fee: 0,
        tip: None,
    }
}

/// Base fee whose derived ceiling candidate is exactly `ceiling`.
fn base_fee_for(ceiling: Wei) -> Option<Wei> {
    Some((ceiling - CEILING_PRIORITY_HEADROOM) / 2)
}

fn pipeline(chain: &MockChain, own: Address, dispatcher: Arc<dyn Dispatcher>, watch_pending: bool) -> Pipeline {
    pipeline_with_policy(chain, own, dispatcher, watch_pending, EdgePolicy::RisingEdge)
}

fn pipeline_with_policy(
    chain: &MockChain,
    own: Address,
    dispatcher: Arc<dyn Dispatcher>,
    watch_pending: bool,
    policy: EdgePolicy,
) -> Pipeline {
    let client: Arc<dyn ChainClient> = Arc::new(chain.clone());
    Pipeline::new(
        Arc::clone(&client),
        EmberContract::new(client, contract()),
        own,
        OpportunityEvaluator::new(TARGET, policy, fees().cost_ceiling),
        dispatcher,
        fees(),
        PipelineSettings {
            poll_interval: Duration::from_millis(10),
            max_failed_polls: 3,
            watch_pending,
        },
    )
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Holds every submission until released.
#[derive(Default)]
struct HeldDispatcher {
    started: AtomicUsize,
    finished: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl Dispatcher for HeldDispatcher {
    async fn submit(&self, _fee: EffectiveFee, _tick: Tick) -> Result<DispatchOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchOutcome::Broadcast { tx_hash: B256::ZERO })
    }

    fn name(&self) -> &'static str {
        "held"
    }
}

// ---------------------------------------------------------------------------
// Admission and dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_admitted_opportunity_dispatches_once() {
    let chain = MockChain::new(contract(), 100, 13, base_fee_for(40 * GWEI));
    let wallet = Arc::new(Wallet::random(1));
    let dispatcher = Arc::new(PublicDispatcher::new(
        Arc::new(chain.clone()),
        Arc::clone(&wallet),
        contract(),
        180_000,
    ));
    let p = pipeline(&chain, wallet.address(), dispatcher, false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("broadcast", || chain.sent().len() == 1).await;
    settle().await;
    let sent = chain.sent();
    assert_eq!(sent.len(), 1);
    // Typed EIP-1559 envelope.
    assert_eq!(sent[0][0], 0x02);

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_too_expensive_is_not_dispatched() {
    let chain = MockChain::new(contract(), 100, 13, base_fee_for(60 * GWEI));
    let wallet = Arc::new(Wallet::random(1));
    let dispatcher = Arc::new(PublicDispatcher::new(
        Arc::new(chain.clone()),
        Arc::clone(&wallet),
        contract(),
        180_000,
    ));
    let p = pipeline(&chain, wallet.address(), dispatcher, false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("block sampled", || chain.ember_reads().contains(&100)).await;
    settle().await;
    assert!(chain.sent().is_empty());

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_legacy_fee_market_never_dispatches() {
    let chain = MockChain::new(contract(), 100, 13, None);
    let held = Arc::new(HeldDispatcher::default());
    let p = pipeline(&chain, Address::repeat_byte(1), held.clone(), false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("block sampled", || chain.ember_reads().contains(&100)).await;
    settle().await;
    assert_eq!(held.started.load(Ordering::SeqCst), 0);

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_ticks_during_dispatch_are_dropped() {
    let cheap = base_fee_for(40 * GWEI);
    let chain = MockChain::new(contract(), 100, 13, cheap);
    let held = Arc::new(HeldDispatcher::default());
    let p = pipeline(&chain, Address::repeat_byte(1), held.clone(), false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("first dispatch", || held.started.load(Ordering::SeqCst) == 1).await;
    for _ in 0..2 {
        let tick = chain.advance(13, cheap);
        eventually("block sampled", || chain.ember_reads().contains(&tick)).await;
    }
    settle().await;
    // Both blocks were admitted but dropped, not queued.
    assert_eq!(held.started.load(Ordering::SeqCst), 1);

    held.release.notify_one();
    eventually("first dispatch settled", || held.finished.load(Ordering::SeqCst) == 1).await;
    settle().await;
    assert_eq!(held.started.load(Ordering::SeqCst), 1);

    chain.advance(13, cheap);
    eventually("second dispatch", || held.started.load(Ordering::SeqCst) == 2).await;
    held.release.notify_one();

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
    assert_eq!(held.finished.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_sample_skips_block() {
    let cheap = base_fee_for(40 * GWEI);
    let chain = MockChain::new(contract(), 100, 13, cheap);
    chain.fail_calls(true);
    let held = Arc::new(HeldDispatcher::default());
    let p = pipeline(&chain, Address::repeat_byte(1), held.clone(), false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    settle().await;
    assert_eq!(held.started.load(Ordering::SeqCst), 0);

    chain.fail_calls(false);
    chain.advance(13, cheap);
    eventually("dispatch after recovery", || held.started.load(Ordering::SeqCst) == 1).await;
    held.release.notify_one();

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

// ---------------------------------------------------------------------------
// Private path
// ---------------------------------------------------------------------------

fn bundle_dispatcher(chain: &MockChain, wallet: &Arc<Wallet>, relay: &MockRelay, tip: Option<Wei>) -> Arc<BundleDispatcher> {
    Arc::new(BundleDispatcher::new(
        Arc::new(chain.clone()),
        Arc::clone(wallet),
        Arc::new(relay.clone()),
        safe_mint(),
        TARGET,
        tip,
    ))
}

#[tokio::test]
async fn test_failed_simulation_submits_nothing() {
    let cheap = base_fee_for(40 * GWEI);
    let chain = MockChain::new(contract(), 100, 13, cheap);
    let wallet = Arc::new(Wallet::random(1));
    let relay = MockRelay::new();
    relay.fail_simulation("execution reverted: ember mismatch");

    let p = pipeline(&chain, wallet.address(), bundle_dispatcher(&chain, &wallet, &relay, None), false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("simulation", || relay.simulated().len() == 1).await;
    settle().await;
    assert!(relay.submitted().is_empty());
    assert!(chain.sent().is_empty());

    // The gate is idle again: the next qualifying block gets a fresh bundle.
    chain.advance(13, cheap);
    eventually("second simulation", || relay.simulated().len() == 2).await;
    let simulated = relay.simulated();
    assert_eq!(simulated[0].target_tick, 101);
    assert_eq!(simulated[1].target_tick, 102);
    assert_ne!(simulated[0].id, simulated[1].id);
    assert!(relay.submitted().is_empty());

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_bundle_targets_next_block_and_resolves() {
    let chain = MockChain::new(contract(), 100, 13, base_fee_for(40 * GWEI));
    chain.set_nonce(4);
    let wallet = Arc::new(Wallet::random(1));
    let relay = MockRelay::new();

    let p = pipeline(
        &chain,
        wallet.address(),
        bundle_dispatcher(&chain, &wallet, &relay, Some(ETHER / 100)),
        false,
    );
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    eventually("submission", || relay.submitted().len() == 1).await;
    let bundle = &relay.submitted()[0];
    assert_eq!(bundle.target_tick, 101);
    assert_eq!(bundle.nonce, 4);
    assert_eq!(bundle.signer, wallet.address());
    assert_eq!(bundle.txs.len(), 1);
    assert_eq!(bundle.tx_hash, keccak256(&bundle.txs[0]));
    // Nothing goes to the public mempool.
    assert!(chain.sent().is_empty());

    eventually("resolution", || relay.resolved().len() == 1).await;

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

// ---------------------------------------------------------------------------
// Termination and failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_own_terminal_mint_ends_the_run() {
    let chain = MockChain::new(contract(), 100, 11, base_fee_for(40 * GWEI));
    let own = Address::repeat_byte(0xaa);
    chain.mint_event(own, TARGET, B256::repeat_byte(1));
    chain.mint_event(own, TARGET, B256::repeat_byte(2));

    let held = Arc::new(HeldDispatcher::default());
    let p = pipeline(&chain, own, held.clone(), false);
    let shutdown = p.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), p.run())
        .await
        .expect("pipeline should stop by itself");
    tokio_test::assert_ok!(result);
    assert!(shutdown.is_signalled());
    // Already signalled: a second signal is a no-op.
    assert!(!shutdown.signal());
    assert_eq!(held.started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sample_in_flight_at_termination_never_dispatches() {
    // Falling edge: the terminal ember is itself admissible.
    let chain = MockChain::new(contract(), 100, TARGET, base_fee_for(20 * GWEI));
    chain.set_call_delay(Duration::from_millis(300));
    let own = Address::repeat_byte(0xaa);
    chain.mint_event(own, TARGET, B256::repeat_byte(1));

    let held = Arc::new(HeldDispatcher::default());
    let p = pipeline_with_policy(&chain, own, held.clone(), false, EdgePolicy::FallingEdge);
    let shutdown = p.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), p.run())
        .await
        .expect("pipeline should stop by itself");
    tokio_test::assert_ok!(result);
    assert!(shutdown.is_signalled());

    // Outlast the slow read that was running when the mint was seen.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(held.started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_off_target_own_mint_keeps_running() {
    let chain = MockChain::new(contract(), 100, 11, base_fee_for(40 * GWEI));
    let own = Address::repeat_byte(0xaa);
    chain.mint_event(own, TARGET + 5, B256::repeat_byte(1));

    let p = pipeline(&chain, own, Arc::new(HeldDispatcher::default()), false);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    settle().await;
    assert!(!shutdown.is_signalled());
    assert!(!run.is_finished());

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_total_connectivity_loss_is_fatal() {
    let chain = MockChain::new(contract(), 100, 13, base_fee_for(40 * GWEI));
    chain.set_error("connection refused");
    let p = pipeline(&chain, Address::repeat_byte(1), Arc::new(HeldDispatcher::default()), false);

    let result = tokio::time::timeout(Duration::from_secs(5), p.run())
        .await
        .expect("pipeline should fail by itself");
    let err = tokio_test::assert_err!(result);
    let classified = err.downcast_ref::<SniperError>().expect("classified error");
    assert!(classified.is_fatal());
}

// ---------------------------------------------------------------------------
// Adversarial monitor
// ---------------------------------------------------------------------------

fn rival_tx(hash: B256, from: Address, input: Bytes) -> TxView {
    TxView {
        hash,
        from,
        to: Some(contract()),
        input,
        nonce: 0,
        max_fee_per_gas: Some(80 * GWEI),
        max_priority_fee_per_gas: Some(5 * GWEI),
    }
}

#[tokio::test]
async fn test_confirmed_hostile_mint_is_reported() {
    let chain = MockChain::new(contract(), 100, 11, base_fee_for(40 * GWEI));
    let own = Address::repeat_byte(0xaa);
    let rival = Address::repeat_byte(0xbb);
    let hash = B256::repeat_byte(0x42);
    chain.add_transaction(rival_tx(hash, rival, mint_calldata()));
    chain.add_receipt(
        hash,
        ReceiptView {
            block_number: Some(100),
            gas_used: 100_000,
            effective_gas_price: 30 * GWEI,
            success: true,
        },
    );
    chain.mint_event(rival, 15, hash);
    chain.mint_event(own, 15, B256::repeat_byte(0x43));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let p = pipeline(&chain, own, Arc::new(HeldDispatcher::default()), false).with_reports(tx);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.actor, rival);
    assert_eq!(report.source, ReportSource::Confirmed);
    assert_eq!(report.tick, Some(100));
    assert_eq!(report.observed_condition, Some(15));
    let fee_paid = report.fee_paid.expect("fees looked up");
    assert_eq!(fee_paid.max_fee_per_gas, 80 * GWEI);
    assert_eq!(fee_paid.total_cost, Some(100_000 * 30 * GWEI));

    settle().await;
    // Our own mint is never reported.
    assert!(rx.try_recv().is_err());

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_hostile_mint_without_receipt_is_still_reported() {
    let chain = MockChain::new(contract(), 100, 11, base_fee_for(40 * GWEI));
    let rival = Address::repeat_byte(0xbb);
    let hash = B256::repeat_byte(0x44);
    // The node has not indexed the transaction or its receipt yet.
    chain.mint_event(rival, 15, hash);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let p = pipeline(&chain, Address::repeat_byte(0xaa), Arc::new(HeldDispatcher::default()), false)
        .with_reports(tx);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.actor, rival);
    assert_eq!(report.source, ReportSource::Confirmed);
    assert_eq!(report.tx_hash, hash);
    assert_eq!(report.tick, Some(100));
    assert_eq!(report.observed_condition, Some(15));
    assert_eq!(report.fee_paid, None);

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_repeated_pending_sightings_report_once() {
    let chain = MockChain::new(contract(), 100, 11, base_fee_for(40 * GWEI));
    let own = Address::repeat_byte(0xaa);
    let rival = Address::repeat_byte(0xbb);

    let hostile = B256::repeat_byte(1);
    let ours = B256::repeat_byte(2);
    let not_a_mint = B256::repeat_byte(3);
    chain.add_transaction(rival_tx(hostile, rival, mint_calldata()));
    chain.add_transaction(rival_tx(ours, own, mint_calldata()));
    chain.add_transaction(rival_tx(not_a_mint, rival, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));

    // The same hash seen by both connections, plus a later repeat.
    let first = chain.connection("first");
    let second = chain.connection("second");
    for hash in [hostile, hostile, ours, not_a_mint] {
        first.push_pending(hash);
    }
    second.push_pending(hostile);

    let endpoints: Vec<Arc<dyn ChainClient>> = vec![Arc::new(first.clone()), Arc::new(second.clone())];
    let (tx, mut rx) = mpsc::unbounded_channel();
    let p = pipeline(&chain, own, Arc::new(HeldDispatcher::default()), true)
        .with_endpoints(endpoints)
        .with_reports(tx);
    let shutdown = p.shutdown();
    let run = tokio::spawn(p.run());

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.actor, rival);
    assert_eq!(report.source, ReportSource::Pending);
    assert_eq!(report.tx_hash, hostile);
    let fee_paid = report.fee_paid.expect("fees from the pending transaction");
    assert_eq!(fee_paid.max_priority_fee_per_gas, 5 * GWEI);
    assert_eq!(fee_paid.total_cost, None);

    second.push_pending(hostile);
    settle().await;
    assert!(rx.try_recv().is_err());

    shutdown.signal();
    tokio_test::assert_ok!(run.await.unwrap());
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_preflight_doubles_estimate_and_prices_it() {
    let chain = MockChain::new(contract(), 100, 20, base_fee_for(40 * GWEI));
    let client: Arc<dyn ChainClient> = Arc::new(chain.clone());
    let ember = EmberContract::new(Arc::clone(&client), contract());

    let pre = tokio_test::assert_ok!(preflight(&client, &ember, Address::repeat_byte(1), 2 * GWEI).await);
    assert_eq!(pre.gas_estimate, 90_000);
    assert_eq!(pre.gas_limit, 180_000);
    assert_eq!(pre.estimated_cost, 90_000 * 42 * GWEI);
    assert_eq!(pre.balance, ETHER);
}
