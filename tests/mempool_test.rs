//! Selector classification and the pending-swap state machine.

mod common;

use amm_pulse_rs::chain::ChainClient;
use amm_pulse_rs::common::PulseMetrics;
use amm_pulse_rs::confirm::ConfirmationSink;
use amm_pulse_rs::mempool::{
    MempoolTracker, MonitoredPool, PendingSwap, SwapOperation, SwapStatus, V2_POOL_SWAP,
    V3_POOL_SWAP, classify_direct_call, selector_name,
};
use amm_pulse_rs::pools::PoolKind;
use common::{RecordingSink, SOME_POOL, word};
use ethers::core::types::U256;
use std::sync::Arc;
use std::time::Duration;

fn tracker_with_sink(
    pending_timeout: Duration,
) -> (Arc<MempoolTracker>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let tracker = Arc::new(MempoolTracker::new(
        ChainClient::offline(Duration::from_millis(50)),
        sink.clone() as Arc<dyn ConfirmationSink>,
        Arc::new(PulseMetrics::new()),
        pending_timeout,
    ));
    (tracker, sink)
}

fn pending_entry(tx_hash: &str, pool: &str) -> PendingSwap {
    PendingSwap {
        tx_hash: tx_hash.to_string(),
        token_address: common::MON.to_lowercase(),
        pool_address: pool.to_lowercase(),
        protocol: "uniswapv2".to_string(),
        user_address: common::SOME_USER.to_lowercase(),
        operation: SwapOperation::Unknown,
        method_id: "0x38ed1739".to_string(),
        detected_at: "2025-01-01T00:00:00.000Z".to_string(),
        status: SwapStatus::Pending,
    }
}

fn hash(n: u8) -> String {
    format!("0x{}", format!("{:02x}", n).repeat(32))
}

#[test]
fn known_selectors_classify() {
    assert_eq!(
        selector_name(&[0x38, 0xed, 0x17, 0x39]),
        Some("swapExactTokensForTokens")
    );
    assert_eq!(selector_name(&[0x7f, 0xf3, 0x6a, 0xb5]), Some("swapExactETHForTokens"));
    assert_eq!(selector_name(&V2_POOL_SWAP), Some("swap"));
    assert_eq!(selector_name(&V3_POOL_SWAP), Some("swap"));
    assert_eq!(selector_name(&[0xde, 0xad, 0xbe, 0xef]), None);
    assert_eq!(selector_name(&[0x38]), None);
}

#[test]
fn v2_direct_call_direction() {
    // swap(amount0Out, amount1Out, to, data)
    let mut input = V2_POOL_SWAP.to_vec();
    input.extend_from_slice(&word(U256::from(5u64)));
    input.extend_from_slice(&word(U256::zero()));
    input.extend_from_slice(&word(U256::zero()));

    assert_eq!(
        classify_direct_call(&V2_POOL_SWAP, &input, Some(true)),
        SwapOperation::Buy
    );
    assert_eq!(
        classify_direct_call(&V2_POOL_SWAP, &input, Some(false)),
        SwapOperation::Sell
    );
    // Unknown pool side stays unknown.
    assert_eq!(
        classify_direct_call(&V2_POOL_SWAP, &input, None),
        SwapOperation::Unknown
    );
    // V3 direct calls resolve later from the log.
    assert_eq!(
        classify_direct_call(&V3_POOL_SWAP, &input, Some(true)),
        SwapOperation::Unknown
    );
}

#[tokio::test]
async fn tracked_swap_emits_pending() {
    let (tracker, sink) = tracker_with_sink(Duration::from_secs(300));
    tracker
        .track(pending_entry(&hash(1), SOME_POOL), "0xaaa:1".to_string())
        .await;

    assert_eq!(tracker.pending_count(), 1);
    assert_eq!(sink.event_names(), vec!["swap:pending"]);
}

#[tokio::test]
async fn same_nonce_replaces_previous_tracking() {
    let (tracker, sink) = tracker_with_sink(Duration::from_secs(300));
    tracker
        .track(pending_entry(&hash(1), SOME_POOL), "0xaaa:7".to_string())
        .await;
    tracker
        .track(pending_entry(&hash(2), SOME_POOL), "0xaaa:7".to_string())
        .await;

    assert_eq!(
        sink.event_names(),
        vec!["swap:pending", "swap:replaced", "swap:pending"]
    );
    // Tracking moved to the new hash only.
    assert_eq!(tracker.pending_count(), 1);
    let snapshot = tracker.pending_snapshot();
    assert_eq!(snapshot[0].tx_hash, hash(2));
}

#[tokio::test]
async fn distinct_nonces_do_not_replace() {
    let (tracker, sink) = tracker_with_sink(Duration::from_secs(300));
    tracker
        .track(pending_entry(&hash(1), SOME_POOL), "0xaaa:1".to_string())
        .await;
    tracker
        .track(pending_entry(&hash(2), SOME_POOL), "0xaaa:2".to_string())
        .await;

    assert_eq!(sink.event_names(), vec!["swap:pending", "swap:pending"]);
    assert_eq!(tracker.pending_count(), 2);
}

#[tokio::test]
async fn timeout_without_receipt_is_silent_and_terminal() {
    let (tracker, sink) = tracker_with_sink(Duration::from_millis(150));
    tracker
        .track(pending_entry(&hash(3), SOME_POOL), "0xbbb:1".to_string())
        .await;
    assert_eq!(tracker.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(tracker.pending_count(), 0);
    // Only the pending emission; no confirmed/failed for a timeout.
    assert_eq!(sink.event_names(), vec!["swap:pending"]);
}

#[tokio::test]
async fn removing_a_pool_drops_its_tracked_swaps() {
    let (tracker, _sink) = tracker_with_sink(Duration::from_secs(300));
    tracker.register_pool(MonitoredPool {
        pool_address: SOME_POOL.to_string(),
        token_address: common::MON.to_string(),
        protocol: PoolKind::V2,
        is_token0: Some(true),
        user_filter: None,
    });
    assert_eq!(tracker.monitored_pool_count(), 1);

    tracker
        .track(pending_entry(&hash(4), SOME_POOL), "0xccc:1".to_string())
        .await;
    assert_eq!(tracker.pending_count(), 1);

    tracker.remove_pools(&[SOME_POOL.to_string()]);
    assert_eq!(tracker.monitored_pool_count(), 0);
    assert_eq!(tracker.pending_count(), 0);
}
