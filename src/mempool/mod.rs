//! Pending-transaction tracker.
//!
//! Watches the node's pending-tx firehose, classifies swaps aimed at
//! monitored pools by method selector, and walks each matched transaction
//! through pending → confirmed / failed / replaced / timed-out. A per-tx
//! failure never tears down the subscription; on nodes without the
//! `newPendingTransactions` extension the tracker degrades to log-only
//! mode.

use crate::chain::ChainClient;
use crate::common::{PulseMetrics, PulseError, address_to_lower, iso_timestamp, normalize_address};
use crate::confirm::{ConfirmationEnvelope, ConfirmationSink};
use crate::pools::PoolKind;
use dashmap::DashMap;
use ethers::core::types::{H256, Transaction};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Known swap selectors (first 4 bytes of calldata).
static SWAP_SELECTORS: Lazy<HashMap<[u8; 4], &'static str>> = Lazy::new(|| {
    HashMap::from([
        // V2-style router
        ([0x38, 0xed, 0x17, 0x39], "swapExactTokensForTokens"),
        ([0x88, 0x03, 0xdb, 0xee], "swapTokensForExactTokens"),
        ([0x7f, 0xf3, 0x6a, 0xb5], "swapExactETHForTokens"),
        ([0x18, 0xcb, 0xaf, 0xe5], "swapExactTokensForETH"),
        ([0xfb, 0x3b, 0xdb, 0x41], "swapETHForExactTokens"),
        ([0x4a, 0x25, 0xd9, 0x4a], "swapTokensForExactETH"),
        (
            [0xb6, 0xf9, 0xde, 0x95],
            "swapExactETHForTokensSupportingFeeOnTransferTokens",
        ),
        (
            [0x5c, 0x11, 0xd7, 0x95],
            "swapExactTokensForTokensSupportingFeeOnTransferTokens",
        ),
        (
            [0x79, 0x1a, 0xc9, 0x47],
            "swapExactTokensForETHSupportingFeeOnTransferTokens",
        ),
        // V3-style router
        ([0x41, 0x4b, 0xf3, 0x89], "exactInputSingle"),
        ([0xc0, 0x4b, 0x8d, 0x59], "exactInput"),
        ([0x04, 0xe4, 0x5a, 0xaf], "exactInputSingle"),
        ([0xb8, 0x58, 0x18, 0x3f], "exactInput"),
        ([0xdb, 0x3e, 0x21, 0x98], "exactOutputSingle"),
        ([0xf2, 0x8c, 0x04, 0x98], "exactOutput"),
        ([0xac, 0x96, 0x50, 0xd8], "multicall"),
        ([0x5a, 0xe4, 0x01, 0xdc], "multicall"),
        // pool-direct
        (V2_POOL_SWAP, "swap"),
        (V3_POOL_SWAP, "swap"),
    ])
});

/// `swap(uint256,uint256,address,bytes)` on a V2 pair.
pub const V2_POOL_SWAP: [u8; 4] = [0x02, 0x2c, 0x0d, 0x9f];
/// `swap(address,bool,int256,int256,uint160,bytes)` on a V3 pool.
pub const V3_POOL_SWAP: [u8; 4] = [0x12, 0x8a, 0xcb, 0x08];

/// Method name for a known swap selector.
pub fn selector_name(selector: &[u8]) -> Option<&'static str> {
    if selector.len() < 4 {
        return None;
    }
    let mut key = [0u8; 4];
    key.copy_from_slice(&selector[..4]);
    SWAP_SELECTORS.get(&key).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapOperation {
    Buy,
    Sell,
    Unknown,
}

impl SwapOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapOperation::Buy => "buy",
            SwapOperation::Sell => "sell",
            SwapOperation::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwapStatus {
    Pending,
    Confirmed,
    Failed,
    Replaced,
    TimedOut,
}

/// A pool registered for mempool watching.
#[derive(Debug, Clone)]
pub struct MonitoredPool {
    pub pool_address: String,
    pub token_address: String,
    pub protocol: PoolKind,
    /// Which side the monitored token occupies, when known.
    pub is_token0: Option<bool>,
    /// Only emit for transactions from this address, when set.
    pub user_filter: Option<String>,
}

/// One tracked transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSwap {
    pub tx_hash: String,
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
    pub user_address: String,
    pub operation: SwapOperation,
    pub method_id: String,
    pub detected_at: String,
    pub status: SwapStatus,
}

pub struct MempoolTracker {
    chain: Arc<ChainClient>,
    sink: Arc<dyn ConfirmationSink>,
    metrics: Arc<PulseMetrics>,
    monitors: DashMap<String, MonitoredPool>,
    pending: DashMap<String, PendingSwap>,
    /// `from:nonce` → tx hash, for replacement detection.
    by_sender_nonce: DashMap<String, String>,
    pending_timeout: Duration,
    running: AtomicBool,
}

impl MempoolTracker {
    pub fn new(
        chain: Arc<ChainClient>,
        sink: Arc<dyn ConfirmationSink>,
        metrics: Arc<PulseMetrics>,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            sink,
            metrics,
            monitors: DashMap::new(),
            pending: DashMap::new(),
            by_sender_nonce: DashMap::new(),
            pending_timeout,
            running: AtomicBool::new(false),
        }
    }

    /// Register a pool for pending-swap detection.
    pub fn register_pool(&self, monitor: MonitoredPool) {
        let key = normalize_address(&monitor.pool_address);
        self.monitors.insert(key, monitor);
    }

    /// Drop monitors and any tracked transactions referring to them.
    pub fn remove_pools(&self, pool_addresses: &[String]) {
        for pool in pool_addresses {
            let key = normalize_address(pool);
            self.monitors.remove(&key);
            let stale: Vec<String> = self
                .pending
                .iter()
                .filter(|e| e.value().pool_address == key)
                .map(|e| e.key().clone())
                .collect();
            for hash in stale {
                self.pending.remove(&hash);
            }
        }
    }

    pub fn monitored_pool_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_snapshot(&self) -> Vec<PendingSwap> {
        self.pending.iter().map(|e| e.value().clone()).collect()
    }

    /// Attach to the pending-tx firehose. Safe to call again after a
    /// reconnect; a no-op while a watch loop is already running.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = match self.chain.subscribe_pending_hashes().await {
            Ok(rx) => rx,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                warn!(
                    "node lacks newPendingTransactions; mempool tracker in log-only mode: {}",
                    e
                );
                return;
            }
        };

        let tracker = self.clone();
        tokio::spawn(async move {
            info!("mempool tracker watching pending transactions");
            while let Some(hash) = rx.recv().await {
                if let Err(e) = tracker.inspect_pending(hash).await {
                    // Mempool is noisy; record and move on.
                    debug!("pending tx {:?} inspection failed: {}", hash, e);
                    tracker.metrics.record_error("mempool", e.to_string());
                }
            }
            tracker.running.store(false, Ordering::SeqCst);
            warn!("pending-tx stream ended");
        });
    }

    async fn inspect_pending(self: &Arc<Self>, hash: H256) -> Result<(), PulseError> {
        if self.monitors.is_empty() {
            return Ok(());
        }
        let Some(tx) = self.chain.get_transaction(hash).await? else {
            return Ok(());
        };
        let Some(classified) = self.classify(&tx) else {
            return Ok(());
        };

        let from = address_to_lower(&tx.from);
        if let Some(filter) = &classified.user_filter {
            if *filter != from {
                return Ok(());
            }
        }

        let entry = PendingSwap {
            tx_hash: format!("{:?}", hash),
            token_address: classified.token_address,
            pool_address: classified.pool_address,
            protocol: classified.protocol.protocol_tag().to_string(),
            user_address: from.clone(),
            operation: classified.operation,
            method_id: format!("0x{}", ethers::utils::hex::encode(&tx.input[..4])),
            detected_at: iso_timestamp(),
            status: SwapStatus::Pending,
        };
        let nonce_key = format!("{}:{}", from, tx.nonce);
        self.track(entry, nonce_key).await;
        Ok(())
    }

    /// State-machine entry point: note any replacement for the same
    /// `(from, nonce)`, record the entry, emit `swap:pending`, and start
    /// the confirmation watcher.
    pub async fn track(self: &Arc<Self>, entry: PendingSwap, nonce_key: String) {
        self.note_replacement(&nonce_key, &entry.tx_hash).await;

        let tx_hash = entry.tx_hash.clone();
        self.pending.insert(tx_hash.clone(), entry.clone());
        self.by_sender_nonce.insert(nonce_key.clone(), tx_hash.clone());

        self.sink
            .emit(ConfirmationEnvelope::Pending {
                tx_hash: entry.tx_hash.clone(),
                token_address: entry.token_address.clone(),
                pool_address: entry.pool_address.clone(),
                user_address: entry.user_address.clone(),
                operation: entry.operation.as_str().to_string(),
                status: "pending".to_string(),
                protocol: entry.protocol.clone(),
                timestamp: iso_timestamp(),
                detection_time: entry.detected_at.clone(),
            })
            .await;

        let Ok(hash) = tx_hash.parse::<H256>() else {
            return;
        };
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.watch_confirmation(hash, tx_hash, nonce_key).await;
        });
    }

    /// A second pending tx with the same `(from, nonce)` replaces the
    /// first; tracking moves to the new hash.
    async fn note_replacement(&self, nonce_key: &str, new_hash: &str) {
        let Some(old_hash) = self.by_sender_nonce.get(nonce_key).map(|e| e.clone()) else {
            return;
        };
        if old_hash == new_hash {
            return;
        }
        if self.pending.remove(&old_hash).is_none() {
            return;
        }
        info!("tx {} replaced by {}", old_hash, new_hash);
        self.sink
            .emit(ConfirmationEnvelope::Replaced {
                old_tx_hash: old_hash,
                new_tx_hash: new_hash.to_string(),
                status: "replaced".to_string(),
                timestamp: iso_timestamp(),
            })
            .await;
    }

    /// Race the receipt against the pending timeout; the loser is
    /// abandoned. The entry may have been removed by a replacement or a
    /// monitor teardown in the meantime, in which case nothing is emitted.
    async fn watch_confirmation(&self, hash: H256, tx_hash: String, nonce_key: String) {
        let receipt = self
            .chain
            .wait_for_transaction(hash, self.pending_timeout)
            .await;

        let Some((_, entry)) = self.pending.remove(&tx_hash) else {
            return;
        };
        self.by_sender_nonce.remove(&nonce_key);

        match receipt {
            Ok(Some(receipt)) => {
                let block_number = receipt.block_number.map(|n| n.as_u64()).unwrap_or(0);
                let succeeded = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                if succeeded {
                    self.sink
                        .emit(ConfirmationEnvelope::Confirmed {
                            tx_hash: entry.tx_hash.clone(),
                            block_number,
                            gas_used: receipt.gas_used.map(|g| g.as_u64()).unwrap_or(0),
                            token_address: entry.token_address.clone(),
                            pool_address: entry.pool_address.clone(),
                            user_address: entry.user_address.clone(),
                            operation: entry.operation.as_str().to_string(),
                            status: "confirmed".to_string(),
                            protocol: entry.protocol.clone(),
                            timestamp: iso_timestamp(),
                        })
                        .await;
                } else {
                    self.sink
                        .emit(ConfirmationEnvelope::Failed {
                            tx_hash: entry.tx_hash.clone(),
                            block_number,
                            reason: "transaction reverted".to_string(),
                            status: "failed".to_string(),
                            timestamp: iso_timestamp(),
                        })
                        .await;
                }
            }
            Ok(None) => {
                debug!("tx {} timed out without a receipt", tx_hash);
            }
            Err(e) => {
                debug!("receipt wait for {} failed: {}", tx_hash, e);
                self.metrics.record_error("confirmation", e.to_string());
            }
        }
    }

    /// Match a pending transaction against the monitored pool set.
    fn classify(&self, tx: &Transaction) -> Option<ClassifiedSwap> {
        if tx.input.len() < 4 {
            return None;
        }
        let selector = &tx.input[..4];
        selector_name(selector)?;

        let to = tx.to?;
        let to_lower = address_to_lower(&to);

        // Pool-direct call.
        if let Some(monitor) = self.monitors.get(&to_lower) {
            let operation = classify_direct_call(selector, &tx.input, monitor.is_token0);
            return Some(ClassifiedSwap {
                token_address: monitor.token_address.clone(),
                pool_address: monitor.pool_address.clone(),
                protocol: monitor.protocol,
                operation,
                user_filter: monitor.user_filter.clone(),
            });
        }

        // Router call: match when the calldata mentions a monitored token
        // or pool address. Operation resolves later from the emitted log.
        for monitor in self.monitors.iter() {
            let token_needle = address_needle(&monitor.token_address);
            let pool_needle = address_needle(&monitor.pool_address);
            if contains_needle(&tx.input, &token_needle) || contains_needle(&tx.input, &pool_needle)
            {
                return Some(ClassifiedSwap {
                    token_address: monitor.token_address.clone(),
                    pool_address: monitor.pool_address.clone(),
                    protocol: monitor.protocol,
                    operation: SwapOperation::Unknown,
                    user_filter: monitor.user_filter.clone(),
                });
            }
        }
        None
    }
}

struct ClassifiedSwap {
    token_address: String,
    pool_address: String,
    protocol: PoolKind,
    operation: SwapOperation,
    user_filter: Option<String>,
}

/// Operation for a pool-direct call. Only the V2 `swap` calldata exposes
/// the direction up front.
pub fn classify_direct_call(selector: &[u8], input: &[u8], is_token0: Option<bool>) -> SwapOperation {
    if selector != V2_POOL_SWAP.as_slice() {
        return SwapOperation::Unknown;
    }
    let Some(is_token0) = is_token0 else {
        return SwapOperation::Unknown;
    };
    // swap(uint256 amount0Out, uint256 amount1Out, address to, bytes data)
    let args = &input[4..];
    let (Ok(amount0_out), Ok(amount1_out)) = (
        crate::pools::word_at(args, 0),
        crate::pools::word_at(args, 1),
    ) else {
        return SwapOperation::Unknown;
    };
    let token_out = if is_token0 { amount0_out } else { amount1_out };
    if !token_out.is_zero() {
        SwapOperation::Buy
    } else {
        SwapOperation::Sell
    }
}

fn address_needle(addr: &str) -> Vec<u8> {
    ethers::utils::hex::decode(normalize_address(addr).trim_start_matches("0x"))
        .unwrap_or_default()
}

fn contains_needle(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
