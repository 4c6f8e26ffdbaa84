//! User-requested swap listeners.
//!
//! Independent of price monitoring: a listener binds one `(token, pool)`
//! with an optional user filter, broadcasts swap events on the token's
//! room, emits confirmed envelopes downstream, and registers the pool for
//! mempool detection. One listener per token.

use crate::chain::{ChainClient, SubscriptionHandle};
use crate::common::{
    PulseError, PulseMetrics, address_to_lower, iso_timestamp, normalize_address, parse_address,
};
use crate::confirm::{ConfirmationEnvelope, ConfirmationSink};
use crate::fanout::{Broadcaster, ServerMessage, SwapEventPayload};
use crate::mempool::{MempoolTracker, MonitoredPool, SwapOperation};
use crate::pools::{Pool, PoolKind, SwapLog, classify_swap, decode_swap_log, swap_topic};
use crate::price::{PairKind, PriceCache, PriceEngine};
use dashmap::DashMap;
use ethers::core::types::Log;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request payload for `start_listener`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapListenerSpec {
    pub token_address: String,
    pub pool_address: String,
    /// `uniswapv2`, `uniswapv3`, `aerodromev2`, `aerodromev3`, `slipstream`.
    pub protocol: String,
    #[serde(default)]
    pub pair_type: Option<String>,
    #[serde(default)]
    pub user_address: Option<String>,
}

/// Public view of a running listener.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapListenerInfo {
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
    pub pair_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    pub is_token0: bool,
    pub started_at: String,
}

struct ActiveSwapListener {
    info: SwapListenerInfo,
    handle: SubscriptionHandle,
}

pub struct SwapListenerManager {
    chain: Arc<ChainClient>,
    engine: Arc<PriceEngine>,
    cache: Arc<PriceCache>,
    mempool: Arc<MempoolTracker>,
    sink: Arc<dyn ConfirmationSink>,
    broadcaster: Broadcaster,
    metrics: Arc<PulseMetrics>,
    listeners: DashMap<String, ActiveSwapListener>,
}

impl SwapListenerManager {
    pub fn new(
        chain: Arc<ChainClient>,
        engine: Arc<PriceEngine>,
        cache: Arc<PriceCache>,
        mempool: Arc<MempoolTracker>,
        sink: Arc<dyn ConfirmationSink>,
        broadcaster: Broadcaster,
        metrics: Arc<PulseMetrics>,
    ) -> Self {
        Self {
            chain,
            engine,
            cache,
            mempool,
            sink,
            broadcaster,
            metrics,
            listeners: DashMap::new(),
        }
    }

    /// Start a swap listener for a token. `None` when the pool fails to
    /// load or the token is not a side of it.
    pub async fn start_listener(
        self: &Arc<Self>,
        spec: SwapListenerSpec,
    ) -> Result<Option<SwapListenerInfo>, PulseError> {
        let token = normalize_address(&spec.token_address);
        let monitored = parse_address(&token)?;
        let pool_address = parse_address(&spec.pool_address)?;
        let kind = PoolKind::from_protocol_tag(&spec.protocol).ok_or_else(|| {
            PulseError::Validation(format!("unknown protocol tag: {}", spec.protocol))
        })?;

        if let Some(existing) = self.get_listener(&token) {
            debug!("swap listener for {} already running", token);
            return Ok(Some(existing));
        }

        let pool = match self.engine.loader().load(pool_address, kind, 18).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("swap listener pool load failed: {}", e);
                self.metrics.record_error("swap-listener", e.to_string());
                return Ok(None);
            }
        };
        let is_token0 = pool.side_of(monitored)?;

        let user_filter = match &spec.user_address {
            Some(addr) => {
                parse_address(addr)?;
                Some(normalize_address(addr))
            }
            None => None,
        };

        let pool_lower = address_to_lower(&pool.address);
        let (mut rx, handle) = self
            .chain
            .subscribe_logs(pool.address, swap_topic(kind))
            .await?;

        let info = SwapListenerInfo {
            token_address: token.clone(),
            pool_address: pool_lower.clone(),
            protocol: kind.protocol_tag().to_string(),
            pair_type: spec
                .pair_type
                .clone()
                .unwrap_or_else(|| pair_symbol_of(&pool, is_token0)),
            user_address: user_filter.clone(),
            is_token0,
            started_at: iso_timestamp(),
        };
        self.listeners.insert(
            token.clone(),
            ActiveSwapListener {
                info: info.clone(),
                handle,
            },
        );

        self.mempool.register_pool(MonitoredPool {
            pool_address: pool_lower.clone(),
            token_address: token.clone(),
            protocol: kind,
            is_token0: Some(is_token0),
            user_filter: user_filter.clone(),
        });

        let manager = self.clone();
        let listener_token = token.clone();
        tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                manager
                    .on_swap_log(&listener_token, &pool, is_token0, user_filter.as_deref(), log)
                    .await;
            }
        });

        info!("swap listener started for {} on {}", token, pool_lower);
        Ok(Some(info))
    }

    /// Stop a token's listener and clear its mempool monitor.
    pub fn stop_listener(&self, token_address: &str) -> bool {
        let token = normalize_address(token_address);
        let Some((_, listener)) = self.listeners.remove(&token) else {
            return false;
        };
        self.mempool
            .remove_pools(&[listener.info.pool_address.clone()]);
        listener.handle.cancel();
        info!("swap listener stopped for {}", token);
        true
    }

    pub fn get_listener(&self, token_address: &str) -> Option<SwapListenerInfo> {
        self.listeners
            .get(&normalize_address(token_address))
            .map(|l| l.info.clone())
    }

    pub fn active_listeners(&self) -> Vec<SwapListenerInfo> {
        self.listeners.iter().map(|l| l.info.clone()).collect()
    }

    async fn on_swap_log(
        &self,
        token: &str,
        pool: &Pool,
        is_token0: bool,
        user_filter: Option<&str>,
        log: Log,
    ) {
        self.metrics.events_received.inc();
        let swap = match decode_swap_log(pool.kind, &log) {
            Ok(swap) => swap,
            Err(e) => {
                self.metrics.record_error("swap-listener-decode", e.to_string());
                return;
            }
        };

        // Confirmed-log path: the downstream envelope honors the user
        // filter against the log's own parties. The room broadcast below
        // is unfiltered.
        let passes_user_filter = match user_filter {
            Some(filter) => {
                let (sender, counterparty) = match swap {
                    SwapLog::V2 { sender, to, .. } => (sender, to),
                    SwapLog::V3 {
                        sender, recipient, ..
                    } => (sender, recipient),
                };
                address_to_lower(&sender) == filter || address_to_lower(&counterparty) == filter
            }
            None => true,
        };

        let (token_decimals, pair_decimals) = if is_token0 {
            (pool.decimals0, pool.decimals1)
        } else {
            (pool.decimals1, pool.decimals0)
        };
        let info = classify_swap(&swap, is_token0, token_decimals, pair_decimals);

        let tx_hash = log
            .transaction_hash
            .map(|h| format!("{:?}", h))
            .unwrap_or_default();
        let price_usd = self.cache.get(token).map(|p| p.price_usd).unwrap_or(0.0);
        let value_usd = info.token_amount * price_usd;
        let bnb_usd = self.engine.bnb.get();
        let pair_token = if is_token0 { pool.token1 } else { pool.token0 };
        let pair = PairKind::from_pair_address(&address_to_lower(&pair_token));
        let amount_bnb = match pair {
            PairKind::Wbnb => info.pair_amount,
            _ if bnb_usd > 0.0 => value_usd / bnb_usd,
            _ => 0.0,
        };

        self.broadcaster
            .broadcast_room(
                token,
                &ServerMessage::SwapEvent(SwapEventPayload {
                    token_address: token.to_string(),
                    symbol: String::new(),
                    pool_address: address_to_lower(&pool.address),
                    tx_hash: tx_hash.clone(),
                    kind: if info.is_buy { "buy" } else { "sell" }.to_string(),
                    sender: String::new(),
                    amount_bnb,
                    amount_token: info.token_amount,
                    pair_symbol: pair.display_symbol().to_string(),
                    pair_amount: info.pair_amount,
                    price_usd,
                    value_usd,
                    timestamp: iso_timestamp(),
                }),
            )
            .await;

        // The rest needs RPCs: resolve the real `from` for a follow-up
        // swap-update, then emit the downstream confirmation with receipt
        // detail when the user filter passes.
        let Some(hash) = log.transaction_hash else {
            return;
        };
        let operation = if info.is_buy {
            SwapOperation::Buy
        } else {
            SwapOperation::Sell
        };
        let chain = self.chain.clone();
        let sink = self.sink.clone();
        let broadcaster = self.broadcaster.clone();
        let token = token.to_string();
        let pool_lower = address_to_lower(&pool.address);
        let protocol = pool.kind.protocol_tag().to_string();
        tokio::spawn(async move {
            let user_address = match chain.get_transaction(hash).await {
                Ok(Some(tx)) => address_to_lower(&tx.from),
                _ => String::new(),
            };
            if !user_address.is_empty() {
                broadcaster
                    .broadcast_room(
                        &token,
                        &ServerMessage::SwapUpdate {
                            tx_hash: format!("{:?}", hash),
                            sender: user_address.clone(),
                        },
                    )
                    .await;
            }
            if !passes_user_filter {
                return;
            }
            let receipt = match chain.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => return,
                Err(e) => {
                    debug!("receipt fetch for {:?} failed: {}", hash, e);
                    return;
                }
            };
            sink.emit(ConfirmationEnvelope::Confirmed {
                tx_hash: format!("{:?}", hash),
                block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or(0),
                gas_used: receipt.gas_used.map(|g| g.as_u64()).unwrap_or(0),
                token_address: token,
                pool_address: pool_lower,
                user_address,
                operation: operation.as_str().to_string(),
                status: "confirmed".to_string(),
                protocol,
                timestamp: iso_timestamp(),
            })
            .await;
        });
    }
}

fn pair_symbol_of(pool: &Pool, is_token0: bool) -> String {
    let pair_token = if is_token0 { pool.token1 } else { pool.token0 };
    PairKind::from_pair_address(&address_to_lower(&pair_token))
        .display_symbol()
        .to_string()
}
