//! Token→pool listener registry.
//!
//! Owns the mapping from monitored token to its active pool listeners:
//! idempotent add, dynamic add from request payloads, safe remove, and
//! resubscribe after a reconnect. Swap handlers for one token serialize on
//! that token's binding lock; independent tokens proceed concurrently.

use crate::chain::{ChainClient, SubscriptionHandle};
use crate::common::{
    PulseError, PulseMetrics, address_to_lower, format_token_amount, iso_timestamp,
    normalize_address, parse_address,
};
use crate::fanout::{
    Broadcaster, FormattedPrice, PriceUpdatePayload, ServerMessage, SwapEventPayload,
};
use crate::pools::{
    Pool, PoolFamily, PoolKind, SwapLog, classify_swap, decode_swap_log, key_to_address,
    swap_topic,
};
use crate::price::{
    PairKind, PriceCache, PriceEngine, PriceSample, TokenPrice, clears_threshold, pool_pair_price,
};
use dashmap::DashMap;
use ethers::core::types::{H256, Log};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

fn default_priority() -> u32 {
    1
}

fn default_decimals() -> u8 {
    18
}

/// One pool of a token binding, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntryConfig {
    pub pool_address: String,
    /// Protocol tag: `uniswapv2`, `uniswapv3`, `aerodromev2`, `aerodromev3`,
    /// or `slipstream`.
    pub protocol: String,
    /// Pair side: a stable/WBNB symbol or the pair token's address.
    pub pair: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// V3 fee tier, informational.
    #[serde(default)]
    pub fee: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Static or dynamic configuration of one monitored token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub symbol: String,
    pub name: String,
    #[serde(default = "default_decimals")]
    pub fallback_decimals: u8,
    pub pools: Vec<PoolEntryConfig>,
}

/// Request payload for a runtime token registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicTokenSpec {
    pub token_address: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
    pub pools: Vec<PoolEntryConfig>,
}

/// One live pool subscription, for the listener summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerInfo {
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
}

/// Per-token outcome of a dynamic add.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub token_address: String,
    pub added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<TokenPrice>,
}

/// A loaded, validated pool under watch for one token.
#[derive(Debug, Clone)]
pub struct WatchedPool {
    pub pool: Pool,
    pub is_token0: bool,
    pub pair: PairKind,
    pub pair_symbol: String,
    pub priority: u32,
    pub description: String,
}

/// Live binding of one token: configuration, loaded pools, last price.
#[derive(Debug)]
pub struct TokenBinding {
    pub token_address: String,
    pub config: TokenConfig,
    pub pools: Vec<WatchedPool>,
    pub last_price: f64,
    pub last_update_call: Option<Instant>,
    pub is_dynamic: bool,
}

/// A live pool subscription. Dropping the entry runs the teardown thunk
/// exactly once; removal code never reaches into the chain client.
struct ActiveListener {
    pool_address: String,
    token_address: String,
    kind: PoolKind,
    handle: SubscriptionHandle,
}

fn listener_key(token_lower: &str, pool_lower: &str) -> String {
    format!("{}_{}", token_lower, pool_lower)
}

pub struct ListenerRegistry {
    chain: Arc<ChainClient>,
    engine: Arc<PriceEngine>,
    cache: Arc<PriceCache>,
    broadcaster: Broadcaster,
    metrics: Arc<PulseMetrics>,
    token_configs: DashMap<String, TokenConfig>,
    bindings: DashMap<String, Arc<Mutex<TokenBinding>>>,
    listeners: Mutex<HashMap<String, ActiveListener>>,
    price_update_threshold: f64,
    coalesce_window: Duration,
}

impl ListenerRegistry {
    pub fn new(
        chain: Arc<ChainClient>,
        engine: Arc<PriceEngine>,
        cache: Arc<PriceCache>,
        broadcaster: Broadcaster,
        metrics: Arc<PulseMetrics>,
        price_update_threshold: f64,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            chain,
            engine,
            cache,
            broadcaster,
            metrics,
            token_configs: DashMap::new(),
            bindings: DashMap::new(),
            listeners: Mutex::new(HashMap::new()),
            price_update_threshold,
            coalesce_window,
        }
    }

    /// Register a static token configuration for later `add_token` calls.
    pub fn register_token_config(&self, token_address: &str, config: TokenConfig) {
        self.token_configs.insert(normalize_address(token_address), config);
    }

    pub fn has_config(&self, token_address: &str) -> bool {
        self.token_configs.contains_key(&normalize_address(token_address))
    }

    pub fn is_monitored(&self, token_address: &str) -> bool {
        self.bindings.contains_key(&normalize_address(token_address))
    }

    pub fn monitored_tokens(&self) -> Vec<String> {
        self.bindings.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn active_listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Summary of every live pool subscription.
    pub async fn active_listeners(&self) -> Vec<ListenerInfo> {
        self.listeners
            .lock()
            .await
            .values()
            .map(|l| ListenerInfo {
                token_address: l.token_address.clone(),
                pool_address: l.pool_address.clone(),
                protocol: l.kind.protocol_tag().to_string(),
            })
            .collect()
    }

    /// Start monitoring a statically-configured token. Idempotent: an
    /// existing binding just returns its cached price.
    pub async fn add_token(
        self: &Arc<Self>,
        token_address: &str,
    ) -> Result<Option<TokenPrice>, PulseError> {
        let token = normalize_address(token_address);
        if self.bindings.contains_key(&token) {
            return Ok(self.cache.get(&token));
        }
        let config = self
            .token_configs
            .get(&token)
            .map(|c| c.clone())
            .ok_or_else(|| {
                PulseError::Validation(format!("no configuration for token {}", token))
            })?;
        self.attach(token, config, false).await
    }

    /// Register and start monitoring a token described by a request
    /// payload. Rejects before mutating anything.
    pub async fn add_dynamic_token(
        self: &Arc<Self>,
        spec: DynamicTokenSpec,
    ) -> Result<Option<TokenPrice>, PulseError> {
        let token = normalize_address(&spec.token_address);
        parse_address(&token)?;
        if spec.pools.is_empty() {
            return Err(PulseError::Validation(
                "dynamic token needs at least one pool".to_string(),
            ));
        }
        for entry in &spec.pools {
            parse_address(&entry.pool_address)?;
            if PoolKind::from_protocol_tag(&entry.protocol).is_none() {
                return Err(PulseError::Validation(format!(
                    "unknown protocol tag: {}",
                    entry.protocol
                )));
            }
            validate_pair_tag(&entry.pair)?;
        }

        if self.bindings.contains_key(&token) {
            return Ok(self.cache.get(&token));
        }
        let config = TokenConfig {
            symbol: spec.symbol.unwrap_or_else(|| "UNKNOWN".to_string()),
            name: spec.name.unwrap_or_else(|| token.clone()),
            fallback_decimals: spec.decimals.unwrap_or(18),
            pools: spec.pools,
        };
        self.attach(token, config, true).await
    }

    /// Load pools, compute the initial price, and attach swap listeners.
    async fn attach(
        self: &Arc<Self>,
        token: String,
        config: TokenConfig,
        is_dynamic: bool,
    ) -> Result<Option<TokenPrice>, PulseError> {
        self.engine.refresh_bnb_if_stale().await;
        let monitored = key_to_address(&token)?;

        let mut watched = Vec::new();
        for entry in &config.pools {
            let Some(kind) = PoolKind::from_protocol_tag(&entry.protocol) else {
                warn!("unknown protocol {} for pool {}", entry.protocol, entry.pool_address);
                continue;
            };
            let pool_addr = parse_address(&entry.pool_address)?;
            let pool = match self
                .engine
                .loader()
                .load(pool_addr, kind, config.fallback_decimals)
                .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("pool {} load failed: {}", entry.pool_address, e);
                    self.metrics.record_error("pool-load", e.to_string());
                    continue;
                }
            };
            let is_token0 = match pool.side_of(monitored) {
                Ok(side) => side,
                Err(e) => {
                    warn!("{}", e);
                    self.metrics.record_error("pool-validate", e.to_string());
                    continue;
                }
            };
            if !pool.has_liquidity() {
                debug!("pool {} has no liquidity; skipping", entry.pool_address);
                continue;
            }
            let pair_token = if is_token0 { pool.token1 } else { pool.token0 };
            let pair = PairKind::from_pair_address(&address_to_lower(&pair_token));
            let pair_symbol = pair.display_symbol().to_string();
            let description = entry.description.clone().unwrap_or_else(|| {
                format!("{} {}/{}", entry.protocol, config.symbol, pair_symbol)
            });
            watched.push(WatchedPool {
                pool,
                is_token0,
                pair,
                pair_symbol,
                priority: entry.priority,
                description,
            });
        }

        if watched.is_empty() {
            // Zero live pools: nothing to monitor, nothing broadcast.
            return Ok(None);
        }

        let samples = self.samples_from(&watched).await;
        let price = self
            .engine
            .aggregate(&token, &config.symbol, &config.name, samples);
        if let Some(p) = &price {
            self.cache.insert(p.clone());
        }
        let last_price = price.as_ref().map(|p| p.price_usd).unwrap_or(0.0);

        let subscriptions: Vec<(String, PoolKind)> = watched
            .iter()
            .map(|w| (address_to_lower(&w.pool.address), w.pool.kind))
            .collect();

        self.bindings.insert(
            token.clone(),
            Arc::new(Mutex::new(TokenBinding {
                token_address: token.clone(),
                config,
                pools: watched,
                last_price,
                last_update_call: None,
                is_dynamic,
            })),
        );

        for (pool_lower, kind) in subscriptions {
            if let Err(e) = self.attach_pool_listener(&token, &pool_lower, kind).await {
                warn!("swap subscription for {} failed: {}", pool_lower, e);
                self.metrics.record_error("subscribe", e.to_string());
            }
        }

        if let Some(p) = &price {
            if p.price_usd > 0.0 {
                self.broadcast_price(p).await;
            }
        }
        info!("token {} monitored ({} pools)", token, self.pool_count(&token).await);
        Ok(price)
    }

    async fn pool_count(&self, token: &str) -> usize {
        match self.bindings.get(token).map(|b| b.clone()) {
            Some(binding) => binding.lock().await.pools.len(),
            None => 0,
        }
    }

    /// Subscribe to one pool's swap topic and pump its logs into the
    /// per-token handler. Sweeps any case-variant duplicate first.
    async fn attach_pool_listener(
        self: &Arc<Self>,
        token: &str,
        pool_lower: &str,
        kind: PoolKind,
    ) -> Result<(), PulseError> {
        let key = listener_key(token, pool_lower);
        {
            let mut listeners = self.listeners.lock().await;
            let duplicates: Vec<String> = listeners
                .keys()
                .filter(|k| k.to_lowercase() == key)
                .cloned()
                .collect();
            for dup in duplicates {
                if let Some(stale) = listeners.remove(&dup) {
                    debug!("tearing down duplicate listener {}", dup);
                    drop(stale);
                }
            }
        }

        let pool_address = key_to_address(pool_lower)?;
        let (mut rx, handle) = self
            .chain
            .subscribe_logs(pool_address, swap_topic(kind))
            .await?;
        {
            let mut listeners = self.listeners.lock().await;
            listeners.insert(
                key,
                ActiveListener {
                    pool_address: pool_lower.to_string(),
                    token_address: token.to_string(),
                    kind,
                    handle,
                },
            );
        }

        let registry = self.clone();
        let token = token.to_string();
        let pool_lower = pool_lower.to_string();
        tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                registry.on_swap_log(&token, &pool_lower, kind, log).await;
            }
        });
        Ok(())
    }

    /// Tear down a token: every listener handle, the binding, and the
    /// cached price. Returns whether a binding existed and the pool
    /// addresses released, so the caller can clear mempool monitors.
    pub async fn remove_token(&self, token_address: &str) -> (bool, Vec<String>) {
        let token = normalize_address(token_address);
        let removed_pools = self.detach_listeners(&token).await;
        let existed = self.bindings.remove(&token).is_some();
        self.cache.remove(&token);
        if existed {
            info!("token {} removed ({} listeners torn down)", token, removed_pools.len());
        }
        (existed, removed_pools)
    }

    async fn detach_listeners(&self, token_lower: &str) -> Vec<String> {
        let mut listeners = self.listeners.lock().await;
        let keys: Vec<String> = listeners
            .keys()
            .filter(|k| k.starts_with(token_lower))
            .cloned()
            .collect();
        let mut pools = Vec::new();
        for key in keys {
            if let Some(listener) = listeners.remove(&key) {
                pools.push(listener.pool_address.clone());
                // Dropping the entry runs the teardown thunk.
                drop(listener);
            }
        }
        pools
    }

    /// Re-attach every stored binding after a reconnect, reusing each
    /// binding's configuration as-is.
    pub async fn on_reconnect(self: &Arc<Self>) {
        let tokens: Vec<String> = self.bindings.iter().map(|e| e.key().clone()).collect();
        info!("re-attaching {} token bindings after reconnect", tokens.len());
        for token in tokens {
            self.detach_listeners(&token).await;
            let Some(binding_arc) = self.bindings.get(&token).map(|b| b.clone()) else {
                continue;
            };
            let (config, is_dynamic) = {
                let binding = binding_arc.lock().await;
                (binding.config.clone(), binding.is_dynamic)
            };
            self.bindings.remove(&token);
            if let Err(e) = self.attach(token.clone(), config, is_dynamic).await {
                warn!("re-attach of {} failed: {}", token, e);
                self.metrics.record_error("resubscribe", e.to_string());
            }
        }
    }

    pub async fn binding_is_dynamic(&self, token_address: &str) -> Option<bool> {
        let binding = self
            .bindings
            .get(&normalize_address(token_address))
            .map(|b| b.clone())?;
        let is_dynamic = binding.lock().await.is_dynamic;
        Some(is_dynamic)
    }

    /// Swap-log entry point: decode and broadcast synchronously, then hand
    /// the RPC-dependent work to background tasks.
    async fn on_swap_log(self: &Arc<Self>, token: &str, pool_lower: &str, kind: PoolKind, log: Log) {
        self.metrics.events_received.inc();
        let Some(binding_arc) = self.bindings.get(token).map(|b| b.clone()) else {
            return;
        };

        let tx_hash = log.transaction_hash;
        let (payload, needs_reserve_refresh) = {
            let mut binding = binding_arc.lock().await;
            let symbol = binding.config.symbol.clone();
            let price_usd = binding.last_price;
            let Some(watched) = binding
                .pools
                .iter_mut()
                .find(|w| address_to_lower(&w.pool.address) == pool_lower)
            else {
                return;
            };

            let swap = match decode_swap_log(kind, &log) {
                Ok(swap) => swap,
                Err(e) => {
                    self.metrics.record_error("swap-decode", e.to_string());
                    return;
                }
            };
            let (token_decimals, pair_decimals) = if watched.is_token0 {
                (watched.pool.decimals0, watched.pool.decimals1)
            } else {
                (watched.pool.decimals1, watched.pool.decimals0)
            };
            let info = classify_swap(&swap, watched.is_token0, token_decimals, pair_decimals);

            // Concentrated pools carry the post-swap price in the log
            // itself; constant-product pools need a reserves refresh.
            if let SwapLog::V3 {
                sqrt_price_x96,
                liquidity,
                ..
            } = swap
            {
                watched.pool.apply_sqrt_price(sqrt_price_x96, liquidity);
            }

            let value_usd = info.token_amount * price_usd;
            let bnb_usd = self.engine.bnb.get();
            let amount_bnb = match watched.pair {
                PairKind::Wbnb => info.pair_amount,
                _ if bnb_usd > 0.0 => value_usd / bnb_usd,
                _ => 0.0,
            };

            let payload = SwapEventPayload {
                token_address: token.to_string(),
                symbol,
                pool_address: pool_lower.to_string(),
                tx_hash: tx_hash.map(|h| format!("{:?}", h)).unwrap_or_default(),
                kind: if info.is_buy { "buy" } else { "sell" }.to_string(),
                // Resolved by the follow-up swap-update; no RPC here.
                sender: String::new(),
                amount_bnb,
                amount_token: info.token_amount,
                pair_symbol: watched.pair_symbol.clone(),
                pair_amount: info.pair_amount,
                price_usd,
                value_usd,
                timestamp: iso_timestamp(),
            };
            (
                payload,
                watched.pool.kind.family() == PoolFamily::ConstantProduct,
            )
        };

        self.broadcaster
            .broadcast_room(token, &ServerMessage::SwapEvent(payload))
            .await;

        if let Some(hash) = tx_hash {
            let registry = self.clone();
            let token = token.to_string();
            tokio::spawn(async move {
                registry.resolve_swap_sender(&token, hash).await;
            });
        }

        let registry = self.clone();
        let token = token.to_string();
        let pool_lower = pool_lower.to_string();
        tokio::spawn(async move {
            if needs_reserve_refresh {
                registry.refresh_pool_state(&token, &pool_lower).await;
            }
            registry.handle_price_update(&token).await;
        });
    }

    /// Follow-up to the instant swap-event: fetch the transaction and push
    /// the real `from` on the same room.
    async fn resolve_swap_sender(&self, token: &str, tx_hash: H256) {
        match self.chain.get_transaction(tx_hash).await {
            Ok(Some(tx)) => {
                self.broadcaster
                    .broadcast_room(
                        token,
                        &ServerMessage::SwapUpdate {
                            tx_hash: format!("{:?}", tx_hash),
                            sender: address_to_lower(&tx.from),
                        },
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => debug!("sender lookup for {:?} failed: {}", tx_hash, e),
        }
    }

    /// Re-read mutable pool state. The lock is not held across the RPC.
    async fn refresh_pool_state(&self, token: &str, pool_lower: &str) {
        let Some(binding_arc) = self.bindings.get(token).map(|b| b.clone()) else {
            return;
        };
        let snapshot = {
            let binding = binding_arc.lock().await;
            binding
                .pools
                .iter()
                .find(|w| address_to_lower(&w.pool.address) == pool_lower)
                .map(|w| w.pool.clone())
        };
        let Some(pool) = snapshot else { return };
        match self.engine.loader().refresh_state(&pool).await {
            Ok(state) => {
                let mut binding = binding_arc.lock().await;
                if let Some(watched) = binding
                    .pools
                    .iter_mut()
                    .find(|w| address_to_lower(&w.pool.address) == pool_lower)
                {
                    watched.pool.state = state;
                }
            }
            Err(e) => {
                debug!("state refresh for {} failed: {}", pool_lower, e);
                self.metrics.record_error("state-refresh", e.to_string());
            }
        }
    }

    /// Recompute and maybe broadcast a token price. Calls inside the
    /// coalescing window are dropped; the cache is updated regardless of
    /// the broadcast threshold.
    pub async fn handle_price_update(&self, token_address: &str) {
        let token = normalize_address(token_address);
        let Some(binding_arc) = self.bindings.get(&token).map(|b| b.clone()) else {
            return;
        };

        {
            let mut binding = binding_arc.lock().await;
            if let Some(last) = binding.last_update_call {
                if last.elapsed() < self.coalesce_window {
                    return;
                }
            }
            binding.last_update_call = Some(Instant::now());
        }

        self.engine.refresh_bnb_if_stale().await;

        let (watched_snapshot, symbol, name) = {
            let binding = binding_arc.lock().await;
            (
                binding.pools.clone(),
                binding.config.symbol.clone(),
                binding.config.name.clone(),
            )
        };
        let samples = self.samples_from(&watched_snapshot).await;
        let Some(price) = self.engine.aggregate(&token, &symbol, &name, samples) else {
            return;
        };
        self.cache.insert(price.clone());

        let should_broadcast = {
            let mut binding = binding_arc.lock().await;
            let old = binding.last_price;
            binding.last_price = price.price_usd;
            clears_threshold(old, price.price_usd, self.price_update_threshold)
        };
        if should_broadcast {
            self.broadcast_price(&price).await;
        }
    }

    /// Per-pool USD/BNB samples from in-memory pool state.
    async fn samples_from(&self, watched: &[WatchedPool]) -> Vec<PriceSample> {
        let mut samples = Vec::new();
        for entry in watched {
            if !entry.pool.has_liquidity() {
                continue;
            }
            let price_in_pair = pool_pair_price(&entry.pool, entry.is_token0);
            if price_in_pair <= 0.0 {
                continue;
            }
            let converted = self
                .engine
                .convert_to_usd(price_in_pair, &entry.pair, &[])
                .await;
            if converted.usd <= 0.0 {
                continue;
            }
            samples.push(PriceSample {
                price_usd: converted.usd,
                price_bnb: converted.bnb,
                pool_address: address_to_lower(&entry.pool.address),
                description: entry.description.clone(),
                pair: entry.pair_symbol.clone(),
                priority: entry.priority,
            });
        }
        samples
    }

    async fn broadcast_price(&self, price: &TokenPrice) {
        let payload = PriceUpdatePayload {
            price: price.clone(),
            formatted: FormattedPrice {
                price_usd: format!("${}", format_token_amount(price.price_usd)),
                price_bnb: format!("{} BNB", format_token_amount(price.price_bnb)),
            },
        };
        self.broadcaster
            .broadcast_room(&price.token_address, &ServerMessage::PriceUpdate(payload))
            .await;
    }
}

/// A pair tag must be a known symbol or a parseable address.
fn validate_pair_tag(pair: &str) -> Result<(), PulseError> {
    let upper = pair.to_ascii_uppercase();
    if matches!(upper.as_str(), "WBNB" | "BNB" | "USDT" | "USDC" | "BUSD" | "DAI") {
        return Ok(());
    }
    parse_address(pair).map(|_| ()).map_err(|_| {
        PulseError::Validation(format!("unknown pair tag: {}", pair))
    })
}

/// Resolve a pair tag to the classification used for USD conversion when
/// only the tag is known (tests and mempool previews); live bindings
/// classify from the loaded pool side instead.
pub fn pair_kind_from_tag(pair: &str) -> Option<PairKind> {
    let upper = pair.to_ascii_uppercase();
    match upper.as_str() {
        "WBNB" | "BNB" => Some(PairKind::Wbnb),
        "USDT" | "USDC" | "BUSD" | "DAI" => Some(PairKind::Stable(upper)),
        _ => {
            if pair.starts_with("0x") && pair.len() == 42 {
                Some(PairKind::from_pair_address(pair))
            } else {
                None
            }
        }
    }
}

