//! Price derivation and aggregation.
//!
//! Per-pool pair prices come from V2 reserve ratios or V3 sqrt-price state;
//! pair prices convert to USD through the BNB/USD reference, through a
//! stable peg, or recursively through another agent token. Token-level
//! prices are the priority-weighted mean of the per-pool samples after
//! outlier rejection.

use crate::common::{PulseError, PulseMetrics, chain, iso_timestamp, normalize_address};
use crate::pools::{Pool, PoolKind, PoolLoader, PoolState, u256_to_f64};
use dashmap::DashMap;
use ethers::core::types::{U256, U512};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// What the non-monitored side of a pool is, which decides the USD
/// conversion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairKind {
    Wbnb,
    /// USD-pegged stable; the symbol is kept for display.
    Stable(String),
    /// Another registered token; USD price resolves recursively.
    Agent(String),
}

impl PairKind {
    /// Classify the pair side of a loaded pool from its token address.
    pub fn from_pair_address(pair_token: &str) -> PairKind {
        let lower = normalize_address(pair_token);
        if chain::is_wbnb(&lower) {
            PairKind::Wbnb
        } else if let Some(symbol) = chain::stable_symbol(&lower) {
            PairKind::Stable(symbol.to_string())
        } else {
            PairKind::Agent(lower)
        }
    }

    pub fn display_symbol(&self) -> &str {
        match self {
            PairKind::Wbnb => "WBNB",
            PairKind::Stable(symbol) => symbol,
            PairKind::Agent(addr) => addr,
        }
    }
}

/// One pool's contribution to a token price. Transient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "priceBNB")]
    pub price_bnb: f64,
    pub pool_address: String,
    pub description: String,
    pub pair: String,
    pub priority: u32,
}

/// Aggregated token price, the cached output of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPrice {
    pub token_address: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "priceBNB")]
    pub price_bnb: f64,
    pub pool_count: usize,
    pub pools: Vec<PriceSample>,
    pub timestamp: String,
}

/// USD/BNB pair for one converted price.
#[derive(Debug, Clone, Copy)]
pub struct UsdPrice {
    pub usd: f64,
    pub bnb: f64,
}

/// Most-recent [TokenPrice] per token, keyed by lowercase address. The only
/// persistence this service has.
#[derive(Default)]
pub struct PriceCache {
    map: DashMap<String, TokenPrice>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token_address: &str) -> Option<TokenPrice> {
        self.map.get(&normalize_address(token_address)).map(|e| e.clone())
    }

    pub fn insert(&self, price: TokenPrice) {
        self.map.insert(price.token_address.clone(), price);
    }

    pub fn remove(&self, token_address: &str) -> bool {
        self.map.remove(&normalize_address(token_address)).is_some()
    }

    pub fn all(&self) -> Vec<TokenPrice> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Pure price math
// ---------------------------------------------------------------------------

/// Constant-product price of the monitored token in pair units.
pub fn v2_pair_price(
    reserve_token: U256,
    reserve_pair: U256,
    decimals_token: u8,
    decimals_pair: u8,
) -> f64 {
    let token_human = u256_to_f64(reserve_token) / 10f64.powi(decimals_token as i32);
    let pair_human = u256_to_f64(reserve_pair) / 10f64.powi(decimals_pair as i32);
    if token_human == 0.0 {
        return 0.0;
    }
    pair_human / token_human
}

/// `(sqrtPriceX96 / 2^96)^2` with the 10^18-scaled integer bridge: square
/// in 512-bit space, scale by 10^18 before the 2^192 shift, then divide the
/// float by 10^18.
pub fn v3_raw_price(sqrt_price_x96: U256) -> f64 {
    if sqrt_price_x96.is_zero() {
        return 0.0;
    }
    let squared: U512 = sqrt_price_x96.full_mul(sqrt_price_x96);
    let scaled = squared * U512::from(1_000_000_000_000_000_000u64);
    let shifted = scaled >> 192;
    let bridged = f64::from_str(&shifted.to_string()).unwrap_or(0.0);
    bridged / 1e18
}

/// Concentrated-liquidity price of the monitored token in pair units.
pub fn v3_pair_price(
    sqrt_price_x96: U256,
    decimals0: u8,
    decimals1: u8,
    monitored_is_token0: bool,
) -> f64 {
    let adjusted =
        v3_raw_price(sqrt_price_x96) * 10f64.powi(decimals0 as i32 - decimals1 as i32);
    if monitored_is_token0 {
        adjusted
    } else if adjusted == 0.0 {
        0.0
    } else {
        1.0 / adjusted
    }
}

/// Price of the monitored token in pair units from a loaded pool.
pub fn pool_pair_price(pool: &Pool, monitored_is_token0: bool) -> f64 {
    match pool.state {
        PoolState::Reserves { reserve0, reserve1 } => {
            let (reserve_token, reserve_pair, dec_token, dec_pair) = if monitored_is_token0 {
                (reserve0, reserve1, pool.decimals0, pool.decimals1)
            } else {
                (reserve1, reserve0, pool.decimals1, pool.decimals0)
            };
            v2_pair_price(reserve_token, reserve_pair, dec_token, dec_pair)
        }
        PoolState::SqrtPrice { sqrt_price_x96, .. } => v3_pair_price(
            sqrt_price_x96,
            pool.decimals0,
            pool.decimals1,
            monitored_is_token0,
        ),
    }
}

/// Drop samples more than 2σ from the mean. Sequences of two or fewer pass
/// through; a rejection that would empty the set returns the original.
pub fn filter_outliers(samples: &[f64]) -> Vec<f64> {
    if samples.len() <= 2 {
        return samples.to_vec();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    let sigma = variance.sqrt();

    let retained: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|p| (p - mean).abs() <= 2.0 * sigma)
        .collect();
    if retained.is_empty() {
        samples.to_vec()
    } else {
        retained
    }
}

/// Mean of `(value, priority)` pairs where each contributes weight
/// `1 / priority`. Lower priority is stronger.
pub fn weighted_average(samples: &[(f64, u32)]) -> f64 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (value, priority) in samples {
        let weight = 1.0 / (*priority).max(1) as f64;
        total += value * weight;
        weight_sum += weight;
    }
    if weight_sum == 0.0 { 0.0 } else { total / weight_sum }
}

/// True when the move from `old` to `new` clears the broadcast threshold.
/// A zero prior price always broadcasts.
pub fn clears_threshold(old: f64, new: f64, threshold: f64) -> bool {
    if old == 0.0 {
        return true;
    }
    ((new - old) / old).abs() >= threshold
}

// ---------------------------------------------------------------------------
// BNB/USD reference
// ---------------------------------------------------------------------------

/// BNB/USD derived from configured V3 reference pools. Readers accept
/// staleness; writers swap the value under a short lock.
pub struct BnbReference {
    value: RwLock<(f64, Option<Instant>)>,
    sources: Vec<String>,
    refresh_interval: Duration,
}

impl BnbReference {
    pub fn new(sources: Vec<String>, refresh_interval: Duration) -> Self {
        Self {
            // Cold start begins on the configured default and counts as
            // immediately stale.
            value: RwLock::new((chain::DEFAULT_BNB_USD, None)),
            sources,
            refresh_interval,
        }
    }

    pub fn get(&self) -> f64 {
        self.value.read().expect("bnb reference lock").0
    }

    pub fn is_stale(&self) -> bool {
        match self.value.read().expect("bnb reference lock").1 {
            Some(updated_at) => updated_at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Re-derive from the reference pools. On total failure the previous
    /// value is retained.
    pub async fn refresh(&self, loader: &PoolLoader) {
        let mut derived = Vec::new();
        for source in &self.sources {
            match self.source_price(loader, source).await {
                Ok(price) if price > 0.0 => derived.push(price),
                Ok(_) => {}
                Err(e) => warn!("bnb reference source {} failed: {}", source, e),
            }
        }
        if derived.is_empty() {
            warn!("bnb reference refresh produced no samples; keeping previous value");
            return;
        }
        let retained = filter_outliers(&derived);
        let mean = retained.iter().sum::<f64>() / retained.len() as f64;
        *self.value.write().expect("bnb reference lock") = (mean, Some(Instant::now()));
        debug!("bnb/usd reference refreshed: {:.4}", mean);
    }

    async fn source_price(&self, loader: &PoolLoader, source: &str) -> Result<f64, PulseError> {
        let address = crate::pools::key_to_address(source)?;
        let pool = loader.load(address, PoolKind::V3, 18).await?;
        let token0 = crate::common::address_to_lower(&pool.token0);
        let token1 = crate::common::address_to_lower(&pool.token1);
        let raw = v3_pair_price(
            match pool.state {
                PoolState::SqrtPrice { sqrt_price_x96, .. } => sqrt_price_x96,
                PoolState::Reserves { .. } => U256::zero(),
            },
            pool.decimals0,
            pool.decimals1,
            true,
        );
        if chain::is_wbnb(&token0) && chain::is_stable(&token1) {
            // token1 (stable) per token0 (BNB): already USD per BNB.
            Ok(raw)
        } else if chain::is_stable(&token0) && chain::is_wbnb(&token1) {
            if raw == 0.0 { Ok(0.0) } else { Ok(1.0 / raw) }
        } else {
            Err(PulseError::Validation(format!(
                "reference pool {} is not a BNB/stable pair",
                source
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Agent tokens
// ---------------------------------------------------------------------------

/// One price source for an agent token.
#[derive(Debug, Clone)]
pub struct AgentSource {
    pub pool: String,
    pub kind: PoolKind,
    pub priority: u32,
}

/// A token whose USD price derives from other pools, possibly through
/// further agent tokens.
#[derive(Debug, Clone)]
pub struct AgentTokenEntry {
    pub symbol: String,
    pub sources: Vec<AgentSource>,
}

struct AgentCacheEntry {
    price_usd: f64,
    updated_at: Instant,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Shared price engine: math, BNB reference, agent registry, and the
/// per-token aggregation pipeline.
pub struct PriceEngine {
    loader: Arc<PoolLoader>,
    pub bnb: BnbReference,
    agents: DashMap<String, AgentTokenEntry>,
    agent_cache: DashMap<String, AgentCacheEntry>,
    agent_cache_ttl: Duration,
    metrics: Arc<PulseMetrics>,
}

impl PriceEngine {
    pub fn new(
        loader: Arc<PoolLoader>,
        bnb_sources: Vec<String>,
        bnb_refresh_interval: Duration,
        agent_cache_ttl: Duration,
        metrics: Arc<PulseMetrics>,
    ) -> Self {
        Self {
            loader,
            bnb: BnbReference::new(bnb_sources, bnb_refresh_interval),
            agents: DashMap::new(),
            agent_cache: DashMap::new(),
            agent_cache_ttl,
            metrics,
        }
    }

    pub fn loader(&self) -> &Arc<PoolLoader> {
        &self.loader
    }

    /// Register or replace an agent-token entry.
    pub fn register_agent(&self, token_address: &str, entry: AgentTokenEntry) {
        self.agents.insert(normalize_address(token_address), entry);
    }

    pub fn remove_agent(&self, token_address: &str) -> bool {
        self.agents.remove(&normalize_address(token_address)).is_some()
    }

    pub fn is_agent(&self, token_address: &str) -> bool {
        self.agents.contains_key(&normalize_address(token_address))
    }

    /// Refresh BNB/USD if the cached value has aged past the interval.
    pub async fn refresh_bnb_if_stale(&self) {
        if self.bnb.is_stale() {
            self.bnb.refresh(&self.loader).await;
        }
    }

    /// Convert a pair-denominated price to USD and BNB.
    pub async fn convert_to_usd(
        &self,
        price_in_pair: f64,
        pair: &PairKind,
        call_stack: &[String],
    ) -> UsdPrice {
        let bnb_usd = self.bnb.get();
        match pair {
            PairKind::Wbnb => UsdPrice {
                usd: price_in_pair * bnb_usd,
                bnb: price_in_pair,
            },
            PairKind::Stable(_) => UsdPrice {
                usd: price_in_pair,
                bnb: if bnb_usd == 0.0 {
                    0.0
                } else {
                    price_in_pair / bnb_usd
                },
            },
            PairKind::Agent(addr) => {
                let agent_usd = self.agent_price_usd(addr, call_stack.to_vec()).await;
                let usd = price_in_pair * agent_usd;
                UsdPrice {
                    usd,
                    bnb: if bnb_usd == 0.0 { 0.0 } else { usd / bnb_usd },
                }
            }
        }
    }

    /// USD price of an agent token. The explicit call stack turns a cyclic
    /// pair graph into a zero branch instead of unbounded recursion.
    pub fn agent_price_usd<'a>(
        &'a self,
        token_address: &str,
        call_stack: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = f64> + Send + 'a>> {
        let addr = normalize_address(token_address);
        Box::pin(async move {
            if call_stack.contains(&addr) {
                warn!("agent price cycle through {}; contributing zero", addr);
                self.metrics
                    .record_error("agent-price", format!("cycle detected through {}", addr));
                return 0.0;
            }

            if let Some(cached) = self.agent_cache.get(&addr) {
                if cached.updated_at.elapsed() < self.agent_cache_ttl {
                    self.metrics.cache_hits.inc();
                    return cached.price_usd;
                }
            }
            self.metrics.cache_misses.inc();

            let Some(entry) = self.agents.get(&addr).map(|e| e.clone()) else {
                debug!("agent price requested for unregistered token {}", addr);
                return 0.0;
            };

            let mut next_stack = call_stack;
            next_stack.push(addr.clone());

            let mut samples = Vec::new();
            for source in &entry.sources {
                match self.agent_source_usd(&addr, source, &next_stack).await {
                    Ok(price) if price > 0.0 => samples.push(price),
                    Ok(_) => {}
                    Err(e) => {
                        debug!("agent source {} for {} failed: {}", source.pool, addr, e)
                    }
                }
            }

            if samples.is_empty() {
                return 0.0;
            }
            let retained = filter_outliers(&samples);
            let price = retained.iter().sum::<f64>() / retained.len() as f64;
            self.agent_cache.insert(
                addr,
                AgentCacheEntry {
                    price_usd: price,
                    updated_at: Instant::now(),
                },
            );
            price
        })
    }

    async fn agent_source_usd(
        &self,
        token_address: &str,
        source: &AgentSource,
        call_stack: &[String],
    ) -> Result<f64, PulseError> {
        let pool_addr = crate::pools::key_to_address(&source.pool)?;
        let pool = self.loader.load(pool_addr, source.kind, 18).await?;
        let monitored = crate::pools::key_to_address(token_address)?;
        let is_token0 = pool.side_of(monitored)?;
        if !pool.has_liquidity() {
            return Ok(0.0);
        }
        let pair_token = if is_token0 { pool.token1 } else { pool.token0 };
        let pair = PairKind::from_pair_address(&crate::common::address_to_lower(&pair_token));
        let price_in_pair = pool_pair_price(&pool, is_token0);
        Ok(self.convert_to_usd(price_in_pair, &pair, call_stack).await.usd)
    }

    /// Token-level aggregation: outlier-filter the USD samples, then
    /// priority-weighted averages for USD and BNB. `None` when nothing
    /// survives.
    pub fn aggregate(
        &self,
        token_address: &str,
        symbol: &str,
        name: &str,
        samples: Vec<PriceSample>,
    ) -> Option<TokenPrice> {
        if samples.is_empty() {
            return None;
        }
        let usd_values: Vec<f64> = samples.iter().map(|s| s.price_usd).collect();
        let retained_values = filter_outliers(&usd_values);
        let surviving: Vec<PriceSample> = samples
            .into_iter()
            .filter(|s| retained_values.contains(&s.price_usd))
            .collect();
        if surviving.is_empty() {
            return None;
        }

        let usd_pairs: Vec<(f64, u32)> =
            surviving.iter().map(|s| (s.price_usd, s.priority)).collect();
        let bnb_pairs: Vec<(f64, u32)> =
            surviving.iter().map(|s| (s.price_bnb, s.priority)).collect();

        self.metrics.price_updates.inc();
        Some(TokenPrice {
            token_address: normalize_address(token_address),
            symbol: symbol.to_string(),
            name: name.to_string(),
            price_usd: weighted_average(&usd_pairs),
            price_bnb: weighted_average(&bnb_pairs),
            pool_count: surviving.len(),
            pools: surviving,
            timestamp: iso_timestamp(),
        })
    }
}
