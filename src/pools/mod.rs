//! AMM pool metadata and state reads over raw `eth_call`.
//!
//! Two pool families, each with two variants: constant-product (Uniswap V2
//! and its Aerodrome sibling) and concentrated-liquidity (Uniswap V3 and
//! Slipstream). Loads go through hand-encoded selectors and manual word
//! slicing; no ABI bindings.

pub mod swap;

use crate::chain::ChainClient;
use crate::common::{PulseError, address_to_lower, chain, normalize_address};
use dashmap::DashMap;
use ethers::core::types::{Address, Bytes, U256};
use log::warn;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub use swap::{SwapInfo, SwapLog, classify_swap, decode_swap_log, swap_topic};

// Selectors (first 4 bytes of keccak256)
const SELECTOR_GET_RESERVES: &[u8] = &[0x09, 0x02, 0xf1, 0xac];
const SELECTOR_SLOT0: &[u8] = &[0x38, 0x50, 0xc7, 0xbd];
const SELECTOR_TOKEN0: &[u8] = &[0x0d, 0xfe, 0x16, 0x81];
const SELECTOR_TOKEN1: &[u8] = &[0xd2, 0x12, 0x20, 0xa7];
const SELECTOR_DECIMALS: &[u8] = &[0x31, 0x3c, 0xe5, 0x67];
const SELECTOR_FEE: &[u8] = &[0xdd, 0xca, 0x3f, 0x43];
const SELECTOR_LIQUIDITY: &[u8] = &[0x1a, 0x68, 0x65, 0x02];
const SELECTOR_TICK_SPACING: &[u8] = &[0xd0, 0xc9, 0x3a, 0x7c];

/// Closed set of supported pool variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    V2,
    V3,
    AeroV2,
    Slipstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFamily {
    ConstantProduct,
    ConcentratedLiquidity,
}

impl PoolKind {
    /// Map an external protocol tag onto a variant. `aerodromev3` and
    /// `slipstream` name the same family.
    pub fn from_protocol_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "uniswapv2" | "pancakeswapv2" => Some(PoolKind::V2),
            "uniswapv3" | "pancakeswapv3" => Some(PoolKind::V3),
            "aerodromev2" => Some(PoolKind::AeroV2),
            "aerodromev3" | "slipstream" => Some(PoolKind::Slipstream),
            _ => None,
        }
    }

    pub fn protocol_tag(&self) -> &'static str {
        match self {
            PoolKind::V2 => "uniswapv2",
            PoolKind::V3 => "uniswapv3",
            PoolKind::AeroV2 => "aerodromev2",
            PoolKind::Slipstream => "slipstream",
        }
    }

    pub fn family(&self) -> PoolFamily {
        match self {
            PoolKind::V2 | PoolKind::AeroV2 => PoolFamily::ConstantProduct,
            PoolKind::V3 | PoolKind::Slipstream => PoolFamily::ConcentratedLiquidity,
        }
    }
}

/// Mutable pool state, updated by swap handlers.
#[derive(Debug, Clone, Copy)]
pub enum PoolState {
    Reserves { reserve0: U256, reserve1: U256 },
    SqrtPrice { sqrt_price_x96: U256, liquidity: u128 },
}

/// Loaded pool: immutable identity plus the last observed state.
#[derive(Debug, Clone)]
pub struct Pool {
    pub address: Address,
    pub kind: PoolKind,
    pub token0: Address,
    pub token1: Address,
    pub decimals0: u8,
    pub decimals1: u8,
    pub fee: Option<u32>,
    pub tick_spacing: Option<i32>,
    pub state: PoolState,
}

impl Pool {
    pub fn has_liquidity(&self) -> bool {
        match self.state {
            PoolState::Reserves { reserve0, reserve1 } => {
                !reserve0.is_zero() && !reserve1.is_zero()
            }
            PoolState::SqrtPrice { liquidity, .. } => liquidity > 0,
        }
    }

    /// Whether `token` is token0 of this pool; [PulseError::TokenNotInPool]
    /// when it is neither side.
    pub fn side_of(&self, token: Address) -> Result<bool, PulseError> {
        if token == self.token0 {
            Ok(true)
        } else if token == self.token1 {
            Ok(false)
        } else {
            Err(PulseError::TokenNotInPool {
                token: address_to_lower(&token),
                pool: address_to_lower(&self.address),
            })
        }
    }

    /// Update the concentrated-liquidity price directly from a swap log.
    /// No-op for constant-product pools, whose reserves come from a refresh.
    pub fn apply_sqrt_price(&mut self, sqrt_price_x96: U256, liquidity: u128) {
        if let PoolState::SqrtPrice { .. } = self.state {
            self.state = PoolState::SqrtPrice {
                sqrt_price_x96,
                liquidity,
            };
        }
    }
}

/// Reads pool metadata and state; caches token decimals by address.
pub struct PoolLoader {
    client: Arc<ChainClient>,
    decimals_cache: DashMap<String, u8>,
}

impl PoolLoader {
    pub fn new(client: Arc<ChainClient>) -> Self {
        Self {
            client,
            decimals_cache: DashMap::new(),
        }
    }

    /// Load identity and current state for a pool of the given kind.
    pub async fn load(
        &self,
        address: Address,
        kind: PoolKind,
        fallback_decimals: u8,
    ) -> Result<Pool, PulseError> {
        let token0_raw = self.client.call(address, SELECTOR_TOKEN0.to_vec()).await?;
        let token1_raw = self.client.call(address, SELECTOR_TOKEN1.to_vec()).await?;
        let token0 = address_from_word(&token0_raw)?;
        let token1 = address_from_word(&token1_raw)?;

        let decimals0 = self.token_decimals(token0, fallback_decimals).await;
        let decimals1 = self.token_decimals(token1, fallback_decimals).await;

        let (fee, tick_spacing, state) = match kind.family() {
            PoolFamily::ConstantProduct => {
                let reserves = self
                    .client
                    .call(address, SELECTOR_GET_RESERVES.to_vec())
                    .await?;
                let reserve0 = word_at(&reserves, 0)?;
                let reserve1 = word_at(&reserves, 1)?;
                (None, None, PoolState::Reserves { reserve0, reserve1 })
            }
            PoolFamily::ConcentratedLiquidity => {
                let fee_raw = self.client.call(address, SELECTOR_FEE.to_vec()).await?;
                let fee = word_at(&fee_raw, 0)?.low_u32();
                let liquidity_raw = self
                    .client
                    .call(address, SELECTOR_LIQUIDITY.to_vec())
                    .await?;
                let liquidity = word_at(&liquidity_raw, 0)?.low_u128();
                let slot0_raw = self.client.call(address, SELECTOR_SLOT0.to_vec()).await?;
                let sqrt_price_x96 = decode_slot0_sqrt_price(&slot0_raw)?;
                // Slipstream keeps tickSpacing immutable on the pool.
                let tick_spacing = match self.client.call(address, SELECTOR_TICK_SPACING.to_vec()).await
                {
                    Ok(raw) => word_at(&raw, 0).ok().map(|w| sign_extended_i32(w)),
                    Err(_) => None,
                };
                (
                    Some(fee),
                    tick_spacing,
                    PoolState::SqrtPrice {
                        sqrt_price_x96,
                        liquidity,
                    },
                )
            }
        };

        Ok(Pool {
            address,
            kind,
            token0,
            token1,
            decimals0,
            decimals1,
            fee,
            tick_spacing,
            state,
        })
    }

    /// Re-read mutable state only, keeping identity fields as loaded.
    pub async fn refresh_state(&self, pool: &Pool) -> Result<PoolState, PulseError> {
        match pool.kind.family() {
            PoolFamily::ConstantProduct => {
                let reserves = self
                    .client
                    .call(pool.address, SELECTOR_GET_RESERVES.to_vec())
                    .await?;
                Ok(PoolState::Reserves {
                    reserve0: word_at(&reserves, 0)?,
                    reserve1: word_at(&reserves, 1)?,
                })
            }
            PoolFamily::ConcentratedLiquidity => {
                let slot0_raw = self.client.call(pool.address, SELECTOR_SLOT0.to_vec()).await?;
                let liquidity_raw = self
                    .client
                    .call(pool.address, SELECTOR_LIQUIDITY.to_vec())
                    .await?;
                Ok(PoolState::SqrtPrice {
                    sqrt_price_x96: decode_slot0_sqrt_price(&slot0_raw)?,
                    liquidity: word_at(&liquidity_raw, 0)?.low_u128(),
                })
            }
        }
    }

    /// Token decimals with a per-address cache. Known addresses skip the
    /// call; failures warn once and fall back to the configured value.
    pub async fn token_decimals(&self, token: Address, fallback: u8) -> u8 {
        let key = address_to_lower(&token);
        if let Some(cached) = self.decimals_cache.get(&key) {
            return *cached;
        }
        if let Some(known) = chain::known_decimals(&key) {
            self.decimals_cache.insert(key, known);
            return known;
        }
        let decimals = match self.client.call(token, SELECTOR_DECIMALS.to_vec()).await {
            Ok(raw) if raw.len() >= 32 => raw[31],
            Ok(_) | Err(_) => {
                warn!(
                    "decimals() read failed for {}; assuming {}",
                    key, fallback
                );
                fallback
            }
        };
        self.decimals_cache.insert(key, decimals);
        decimals
    }
}

/// `slot0()` return shapes differ across the concentrated family. Try the
/// standard 7-word tuple, then a narrower 2-word variant, then a raw head
/// slice; the first variant that decodes a non-zero price wins.
pub fn decode_slot0_sqrt_price(raw: &Bytes) -> Result<U256, PulseError> {
    // (a) canonical 7-word tuple: (sqrtPriceX96, tick, observationIndex,
    //     observationCardinality, observationCardinalityNext, feeProtocol,
    //     unlocked)
    if raw.len() >= 224 {
        let sqrt = word_at(raw, 0)?;
        let _tick = sign_extended_i32(word_at(raw, 1)?);
        if !sqrt.is_zero() {
            return Ok(sqrt);
        }
    }
    // (b) narrower variants (Slipstream drops feeProtocol) still lead with
    //     (sqrtPriceX96, tick)
    if raw.len() >= 64 {
        let sqrt = word_at(raw, 0)?;
        let _tick = sign_extended_i32(word_at(raw, 1)?);
        if !sqrt.is_zero() {
            return Ok(sqrt);
        }
    }
    // (c) raw head slice: first word unsigned, shape unknown
    if raw.len() >= 32 {
        return word_at(raw, 0);
    }
    Err(PulseError::Decode(format!(
        "slot0 response too short: {} bytes",
        raw.len()
    )))
}

/// 32-byte word `index` of an ABI-encoded return payload.
pub fn word_at(raw: &[u8], index: usize) -> Result<U256, PulseError> {
    let start = index * 32;
    let end = start + 32;
    if raw.len() < end {
        return Err(PulseError::Decode(format!(
            "response too short: wanted word {}, have {} bytes",
            index,
            raw.len()
        )));
    }
    Ok(U256::from_big_endian(&raw[start..end]))
}

/// Address packed into the low 20 bytes of a return word.
pub fn address_from_word(raw: &Bytes) -> Result<Address, PulseError> {
    if raw.len() < 32 {
        return Err(PulseError::Decode("address word too short".to_string()));
    }
    let mut arr = [0u8; 20];
    arr.copy_from_slice(&raw[12..32]);
    Ok(Address::from(arr))
}

/// int24 (or narrower) carried sign-extended in a full word.
pub fn sign_extended_i32(word: U256) -> i32 {
    let signed = ethers::core::types::I256::from_raw(word);
    i128::try_from(signed).map(|v| v as i32).unwrap_or(0)
}

/// Lossy conversion for display and price math; exact integers stay in
/// U256 everywhere balances matter.
pub fn u256_to_f64(value: U256) -> f64 {
    f64::from_str(&value.to_string()).unwrap_or(0.0)
}

/// Convenience: parse a lowercase address map key back into an [Address].
pub fn key_to_address(key: &str) -> Result<Address, PulseError> {
    Address::from_str(&normalize_address(key))
        .map_err(|_| PulseError::Validation(format!("invalid address key: {}", key)))
}
