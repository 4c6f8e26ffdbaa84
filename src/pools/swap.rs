//! Swap-log decoding and buy/sell classification.

use crate::common::{PulseError, format_token_amount};
use crate::pools::{PoolKind, u256_to_f64, word_at};
use ethers::core::types::{Address, H256, I256, Log, U256};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Uniswap V2 Swap(address,uint256,uint256,uint256,uint256,address)
const TOPIC_V2_SWAP: &str = "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822";
/// Uniswap V3 Swap(address,address,int256,int256,uint160,uint128,int24)
const TOPIC_V3_SWAP: &str = "0xc42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67";

/// Aerodrome pairs log a Solidly-shaped Swap; derive the topic from the
/// signature rather than pasting a hash.
static TOPIC_AERO_V2_SWAP: Lazy<H256> = Lazy::new(|| {
    H256::from(ethers::utils::keccak256(
        "Swap(address,address,uint256,uint256,uint256,uint256)",
    ))
});

static TOPIC_V2: Lazy<H256> =
    Lazy::new(|| H256::from_str(TOPIC_V2_SWAP).expect("static topic hash"));
static TOPIC_V3: Lazy<H256> =
    Lazy::new(|| H256::from_str(TOPIC_V3_SWAP).expect("static topic hash"));

/// topic0 of the Swap event for a pool variant. Slipstream emits the
/// Uniswap V3 shape unchanged.
pub fn swap_topic(kind: PoolKind) -> H256 {
    match kind {
        PoolKind::V2 => *TOPIC_V2,
        PoolKind::V3 | PoolKind::Slipstream => *TOPIC_V3,
        PoolKind::AeroV2 => *TOPIC_AERO_V2_SWAP,
    }
}

/// Decoded swap payload, one variant per event family.
#[derive(Debug, Clone, Copy)]
pub enum SwapLog {
    V2 {
        sender: Address,
        to: Address,
        amount0_in: U256,
        amount1_in: U256,
        amount0_out: U256,
        amount1_out: U256,
    },
    V3 {
        sender: Address,
        recipient: Address,
        amount0: I256,
        amount1: I256,
        sqrt_price_x96: U256,
        liquidity: u128,
        tick: i32,
    },
}

fn topic_address(log: &Log, index: usize) -> Result<Address, PulseError> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| PulseError::Decode(format!("missing topic {}", index)))?;
    Ok(Address::from_slice(&topic.as_bytes()[12..]))
}

/// Decode a raw swap log for the given pool variant.
pub fn decode_swap_log(kind: PoolKind, log: &Log) -> Result<SwapLog, PulseError> {
    match kind {
        PoolKind::V2 | PoolKind::AeroV2 => {
            let sender = topic_address(log, 1)?;
            let to = topic_address(log, 2)?;
            Ok(SwapLog::V2 {
                sender,
                to,
                amount0_in: word_at(&log.data, 0)?,
                amount1_in: word_at(&log.data, 1)?,
                amount0_out: word_at(&log.data, 2)?,
                amount1_out: word_at(&log.data, 3)?,
            })
        }
        PoolKind::V3 | PoolKind::Slipstream => {
            let sender = topic_address(log, 1)?;
            let recipient = topic_address(log, 2)?;
            Ok(SwapLog::V3 {
                sender,
                recipient,
                amount0: I256::from_raw(word_at(&log.data, 0)?),
                amount1: I256::from_raw(word_at(&log.data, 1)?),
                sqrt_price_x96: word_at(&log.data, 2)?,
                liquidity: word_at(&log.data, 3)?.low_u128(),
                tick: crate::pools::sign_extended_i32(word_at(&log.data, 4)?),
            })
        }
    }
}

/// Classified swap from the monitored token's point of view. `is_buy`
/// means the outside party received the monitored token from the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapInfo {
    pub is_buy: bool,
    /// Monitored-token amount in human units.
    pub token_amount: f64,
    /// Pair-token amount in human units.
    pub pair_amount: f64,
    pub token_amount_display: String,
    pub pair_amount_display: String,
    pub event_kind: String,
}

fn i256_abs_f64(value: I256) -> f64 {
    u256_to_f64(value.unsigned_abs())
}

fn to_human(raw: f64, decimals: u8) -> f64 {
    raw / 10f64.powi(decimals as i32)
}

/// Classify a decoded swap given which side the monitored token occupies.
pub fn classify_swap(
    swap: &SwapLog,
    is_token0: bool,
    token_decimals: u8,
    pair_decimals: u8,
) -> SwapInfo {
    let (is_buy, token_raw, pair_raw, event_kind) = match *swap {
        SwapLog::V2 {
            amount0_in,
            amount1_in,
            amount0_out,
            amount1_out,
            ..
        } => {
            let (token_out, token_in, pair_in, pair_out) = if is_token0 {
                (amount0_out, amount0_in, amount1_in, amount1_out)
            } else {
                (amount1_out, amount1_in, amount0_in, amount0_out)
            };
            if !token_out.is_zero() {
                // Monitored token left the pool toward the trader.
                (true, u256_to_f64(token_out), u256_to_f64(pair_in), "v2-swap")
            } else {
                (false, u256_to_f64(token_in), u256_to_f64(pair_out), "v2-swap")
            }
        }
        SwapLog::V3 {
            amount0, amount1, ..
        } => {
            let (token_amount, pair_amount) = if is_token0 {
                (amount0, amount1)
            } else {
                (amount1, amount0)
            };
            // Negative means the amount left the pool.
            (
                token_amount.is_negative(),
                i256_abs_f64(token_amount),
                i256_abs_f64(pair_amount),
                "v3-swap",
            )
        }
    };

    let token_amount = to_human(token_raw, token_decimals);
    let pair_amount = to_human(pair_raw, pair_decimals);

    SwapInfo {
        is_buy,
        token_amount,
        pair_amount,
        token_amount_display: format_token_amount(token_amount),
        pair_amount_display: format_token_amount(pair_amount),
        event_kind: event_kind.to_string(),
    }
}
