//! Shared helpers for the deterministic test suite.

// Allow dead code warnings since different test files use different items from this module
#![allow(dead_code)]

use amm_pulse_rs::confirm::{ConfirmationEnvelope, ConfirmationSink};
use amm_pulse_rs::pools::{PoolKind, swap_topic};
use async_trait::async_trait;
use ethers::core::types::{Address, H256, I256, Log, U256};
use std::str::FromStr;
use std::sync::Mutex;

/// Route crate logs through the test harness when RUST_LOG is set.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const MON: &str = "0x1111111111111111111111111111111111111111";
pub const WBNB: &str = "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c";
pub const SOME_POOL: &str = "0x2222222222222222222222222222222222222222";
pub const SOME_USER: &str = "0x3333333333333333333333333333333333333333";

pub fn addr(s: &str) -> Address {
    Address::from_str(s).expect("test address")
}

pub fn word(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

fn topic_for_address(a: &str) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr(a).as_bytes());
    H256::from(bytes)
}

/// Build a V2 Swap log: indexed sender/to, amounts in the data payload.
pub fn v2_swap_log(
    pool: &str,
    amount0_in: U256,
    amount1_in: U256,
    amount0_out: U256,
    amount1_out: U256,
) -> Log {
    let mut data = Vec::with_capacity(128);
    for amount in [amount0_in, amount1_in, amount0_out, amount1_out] {
        data.extend_from_slice(&word(amount));
    }
    Log {
        address: addr(pool),
        topics: vec![
            swap_topic(PoolKind::V2),
            topic_for_address(SOME_USER),
            topic_for_address(SOME_USER),
        ],
        data: data.into(),
        transaction_hash: Some(H256::from_low_u64_be(0xabcd)),
        ..Default::default()
    }
}

/// Build a V3 Swap log with signed amounts.
pub fn v3_swap_log(pool: &str, amount0: I256, amount1: I256, sqrt_price_x96: U256) -> Log {
    let mut data = Vec::with_capacity(160);
    data.extend_from_slice(&word(amount0.into_raw()));
    data.extend_from_slice(&word(amount1.into_raw()));
    data.extend_from_slice(&word(sqrt_price_x96));
    data.extend_from_slice(&word(U256::from(1_000_000u64))); // liquidity
    data.extend_from_slice(&word(U256::zero())); // tick
    Log {
        address: addr(pool),
        topics: vec![
            swap_topic(PoolKind::V3),
            topic_for_address(SOME_USER),
            topic_for_address(SOME_USER),
        ],
        data: data.into(),
        transaction_hash: Some(H256::from_low_u64_be(0xabcd)),
        ..Default::default()
    }
}

/// Confirmation sink that records everything it is asked to emit.
#[derive(Default)]
pub struct RecordingSink {
    pub envelopes: Mutex<Vec<ConfirmationEnvelope>>,
}

impl RecordingSink {
    pub fn event_names(&self) -> Vec<&'static str> {
        self.envelopes
            .lock()
            .expect("sink lock")
            .iter()
            .map(|e| match e {
                ConfirmationEnvelope::Pending { .. } => "swap:pending",
                ConfirmationEnvelope::Confirmed { .. } => "swap:confirmed",
                ConfirmationEnvelope::Failed { .. } => "swap:failed",
                ConfirmationEnvelope::Replaced { .. } => "swap:replaced",
            })
            .collect()
    }
}

#[async_trait]
impl ConfirmationSink for RecordingSink {
    async fn emit(&self, envelope: ConfirmationEnvelope) {
        self.envelopes.lock().expect("sink lock").push(envelope);
    }
}
