//! Swap-log decoding and buy/sell classification.

mod common;

use amm_pulse_rs::pools::{PoolKind, SwapLog, classify_swap, decode_swap_log};
use common::{SOME_POOL, v2_swap_log, v3_swap_log};
use ethers::core::types::{I256, U256};

fn e18(units: u64) -> U256 {
    U256::from(units) * U256::exp10(18)
}

#[test]
fn v2_buy_monitored_token0() {
    // 10 MON leave the pool for 0.1 WBNB in.
    let log = v2_swap_log(
        SOME_POOL,
        U256::zero(),
        U256::exp10(17),
        e18(10),
        U256::zero(),
    );
    let swap = decode_swap_log(PoolKind::V2, &log).expect("decode");
    let info = classify_swap(&swap, true, 18, 18);

    assert!(info.is_buy);
    assert!((info.token_amount - 10.0).abs() < 1e-9);
    assert!((info.pair_amount - 0.1).abs() < 1e-12);
    assert_eq!(info.token_amount_display, "10.0000");
    assert_eq!(info.pair_amount_display, "0.1000");
    assert_eq!(info.event_kind, "v2-swap");
}

#[test]
fn v2_sell_monitored_token0() {
    // 5 MON enter the pool, 0.05 WBNB leave.
    let log = v2_swap_log(
        SOME_POOL,
        e18(5),
        U256::zero(),
        U256::zero(),
        U256::exp10(16) * 5,
    );
    let swap = decode_swap_log(PoolKind::V2, &log).expect("decode");
    let info = classify_swap(&swap, true, 18, 18);

    assert!(!info.is_buy);
    assert!((info.token_amount - 5.0).abs() < 1e-9);
    assert!((info.pair_amount - 0.05).abs() < 1e-12);
}

#[test]
fn v2_sides_swap_when_monitored_is_token1() {
    let log = v2_swap_log(
        SOME_POOL,
        U256::zero(),
        U256::zero(),
        U256::zero(),
        e18(3),
    );
    let swap = decode_swap_log(PoolKind::V2, &log).expect("decode");

    // token1 left the pool: buy from token1's point of view.
    let as_token1 = classify_swap(&swap, false, 18, 18);
    assert!(as_token1.is_buy);
    assert!((as_token1.token_amount - 3.0).abs() < 1e-9);

    // token0's point of view: nothing of token0 moved out, so a sell.
    let as_token0 = classify_swap(&swap, true, 18, 18);
    assert!(!as_token0.is_buy);
}

#[test]
fn v2_round_trip_reconstructs_amounts() {
    let cases = [
        // (a0in, a1in, a0out, a1out, monitored_is_token0, want_buy)
        (0u64, 7, 42, 0, true, true),
        (42, 0, 0, 7, true, false),
        (7, 0, 0, 42, false, true),
        (0, 42, 7, 0, false, false),
    ];
    for (a0in, a1in, a0out, a1out, is_token0, want_buy) in cases {
        let log = v2_swap_log(
            SOME_POOL,
            e18(a0in),
            e18(a1in),
            e18(a0out),
            e18(a1out),
        );
        let swap = decode_swap_log(PoolKind::V2, &log).expect("decode");
        let info = classify_swap(&swap, is_token0, 18, 18);
        assert_eq!(info.is_buy, want_buy, "case {:?}", (a0in, a1in, a0out, a1out));

        let (want_token, want_pair) = if want_buy {
            if is_token0 { (a0out, a1in) } else { (a1out, a0in) }
        } else if is_token0 {
            (a0in, a1out)
        } else {
            (a1in, a0out)
        };
        assert!((info.token_amount - want_token as f64).abs() < 1e-9);
        assert!((info.pair_amount - want_pair as f64).abs() < 1e-9);
    }
}

#[test]
fn v3_sign_rule_monitored_token1() {
    // amount0 = +1_000_000 (6 decimals in), amount1 = -1e18 (18 decimals out).
    let log = v3_swap_log(
        SOME_POOL,
        I256::from(1_000_000i64),
        I256::from(-1_000_000_000_000_000_000i64),
        U256::one() << 96,
    );
    let swap = decode_swap_log(PoolKind::V3, &log).expect("decode");

    // Monitored side (token1) is negative: the trader received it. Buy.
    let info = classify_swap(&swap, false, 18, 6);
    assert!(info.is_buy);
    assert!((info.token_amount - 1.0).abs() < 1e-9);
    assert!((info.pair_amount - 1.0).abs() < 1e-9);
    assert_eq!(info.event_kind, "v3-swap");
}

#[test]
fn v3_sign_rule_is_symmetric() {
    for (amount0, amount1, is_token0, want_buy) in [
        (-5i64, 3i64, true, true),
        (5, -3, true, false),
        (-5, 3, false, false),
        (5, -3, false, true),
    ] {
        let log = v3_swap_log(
            SOME_POOL,
            I256::from(amount0),
            I256::from(amount1),
            U256::one() << 96,
        );
        let swap = decode_swap_log(PoolKind::V3, &log).expect("decode");
        let info = classify_swap(&swap, is_token0, 0, 0);
        assert_eq!(info.is_buy, want_buy, "case {:?}", (amount0, amount1, is_token0));
    }
}

#[test]
fn v3_decode_reads_price_state() {
    let sqrt = U256::one() << 96;
    let log = v3_swap_log(SOME_POOL, I256::from(1), I256::from(-1), sqrt);
    let swap = decode_swap_log(PoolKind::V3, &log).expect("decode");
    match swap {
        SwapLog::V3 {
            sqrt_price_x96,
            liquidity,
            ..
        } => {
            assert_eq!(sqrt_price_x96, sqrt);
            assert_eq!(liquidity, 1_000_000);
        }
        SwapLog::V2 { .. } => panic!("expected a V3 decode"),
    }
}

#[test]
fn truncated_payload_is_a_decode_error() {
    let mut log = v2_swap_log(SOME_POOL, e18(1), U256::zero(), U256::zero(), e18(1));
    log.data = log.data[..64].to_vec().into();
    assert!(decode_swap_log(PoolKind::V2, &log).is_err());
}

#[test]
fn aero_v2_decodes_like_v2() {
    let mut log = v2_swap_log(SOME_POOL, U256::zero(), e18(1), e18(2), U256::zero());
    log.topics[0] = amm_pulse_rs::pools::swap_topic(PoolKind::AeroV2);
    let swap = decode_swap_log(PoolKind::AeroV2, &log).expect("decode");
    let info = classify_swap(&swap, true, 18, 18);
    assert!(info.is_buy);
    assert!((info.token_amount - 2.0).abs() < 1e-9);
}
