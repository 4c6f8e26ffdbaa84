//! Wire-format shapes for the client protocol and downstream envelopes.

use amm_pulse_rs::confirm::ConfirmationEnvelope;
use amm_pulse_rs::fanout::{
    ClientMessage, Features, FormattedPrice, PriceUpdatePayload, ServerMessage, SwapEventPayload,
    room_for_token,
};
use amm_pulse_rs::price::{PriceSample, TokenPrice};
use serde_json::json;

fn sample_price() -> TokenPrice {
    TokenPrice {
        token_address: "0x1111111111111111111111111111111111111111".to_string(),
        symbol: "MON".to_string(),
        name: "Monitored".to_string(),
        price_usd: 6.0,
        price_bnb: 0.01,
        pool_count: 1,
        pools: vec![PriceSample {
            price_usd: 6.0,
            price_bnb: 0.01,
            pool_address: "0x2222222222222222222222222222222222222222".to_string(),
            description: "uniswapv2 MON/WBNB".to_string(),
            pair: "WBNB".to_string(),
            priority: 1,
        }],
        timestamp: "2025-01-01T00:00:00.000Z".to_string(),
    }
}

#[test]
fn client_messages_parse() {
    let subscribe: ClientMessage = serde_json::from_str(
        r#"{"event":"subscribe","tokenAddress":"0xAbC0000000000000000000000000000000000001"}"#,
    )
    .expect("subscribe parses");
    assert!(matches!(subscribe, ClientMessage::Subscribe { .. }));

    let ping: ClientMessage = serde_json::from_str(r#"{"event":"ping"}"#).expect("ping parses");
    assert!(matches!(ping, ClientMessage::Ping));

    let all: ClientMessage =
        serde_json::from_str(r#"{"event":"get-all-prices"}"#).expect("get-all-prices parses");
    assert!(matches!(all, ClientMessage::GetAllPrices));

    assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"shout"}"#).is_err());
}

#[test]
fn welcome_advertises_camel_case_features() {
    let value = serde_json::to_value(ServerMessage::Welcome {
        message: "hi".to_string(),
        socket_id: "7".to_string(),
        service: "amm-pulse".to_string(),
        features: Features::default(),
    })
    .expect("serialize");

    assert_eq!(value["event"], "welcome");
    let features = &value["features"];
    for key in [
        "v2Support",
        "v3Support",
        "pancakeswapSupport",
        "multiPoolSupport",
        "dynamicBnbPrice",
        "caching",
        "metricsTracking",
        "buySellDetection",
    ] {
        assert_eq!(features[key], true, "missing feature flag {}", key);
    }
}

#[test]
fn price_update_flattens_token_price() {
    let value = serde_json::to_value(ServerMessage::PriceUpdate(PriceUpdatePayload {
        price: sample_price(),
        formatted: FormattedPrice {
            price_usd: "$6.0000".to_string(),
            price_bnb: "0.0100 BNB".to_string(),
        },
    }))
    .expect("serialize");

    assert_eq!(value["event"], "price-update");
    assert_eq!(
        value["tokenAddress"],
        "0x1111111111111111111111111111111111111111"
    );
    assert_eq!(value["priceUSD"], 6.0);
    assert_eq!(value["priceBNB"], 0.01);
    assert_eq!(value["poolCount"], 1);
    assert_eq!(value["pools"][0]["pair"], "WBNB");
    assert_eq!(value["formatted"]["priceUSD"], "$6.0000");
}

#[test]
fn swap_event_keeps_its_own_type_field() {
    let value = serde_json::to_value(ServerMessage::SwapEvent(SwapEventPayload {
        token_address: "0x1111111111111111111111111111111111111111".to_string(),
        symbol: "MON".to_string(),
        pool_address: "0x2222222222222222222222222222222222222222".to_string(),
        tx_hash: "0xdead".to_string(),
        kind: "buy".to_string(),
        sender: String::new(),
        amount_bnb: 0.1,
        amount_token: 10.0,
        pair_symbol: "WBNB".to_string(),
        pair_amount: 0.1,
        price_usd: 6.0,
        value_usd: 60.0,
        timestamp: "2025-01-01T00:00:00.000Z".to_string(),
    }))
    .expect("serialize");

    assert_eq!(value["event"], "swap-event");
    assert_eq!(value["type"], "buy");
    assert_eq!(value["amountBNB"], 0.1);
    assert_eq!(value["amountToken"], 10.0);
    assert_eq!(value["valueUSD"], 60.0);
    assert_eq!(value["sender"], "");
}

#[test]
fn heartbeat_and_pong_shapes() {
    let value = serde_json::to_value(ServerMessage::Pong { time: 1700000000 }).expect("serialize");
    assert_eq!(value, json!({"event": "pong", "time": 1700000000u64}));

    let value = serde_json::to_value(ServerMessage::SwapUpdate {
        tx_hash: "0xdead".to_string(),
        sender: "0x3333333333333333333333333333333333333333".to_string(),
    })
    .expect("serialize");
    assert_eq!(value["event"], "swap-update");
    assert_eq!(value["txHash"], "0xdead");
}

#[test]
fn room_names_are_lowercase() {
    assert_eq!(
        room_for_token("0xAbC0000000000000000000000000000000000001"),
        "token:0xabc0000000000000000000000000000000000001"
    );
}

#[test]
fn confirmation_envelopes_use_swap_event_keys() {
    let value = serde_json::to_value(ConfirmationEnvelope::Pending {
        tx_hash: "0x01".to_string(),
        token_address: "0x02".to_string(),
        pool_address: "0x03".to_string(),
        user_address: "0x04".to_string(),
        operation: "buy".to_string(),
        status: "pending".to_string(),
        protocol: "uniswapv2".to_string(),
        timestamp: "t".to_string(),
        detection_time: "t".to_string(),
    })
    .expect("serialize");
    assert_eq!(value["event"], "swap:pending");
    assert_eq!(value["detectionTime"], "t");

    let value = serde_json::to_value(ConfirmationEnvelope::Confirmed {
        tx_hash: "0x01".to_string(),
        block_number: 12,
        gas_used: 21000,
        token_address: "0x02".to_string(),
        pool_address: "0x03".to_string(),
        user_address: "0x04".to_string(),
        operation: "sell".to_string(),
        status: "confirmed".to_string(),
        protocol: "uniswapv3".to_string(),
        timestamp: "t".to_string(),
    })
    .expect("serialize");
    assert_eq!(value["event"], "swap:confirmed");
    assert_eq!(value["blockNumber"], 12);
    assert_eq!(value["gasUsed"], 21000);

    let value = serde_json::to_value(ConfirmationEnvelope::Replaced {
        old_tx_hash: "0x01".to_string(),
        new_tx_hash: "0x05".to_string(),
        status: "replaced".to_string(),
        timestamp: "t".to_string(),
    })
    .expect("serialize");
    assert_eq!(value["event"], "swap:replaced");
    assert_eq!(value["oldTxHash"], "0x01");
    assert_eq!(value["newTxHash"], "0x05");
}
