//! Registry validation and lifecycle without a live node.

mod common;

use amm_pulse_rs::chain::ChainClient;
use amm_pulse_rs::common::{PulseError, PulseMetrics};
use amm_pulse_rs::fanout::FanoutServer;
use amm_pulse_rs::pools::PoolLoader;
use amm_pulse_rs::price::{PairKind, PriceCache, PriceEngine};
use amm_pulse_rs::registry::{
    DynamicTokenSpec, ListenerRegistry, PoolEntryConfig, TokenConfig, pair_kind_from_tag,
};
use common::{MON, SOME_POOL, WBNB};
use std::sync::Arc;
use std::time::Duration;

fn offline_registry() -> Arc<ListenerRegistry> {
    let chain = ChainClient::offline(Duration::from_millis(50));
    let metrics = Arc::new(PulseMetrics::new());
    let loader = Arc::new(PoolLoader::new(chain.clone()));
    let engine = Arc::new(PriceEngine::new(
        loader,
        Vec::new(),
        Duration::from_secs(60),
        Duration::from_secs(10),
        metrics.clone(),
    ));
    let cache = Arc::new(PriceCache::new());
    let (room_tx, _room_rx) = tokio::sync::mpsc::channel(16);
    let fanout = FanoutServer::new(
        cache.clone(),
        metrics.clone(),
        room_tx,
        Duration::from_secs(30),
        Duration::from_secs(60),
        Duration::from_secs(30),
    );
    Arc::new(ListenerRegistry::new(
        chain,
        engine,
        cache,
        fanout.broadcaster(),
        metrics,
        0.001,
        Duration::from_millis(100),
    ))
}

fn pool_entry(protocol: &str, pair: &str) -> PoolEntryConfig {
    PoolEntryConfig {
        pool_address: SOME_POOL.to_string(),
        protocol: protocol.to_string(),
        pair: pair.to_string(),
        priority: 1,
        fee: None,
        description: None,
    }
}

fn dynamic_spec(protocol: &str, pair: &str) -> DynamicTokenSpec {
    DynamicTokenSpec {
        token_address: MON.to_string(),
        symbol: Some("MON".to_string()),
        name: Some("Monitored".to_string()),
        decimals: Some(18),
        pools: vec![pool_entry(protocol, pair)],
    }
}

#[tokio::test]
async fn add_token_without_config_is_rejected() {
    let registry = offline_registry();
    let err = registry.add_token(MON).await.unwrap_err();
    assert!(matches!(err, PulseError::Validation(_)));
    assert!(!registry.is_monitored(MON));
}

#[tokio::test]
async fn dynamic_add_rejects_unknown_protocol() {
    let registry = offline_registry();
    let err = registry
        .add_dynamic_token(dynamic_spec("sushiswap", "WBNB"))
        .await
        .unwrap_err();
    assert!(matches!(err, PulseError::Validation(_)));
}

#[tokio::test]
async fn dynamic_add_rejects_unknown_pair_tag() {
    let registry = offline_registry();
    let err = registry
        .add_dynamic_token(dynamic_spec("uniswapv2", "DOGE"))
        .await
        .unwrap_err();
    assert!(matches!(err, PulseError::Validation(_)));
}

#[tokio::test]
async fn dynamic_add_rejects_empty_pool_list() {
    let registry = offline_registry();
    let mut spec = dynamic_spec("uniswapv2", "WBNB");
    spec.pools.clear();
    assert!(registry.add_dynamic_token(spec).await.is_err());
}

#[tokio::test]
async fn dynamic_add_rejects_bad_addresses() {
    let registry = offline_registry();
    let mut spec = dynamic_spec("uniswapv2", "WBNB");
    spec.token_address = "0x1234".to_string();
    assert!(registry.add_dynamic_token(spec).await.is_err());

    let mut spec = dynamic_spec("uniswapv2", "WBNB");
    spec.pools[0].pool_address = "nope".to_string();
    assert!(registry.add_dynamic_token(spec).await.is_err());
}

#[tokio::test]
async fn pair_tag_accepts_agent_addresses() {
    let registry = offline_registry();
    // A pair given as an address is an agent-token pair; validation passes
    // and the add then starves on pool loads (node is offline).
    let added = registry
        .add_dynamic_token(dynamic_spec("uniswapv3", WBNB))
        .await
        .expect("validation passes");
    assert!(added.is_none());
    assert!(!registry.is_monitored(MON));
}

#[tokio::test]
async fn starved_add_leaves_no_state_behind() {
    let registry = offline_registry();
    let added = registry
        .add_dynamic_token(dynamic_spec("uniswapv2", "WBNB"))
        .await
        .expect("payload is valid");
    assert!(added.is_none());
    assert!(!registry.is_monitored(MON));
    assert_eq!(registry.active_listener_count().await, 0);
    assert_eq!(registry.monitored_tokens().len(), 0);
}

#[tokio::test]
async fn remove_of_unknown_token_is_a_noop() {
    let registry = offline_registry();
    let (existed, pools) = registry.remove_token(MON).await;
    assert!(!existed);
    assert!(pools.is_empty());
}

#[tokio::test]
async fn static_config_registration_round_trips() {
    let registry = offline_registry();
    assert!(!registry.has_config(MON));
    registry.register_token_config(
        MON,
        TokenConfig {
            symbol: "MON".to_string(),
            name: "Monitored".to_string(),
            fallback_decimals: 18,
            pools: vec![pool_entry("uniswapv2", "WBNB")],
        },
    );
    // Lookup is case-insensitive through normalization.
    assert!(registry.has_config(&MON.to_uppercase()));
}

#[test]
fn pair_tags_map_to_conversion_kinds() {
    assert_eq!(pair_kind_from_tag("WBNB"), Some(PairKind::Wbnb));
    assert_eq!(pair_kind_from_tag("bnb"), Some(PairKind::Wbnb));
    assert_eq!(
        pair_kind_from_tag("usdt"),
        Some(PairKind::Stable("USDT".to_string()))
    );
    assert_eq!(pair_kind_from_tag("DOGE"), None);
    assert!(matches!(
        pair_kind_from_tag("0x4444444444444444444444444444444444444444"),
        Some(PairKind::Agent(_))
    ));
}

#[test]
fn pair_address_classification() {
    assert_eq!(PairKind::from_pair_address(WBNB), PairKind::Wbnb);
    assert_eq!(
        PairKind::from_pair_address("0x55d398326f99059fF775485246999027B3197955"),
        PairKind::Stable("USDT".to_string())
    );
    match PairKind::from_pair_address("0x4444444444444444444444444444444444444444") {
        PairKind::Agent(addr) => {
            assert_eq!(addr, "0x4444444444444444444444444444444444444444")
        }
        other => panic!("expected agent pair, got {:?}", other),
    }
}
