//! Agent-token recursion guards.

use amm_pulse_rs::chain::ChainClient;
use amm_pulse_rs::common::PulseMetrics;
use amm_pulse_rs::pools::{PoolKind, PoolLoader};
use amm_pulse_rs::price::{AgentSource, AgentTokenEntry, PriceEngine};
use std::sync::Arc;
use std::time::Duration;

const AGENT_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const AGENT_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const POOL_AB: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

fn offline_engine() -> (Arc<PriceEngine>, Arc<PulseMetrics>) {
    let metrics = Arc::new(PulseMetrics::new());
    let loader = Arc::new(PoolLoader::new(ChainClient::offline(
        Duration::from_millis(50),
    )));
    let engine = Arc::new(PriceEngine::new(
        loader,
        Vec::new(),
        Duration::from_secs(60),
        Duration::from_secs(10),
        metrics.clone(),
    ));
    (engine, metrics)
}

fn entry_with_pool(symbol: &str) -> AgentTokenEntry {
    AgentTokenEntry {
        symbol: symbol.to_string(),
        sources: vec![AgentSource {
            pool: POOL_AB.to_string(),
            kind: PoolKind::V2,
            priority: 1,
        }],
    }
}

#[tokio::test]
async fn re_entry_through_the_call_stack_contributes_zero() {
    let (engine, metrics) = offline_engine();
    engine.register_agent(AGENT_A, entry_with_pool("AGA"));

    // The address is already on the stack: the cycled branch is zero and
    // exactly one warning lands in the error ring.
    let price = engine
        .agent_price_usd(AGENT_A, vec![AGENT_A.to_string()])
        .await;
    assert_eq!(price, 0.0);
    assert_eq!(metrics.recent_error_count(), 1);
}

#[tokio::test]
async fn deep_stack_detection_does_not_need_registration_order() {
    let (engine, metrics) = offline_engine();
    engine.register_agent(AGENT_A, entry_with_pool("AGA"));
    engine.register_agent(AGENT_B, entry_with_pool("AGB"));

    // Simulates the A → B → A chain at its deepest frame.
    let price = engine
        .agent_price_usd(AGENT_A, vec![AGENT_A.to_string(), AGENT_B.to_string()])
        .await;
    assert_eq!(price, 0.0);
    assert_eq!(metrics.recent_error_count(), 1);
}

#[tokio::test]
async fn unregistered_agents_resolve_to_zero() {
    let (engine, metrics) = offline_engine();
    let price = engine.agent_price_usd(AGENT_B, Vec::new()).await;
    assert_eq!(price, 0.0);
    // Not a cycle: nothing in the error ring.
    assert_eq!(metrics.recent_error_count(), 0);
}

#[tokio::test]
async fn source_failures_terminate_without_recursion_blowup() {
    let (engine, _metrics) = offline_engine();
    engine.register_agent(AGENT_A, entry_with_pool("AGA"));

    // Every source load fails against the offline client; the resolution
    // still terminates with a zero price instead of hanging or panicking.
    let price = engine.agent_price_usd(AGENT_A, Vec::new()).await;
    assert_eq!(price, 0.0);
}

#[tokio::test]
async fn agent_registration_round_trips() {
    let (engine, _metrics) = offline_engine();
    assert!(!engine.is_agent(AGENT_A));
    engine.register_agent(AGENT_A, entry_with_pool("AGA"));
    assert!(engine.is_agent(AGENT_A));
    // Case-insensitive through normalization.
    assert!(engine.is_agent(&AGENT_A.to_uppercase()));
    assert!(engine.remove_agent(AGENT_A));
    assert!(!engine.is_agent(AGENT_A));
}
