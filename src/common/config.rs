//! Environment-driven service configuration plus fixed chain parameters.
//!
//! Chain parameters (stable/wrapped-native addresses, known decimals, the
//! BNB/USD reference pool set) are fixed per deployment; everything tunable
//! comes from the environment with conservative defaults.

use crate::common::{PulseError, normalize_address};
use std::time::Duration;

/// Loads `.env` from the current or project directory. Call before reading env vars (e.g. in tests).
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// WebSocket RPC URL of the node (e.g. `wss://bsc-ws-node.nariox.org`).
    pub node_wss_url: String,
    /// TCP port the fan-out socket listens on.
    pub listen_port: u16,
    /// Downstream confirmation consumer URL; `None` disables the emitter.
    pub consumer_url: Option<String>,
    /// Path appended to the consumer URL.
    pub consumer_path: String,
    /// Whether error payloads carry stack context (off in production).
    pub expose_error_detail: bool,
    pub tunables: Tunables,
}

/// Timing and threshold knobs. Defaults match the deployed service.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Minimum relative price move that triggers a broadcast (0.001 = 0.1%).
    pub price_update_threshold: f64,
    /// BNB/USD reference refresh period.
    pub update_bnb_price_interval: Duration,
    /// Agent-token price cache TTL.
    pub agent_price_cache_ttl: Duration,
    /// Window inside which repeated price-recompute triggers are dropped.
    pub update_coalesce_window: Duration,
    pub heartbeat_interval: Duration,
    /// A session with no ping for this long is reaped.
    pub stale_session_cutoff: Duration,
    pub reaper_interval: Duration,
    /// A pending swap with no receipt for this long is terminal.
    pub pending_swap_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Poll spacing while waiting for a transaction receipt.
    pub receipt_poll_interval: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            price_update_threshold: 0.001,
            update_bnb_price_interval: Duration::from_secs(60),
            agent_price_cache_ttl: Duration::from_secs(10),
            update_coalesce_window: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            stale_session_cutoff: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
            pending_swap_timeout: Duration::from_secs(300),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            receipt_poll_interval: Duration::from_secs(3),
        }
    }
}

impl ServiceConfig {
    /// Read configuration from the environment. `NODE_WSS_URL` is required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self, PulseError> {
        let node_wss_url = std::env::var("NODE_WSS_URL")
            .map_err(|_| PulseError::Config("NODE_WSS_URL is required".to_string()))?;
        if node_wss_url.is_empty() {
            return Err(PulseError::Config("NODE_WSS_URL is empty".to_string()));
        }

        let listen_port = match std::env::var("LISTEN_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| PulseError::Config(format!("invalid LISTEN_PORT: {}", v)))?,
            Err(_) => 8081,
        };

        let consumer_url = std::env::var("CONFIRMATION_CONSUMER_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let consumer_path =
            std::env::var("CONFIRMATION_CONSUMER_PATH").unwrap_or_else(|_| "/swaps".to_string());

        let expose_error_detail =
            std::env::var("NODE_ENV").map(|v| v != "production").unwrap_or(true);

        Ok(Self {
            node_wss_url,
            listen_port,
            consumer_url,
            consumer_path,
            expose_error_detail,
            tunables: Tunables::default(),
        })
    }
}

/// Fixed chain parameters for the deployment target (BNB Smart Chain).
pub mod chain {
    use super::normalize_address;

    pub const WBNB: &str = "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c";
    pub const USDT: &str = "0x55d398326f99059fF775485246999027B3197955";
    pub const USDC: &str = "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d";
    pub const BUSD: &str = "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56";
    pub const DAI: &str = "0x1AF3F329e8BE154074D8769D1FFa4eE058B1DBc3";

    /// Cold-start BNB/USD value, used only until the first reference read.
    pub const DEFAULT_BNB_USD: f64 = 600.0;

    /// PancakeSwap V3 WBNB/USDT, the default BNB/USD reference source.
    pub const BNB_USDT_V3_POOL: &str = "0x36696169C63e42cd08ce11f5deeBbCeBae652050";

    /// Stables whose USD price is taken as 1.0.
    pub fn stable_symbol(addr: &str) -> Option<&'static str> {
        let lower = normalize_address(addr);
        for (candidate, symbol) in [(USDT, "USDT"), (USDC, "USDC"), (BUSD, "BUSD"), (DAI, "DAI")] {
            if lower == normalize_address(candidate) {
                return Some(symbol);
            }
        }
        None
    }

    pub fn is_stable(addr: &str) -> bool {
        stable_symbol(addr).is_some()
    }

    pub fn is_wbnb(addr: &str) -> bool {
        normalize_address(addr) == normalize_address(WBNB)
    }

    /// Decimals for addresses that never change; saves two RPCs per load.
    pub fn known_decimals(addr: &str) -> Option<u8> {
        let lower = normalize_address(addr);
        for candidate in [WBNB, USDT, USDC, BUSD, DAI] {
            if lower == normalize_address(candidate) {
                return Some(18);
            }
        }
        None
    }

    pub fn default_bnb_reference_pools() -> Vec<String> {
        vec![normalize_address(BNB_USDT_V3_POOL)]
    }
}
