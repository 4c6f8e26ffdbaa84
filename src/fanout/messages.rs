//! Wire envelopes for the client pub/sub socket.

use crate::common::normalize_address;
use crate::price::TokenPrice;
use serde::{Deserialize, Serialize};

/// Room key for a token's fan-out group.
pub fn room_for_token(token_address: &str) -> String {
    format!("token:{}", normalize_address(token_address))
}

/// Messages a client may send. The `event` key names the message; payload
/// fields sit alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "tokenAddress")]
        token_address: String,
    },
    Unsubscribe {
        #[serde(rename = "tokenAddress")]
        token_address: String,
    },
    Ping,
    GetAllPrices,
}

/// Feature flags advertised on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub v2_support: bool,
    pub v3_support: bool,
    pub pancakeswap_support: bool,
    pub multi_pool_support: bool,
    pub dynamic_bnb_price: bool,
    pub caching: bool,
    pub metrics_tracking: bool,
    pub buy_sell_detection: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            v2_support: true,
            v3_support: true,
            pancakeswap_support: true,
            multi_pool_support: true,
            dynamic_bnb_price: true,
            caching: true,
            metrics_tracking: true,
            buy_sell_detection: true,
        }
    }
}

/// Display strings attached to a price update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedPrice {
    #[serde(rename = "priceUSD")]
    pub price_usd: String,
    #[serde(rename = "priceBNB")]
    pub price_bnb: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdatePayload {
    #[serde(flatten)]
    pub price: TokenPrice,
    pub formatted: FormattedPrice,
}

/// Swap broadcast, emitted synchronously on log arrival. `sender` is empty
/// until the follow-up `swap-update` resolves the real `from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEventPayload {
    pub token_address: String,
    pub symbol: String,
    pub pool_address: String,
    pub tx_hash: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    #[serde(rename = "amountBNB")]
    pub amount_bnb: f64,
    pub amount_token: f64,
    pub pair_symbol: String,
    pub pair_amount: f64,
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "valueUSD")]
    pub value_usd: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    pub price_updates: u64,
    pub cache_hits: u64,
    pub events_received: u64,
}

/// Messages the server pushes. Tagged by `event` so the swap payload's own
/// `type` field (buy/sell) stays untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        #[serde(rename = "socketId")]
        socket_id: String,
        service: String,
        features: Features,
    },
    Subscribed {
        #[serde(rename = "tokenAddress")]
        token_address: String,
        #[serde(rename = "currentPrice")]
        current_price: Option<TokenPrice>,
        room: String,
    },
    Unsubscribed {
        #[serde(rename = "tokenAddress")]
        token_address: String,
    },
    PriceUpdate(PriceUpdatePayload),
    SwapEvent(SwapEventPayload),
    SwapUpdate {
        #[serde(rename = "txHash")]
        tx_hash: String,
        sender: String,
    },
    AllPrices {
        prices: Vec<TokenPrice>,
    },
    Heartbeat {
        timestamp: String,
        #[serde(rename = "monitoredTokens")]
        monitored_tokens: usize,
        uptime: u64,
        metrics: HeartbeatMetrics,
    },
    Pong {
        time: u64,
    },
    Error {
        message: String,
    },
}
