#[derive(thiserror::Error, Debug)]
pub enum PulseError {
    #[error("WebSocket / RPC error: {0}")]
    WsRpc(String),

    #[error("Pool load failed: {0}")]
    PoolLoadFailed(String),

    #[error("Token {token} is not a side of pool {pool}")]
    TokenNotInPool { token: String, pool: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
