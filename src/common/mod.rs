pub mod config;
pub mod errors;
pub mod metrics;
pub mod utils;

// Re-export
pub use config::{ServiceConfig, Tunables, chain, load_dotenv};
pub use errors::PulseError;
pub use metrics::{ErrorEntry, MetricsSnapshot, PulseMetrics};
pub use utils::{
    address_to_lower, format_token_amount, get_timestamp_millis, iso_timestamp,
    looks_like_tx_hash, normalize_address, parse_address,
};
