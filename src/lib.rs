// src/lib.rs
pub mod chain;
pub mod common;
pub mod confirm;
pub mod fanout;
pub mod mempool;
pub mod pools;
pub mod price;
pub mod registry;
pub mod service;
pub mod swaps;

// Re-export common types
pub use common::{MetricsSnapshot, PulseError, PulseMetrics, ServiceConfig, Tunables, load_dotenv};
pub use pools::{Pool, PoolKind, SwapInfo, SwapLog, classify_swap, decode_swap_log};
pub use price::{PairKind, PriceSample, TokenPrice, filter_outliers, weighted_average};
pub use registry::{AddResult, DynamicTokenSpec, PoolEntryConfig, TokenConfig};
pub use service::PulseService;
pub use swaps::{SwapListenerInfo, SwapListenerSpec};
