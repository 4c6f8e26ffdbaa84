//! Outbound client for the downstream confirmation consumer.
//!
//! Emission is best-effort: envelopes queued while the consumer link is
//! down are dropped and counted, never buffered indefinitely.

use async_trait::async_trait;
use futures::SinkExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Spacing between connection attempts to the consumer.
const RECONNECT_SPACING: Duration = Duration::from_secs(5);

/// Swap lifecycle envelopes, named by their downstream event keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ConfirmationEnvelope {
    #[serde(rename = "swap:pending", rename_all = "camelCase")]
    Pending {
        tx_hash: String,
        token_address: String,
        pool_address: String,
        user_address: String,
        operation: String,
        status: String,
        protocol: String,
        timestamp: String,
        detection_time: String,
    },
    #[serde(rename = "swap:confirmed", rename_all = "camelCase")]
    Confirmed {
        tx_hash: String,
        block_number: u64,
        gas_used: u64,
        token_address: String,
        pool_address: String,
        user_address: String,
        operation: String,
        status: String,
        protocol: String,
        timestamp: String,
    },
    #[serde(rename = "swap:failed", rename_all = "camelCase")]
    Failed {
        tx_hash: String,
        block_number: u64,
        reason: String,
        status: String,
        timestamp: String,
    },
    #[serde(rename = "swap:replaced", rename_all = "camelCase")]
    Replaced {
        old_tx_hash: String,
        new_tx_hash: String,
        status: String,
        timestamp: String,
    },
}

/// Seam for tests and for deployments without a consumer.
#[async_trait]
pub trait ConfirmationSink: Send + Sync {
    async fn emit(&self, envelope: ConfirmationEnvelope);
}

/// Reconnecting WebSocket client feeding the downstream consumer.
pub struct WsConfirmationEmitter {
    queue: mpsc::Sender<ConfirmationEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl WsConfirmationEmitter {
    /// Start the emitter task. With no consumer URL configured the emitter
    /// counts every envelope as dropped.
    pub fn start(consumer_url: Option<String>, path: &str) -> Self {
        let (queue, rx) = mpsc::channel(256);
        let dropped = Arc::new(AtomicU64::new(0));

        let target = consumer_url.map(|base| {
            let base = base.trim_end_matches('/');
            format!("{}{}", base, path)
        });
        tokio::spawn(Self::run(target, rx, dropped.clone()));

        Self { queue, dropped }
    }

    /// Envelopes dropped because the consumer link was unavailable.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run(
        target: Option<String>,
        mut rx: mpsc::Receiver<ConfirmationEnvelope>,
        dropped: Arc<AtomicU64>,
    ) {
        let Some(url) = target else {
            // No consumer configured: drain and count.
            while rx.recv().await.is_some() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        };

        let mut conn = None;
        let mut last_attempt: Option<Instant> = None;

        while let Some(envelope) = rx.recv().await {
            if conn.is_none()
                && last_attempt.is_none_or(|t| t.elapsed() >= RECONNECT_SPACING)
            {
                last_attempt = Some(Instant::now());
                match connect_async(&url).await {
                    Ok((ws, _)) => {
                        info!("confirmation consumer connected at {}", url);
                        conn = Some(ws);
                    }
                    Err(e) => warn!("confirmation consumer unreachable: {}", e),
                }
            }

            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            match conn.as_mut() {
                Some(ws) => {
                    if ws.send(Message::Text(json)).await.is_err() {
                        warn!("confirmation send failed; dropping envelope");
                        conn = None;
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[async_trait]
impl ConfirmationSink for WsConfirmationEmitter {
    async fn emit(&self, envelope: ConfirmationEnvelope) {
        if self.queue.try_send(envelope).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("confirmation queue full; dropping envelope");
        }
    }
}
