//! Chain client over a single multiplexed node WebSocket (ethers-rs).
//!
//! Wraps one `Provider<Ws>`: typed RPC calls, raw-selector `eth_call`,
//! topic-filtered log subscriptions, the pending-transaction firehose, and a
//! supervised reconnect loop. Subscribers learn about reconnects over a
//! broadcast channel and re-attach their own subscriptions.

use crate::common::{PulseError, looks_like_tx_hash};
use ethers::core::types::{
    Address, Bytes, Filter, H256, Log, Transaction, TransactionReceipt, TransactionRequest, U256,
};
use ethers::providers::{Middleware, Provider, Ws};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Connection lifecycle notifications for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// A new connection is live; log subscriptions must be re-attached.
    Reconnected,
    /// Reconnect attempts are exhausted; the service cannot continue.
    Fatal,
}

/// Teardown handle for one log subscription.
///
/// Cancelling (or dropping) detaches the pump task and sends
/// `eth_unsubscribe` for the underlying subscription, exactly once.
pub struct SubscriptionHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Single shared node connection.
pub struct ChainClient {
    ws_url: String,
    provider: RwLock<Option<Arc<Provider<Ws>>>>,
    connected: AtomicBool,
    events_tx: broadcast::Sender<ChainEvent>,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    receipt_poll_interval: Duration,
}

impl ChainClient {
    /// Connect to the node and start the connection supervisor.
    pub async fn connect(
        ws_url: &str,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
        receipt_poll_interval: Duration,
    ) -> Result<Arc<Self>, PulseError> {
        let provider = Provider::<Ws>::connect(ws_url)
            .await
            .map_err(|e| PulseError::WsRpc(e.to_string()))?;
        let (events_tx, _) = broadcast::channel(16);

        let client = Arc::new(Self {
            ws_url: ws_url.to_string(),
            provider: RwLock::new(Some(Arc::new(provider))),
            connected: AtomicBool::new(true),
            events_tx,
            max_reconnect_attempts,
            reconnect_delay,
            receipt_poll_interval,
        });

        tokio::spawn(Self::supervise(client.clone()));
        Ok(client)
    }

    /// A client that starts with no live connection: every call returns a
    /// transport error and no supervisor runs. For tooling and tests that
    /// never touch the network.
    pub fn offline(receipt_poll_interval: Duration) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            ws_url: String::new(),
            provider: RwLock::new(None),
            connected: AtomicBool::new(false),
            events_tx,
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_secs(1),
            receipt_poll_interval,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Receiver of [ChainEvent] notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.events_tx.subscribe()
    }

    fn provider(&self) -> Result<Arc<Provider<Ws>>, PulseError> {
        self.provider
            .read()
            .expect("provider slot lock")
            .clone()
            .ok_or_else(|| PulseError::WsRpc("node connection is down".to_string()))
    }

    pub async fn chain_id(&self) -> Result<U256, PulseError> {
        self.provider()?
            .get_chainid()
            .await
            .map_err(|e| PulseError::WsRpc(e.to_string()))
    }

    pub async fn block_number(&self) -> Result<u64, PulseError> {
        self.provider()?
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| PulseError::WsRpc(e.to_string()))
    }

    /// Raw `eth_call` with pre-encoded calldata (selector + args).
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, PulseError> {
        let tx = TransactionRequest::new().to(to).data(Bytes::from(data));
        self.provider()?
            .call(&tx.into(), None)
            .await
            .map_err(|e| PulseError::WsRpc(e.to_string()))
    }

    pub async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>, PulseError> {
        self.provider()?
            .get_transaction(hash)
            .await
            .map_err(|e| PulseError::WsRpc(e.to_string()))
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, PulseError> {
        self.provider()?
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| PulseError::WsRpc(e.to_string()))
    }

    /// Poll for a receipt until `timeout` elapses. `Ok(None)` means the
    /// deadline won the race.
    pub async fn wait_for_transaction(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>, PulseError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                // Transient RPC failures do not abandon the wait.
                Err(e) => debug!("receipt poll for {:?} failed: {}", hash, e),
            }
            if tokio::time::Instant::now() + self.receipt_poll_interval >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    /// Subscribe to logs for one `(address, topic0)` pair. Events arrive on
    /// the returned receiver in the node's order for this subscription.
    /// Errors when the node rejects the subscription.
    pub async fn subscribe_logs(
        &self,
        address: Address,
        topic0: H256,
    ) -> Result<(mpsc::Receiver<Log>, SubscriptionHandle), PulseError> {
        let provider = self.provider()?;
        let (tx, rx) = mpsc::channel(256);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        // The subscription stream borrows the provider, so both live inside
        // the pump task; the probe channel carries the attach result out.
        tokio::spawn(async move {
            let filter = Filter::new().address(address).topic0(topic0);
            let mut stream = match provider.subscribe_logs(&filter).await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let sub_id = stream.id;

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    maybe_log = stream.next() => match maybe_log {
                        Some(log) => {
                            if tx.send(log).await.is_err() {
                                break;
                            }
                        }
                        // Stream ended: the connection dropped. The owner
                        // re-attaches after the Reconnected notification.
                        None => break,
                    },
                }
            }

            drop(stream);
            let _ = provider.unsubscribe(sub_id).await;
            debug!("log subscription {:?} for {:?} detached", sub_id, address);
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok((
                rx,
                SubscriptionHandle {
                    cancel_tx: Some(cancel_tx),
                },
            )),
            Ok(Err(e)) => Err(PulseError::WsRpc(e)),
            Err(_) => Err(PulseError::WsRpc("subscription task died".to_string())),
        }
    }

    /// Subscribe to `newPendingTransactions`. Items that are not 32-byte
    /// hashes (some providers push block headers here) are dropped without
    /// disturbing the stream; a per-item failure never ends the
    /// subscription. Errors when the node lacks the mempool extension, so
    /// callers can degrade to log-only mode.
    pub async fn subscribe_pending_hashes(
        &self,
    ) -> Result<mpsc::Receiver<H256>, PulseError> {
        let provider = self.provider()?;
        let (tx, rx) = mpsc::channel(1024);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        tokio::spawn(async move {
            let mut stream = match provider
                .subscribe::<_, serde_json::Value>(["newPendingTransactions"])
                .await
            {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let sub_id = stream.id;

            while let Some(item) = stream.next().await {
                let Some(raw) = item.as_str() else {
                    continue;
                };
                if !looks_like_tx_hash(raw) {
                    continue;
                }
                let Ok(hash) = H256::from_str(raw) else {
                    continue;
                };
                if tx.send(hash).await.is_err() {
                    break;
                }
            }
            drop(stream);
            let _ = provider.unsubscribe(sub_id).await;
            debug!("pending-tx subscription detached");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(PulseError::WsRpc(e)),
            Err(_) => Err(PulseError::WsRpc("subscription task died".to_string())),
        }
    }

    /// Watch the live connection; on loss, reconnect with bounded retries
    /// and notify subscribers, or surface a fatal condition on exhaustion.
    async fn supervise(self: Arc<Self>) {
        loop {
            let Ok(provider) = self.provider() else {
                break;
            };

            Self::watch_until_closed(&provider).await;
            self.connected.store(false, Ordering::SeqCst);
            warn!("node connection lost; reconnecting");

            let mut attempt = 0u32;
            let replacement = loop {
                attempt += 1;
                if attempt > self.max_reconnect_attempts {
                    break None;
                }
                tokio::time::sleep(self.reconnect_delay).await;
                match Provider::<Ws>::connect(&self.ws_url).await {
                    Ok(p) => break Some(Arc::new(p)),
                    Err(e) => warn!(
                        "reconnect attempt {}/{} failed: {}",
                        attempt, self.max_reconnect_attempts, e
                    ),
                }
            };

            match replacement {
                Some(p) => {
                    *self.provider.write().expect("provider slot lock") = Some(p);
                    self.connected.store(true, Ordering::SeqCst);
                    info!("node connection re-established");
                    let _ = self.events_tx.send(ChainEvent::Reconnected);
                }
                None => {
                    *self.provider.write().expect("provider slot lock") = None;
                    error!(
                        "giving up after {} reconnect attempts",
                        self.max_reconnect_attempts
                    );
                    let _ = self.events_tx.send(ChainEvent::Fatal);
                    break;
                }
            }
        }
    }

    /// Resolves when the given connection stops producing block
    /// notifications, which is the transport-close signal for a Ws provider.
    async fn watch_until_closed(provider: &Provider<Ws>) {
        let mut blocks = match provider.subscribe_blocks().await {
            Ok(s) => s,
            Err(_) => return,
        };
        while blocks.next().await.is_some() {}
    }
}
