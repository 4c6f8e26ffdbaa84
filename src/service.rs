//! Service coordinator.
//!
//! Wires the chain client, price engine, listener registry, swap listeners,
//! mempool tracker, fan-out socket, and confirmation emitter; owns the
//! periodic timers; and exposes the operation set the external routing
//! layer maps 1:1.

use crate::chain::{ChainClient, ChainEvent};
use crate::common::{
    MetricsSnapshot, PulseError, PulseMetrics, ServiceConfig, chain as chain_params,
};
use crate::confirm::{ConfirmationSink, WsConfirmationEmitter};
use crate::fanout::{FanoutServer, RoomEvent};
use crate::mempool::{MempoolTracker, PendingSwap};
use crate::pools::PoolLoader;
use crate::price::{AgentTokenEntry, PriceCache, PriceEngine, TokenPrice};
use crate::registry::{AddResult, DynamicTokenSpec, ListenerRegistry, TokenConfig};
use crate::swaps::{SwapListenerManager, SwapListenerSpec, SwapListenerInfo};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

pub struct PulseService {
    config: ServiceConfig,
    chain: Arc<ChainClient>,
    engine: Arc<PriceEngine>,
    cache: Arc<PriceCache>,
    registry: Arc<ListenerRegistry>,
    swaps: Arc<SwapListenerManager>,
    mempool: Arc<MempoolTracker>,
    fanout: Arc<FanoutServer>,
    emitter: Arc<WsConfirmationEmitter>,
    metrics: Arc<PulseMetrics>,
    room_events: Mutex<Option<mpsc::Receiver<RoomEvent>>>,
}

impl PulseService {
    /// Connect to the node and assemble the component graph. Nothing is
    /// listening or subscribed until [PulseService::run].
    pub async fn init(config: ServiceConfig) -> Result<Arc<Self>, PulseError> {
        let tunables = config.tunables.clone();
        let metrics = Arc::new(PulseMetrics::new());

        let chain = ChainClient::connect(
            &config.node_wss_url,
            tunables.max_reconnect_attempts,
            tunables.reconnect_delay,
            tunables.receipt_poll_interval,
        )
        .await?;

        let loader = Arc::new(PoolLoader::new(chain.clone()));
        let engine = Arc::new(PriceEngine::new(
            loader,
            chain_params::default_bnb_reference_pools(),
            tunables.update_bnb_price_interval,
            tunables.agent_price_cache_ttl,
            metrics.clone(),
        ));
        let cache = Arc::new(PriceCache::new());

        let (room_tx, room_rx) = mpsc::channel(128);
        let fanout = Arc::new(FanoutServer::new(
            cache.clone(),
            metrics.clone(),
            room_tx,
            tunables.heartbeat_interval,
            tunables.stale_session_cutoff,
            tunables.reaper_interval,
        ));
        let broadcaster = fanout.broadcaster();

        let emitter = Arc::new(WsConfirmationEmitter::start(
            config.consumer_url.clone(),
            &config.consumer_path,
        ));
        let sink: Arc<dyn ConfirmationSink> = emitter.clone();

        let mempool = Arc::new(MempoolTracker::new(
            chain.clone(),
            sink.clone(),
            metrics.clone(),
            tunables.pending_swap_timeout,
        ));
        let registry = Arc::new(ListenerRegistry::new(
            chain.clone(),
            engine.clone(),
            cache.clone(),
            broadcaster.clone(),
            metrics.clone(),
            tunables.price_update_threshold,
            tunables.update_coalesce_window,
        ));
        let swaps = Arc::new(SwapListenerManager::new(
            chain.clone(),
            engine.clone(),
            cache.clone(),
            mempool.clone(),
            sink,
            broadcaster,
            metrics.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            chain,
            engine,
            cache,
            registry,
            swaps,
            mempool,
            fanout,
            emitter,
            metrics,
            room_events: Mutex::new(Some(room_rx)),
        }))
    }

    /// Start every background task and block until the node connection is
    /// irrecoverably lost.
    pub async fn run(self: &Arc<Self>) -> Result<(), PulseError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| PulseError::Config(format!("cannot bind listen port: {}", e)))?;
        info!("amm-pulse listening on port {}", self.config.listen_port);

        self.engine.bnb.refresh(self.engine.loader()).await;

        tokio::spawn(self.fanout.clone().run(listener));
        self.fanout.spawn_timers();
        self.mempool.start().await;
        self.spawn_bnb_timer();
        self.spawn_room_event_loop().await;

        let mut events = self.chain.subscribe_events();
        loop {
            match events.recv().await {
                Ok(ChainEvent::Reconnected) => {
                    info!("chain reconnected; re-attaching subscriptions");
                    self.registry.on_reconnect().await;
                    self.mempool.start().await;
                }
                Ok(ChainEvent::Fatal) => {
                    error!("node connection lost for good");
                    return Err(PulseError::WsRpc(
                        "node reconnect attempts exhausted".to_string(),
                    ));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("chain event listener lagged {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    fn spawn_bnb_timer(self: &Arc<Self>) {
        let service = self.clone();
        let period = self.config.tunables.update_bnb_price_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.engine.bnb.refresh(service.engine.loader()).await;
            }
        });
    }

    /// React to room occupancy: a first subscriber attaches a configured
    /// token, an emptied room tears a dynamic one down.
    async fn spawn_room_event_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.room_events.lock().await.take() else {
            return;
        };
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RoomEvent::Subscribed {
                        token_address,
                        first,
                    } => {
                        if !first || service.registry.is_monitored(&token_address) {
                            continue;
                        }
                        if service.registry.has_config(&token_address) {
                            if let Err(e) = service.registry.add_token(&token_address).await {
                                warn!("subscription add for {} failed: {}", token_address, e);
                                service
                                    .metrics
                                    .record_error("subscribe-add", e.to_string());
                            }
                        }
                    }
                    RoomEvent::Emptied { token_address } => {
                        if service.registry.binding_is_dynamic(&token_address).await
                            == Some(true)
                        {
                            info!("room for {} emptied; removing dynamic token", token_address);
                            service.remove_dynamic_token(&token_address).await;
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // REST-facing operations
    // ------------------------------------------------------------------

    pub async fn add_token(&self, token_address: &str) -> Result<Option<TokenPrice>, PulseError> {
        self.metrics.api_requests.inc();
        self.registry.add_token(token_address).await
    }

    pub async fn add_dynamic_tokens(&self, specs: Vec<DynamicTokenSpec>) -> Vec<AddResult> {
        self.metrics.api_requests.inc();
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let token_address = spec.token_address.clone();
            match self.registry.add_dynamic_token(spec).await {
                Ok(price) => results.push(AddResult {
                    token_address,
                    added: price.is_some(),
                    error: price.is_none().then(|| "no live pools".to_string()),
                    price,
                }),
                Err(e) => results.push(AddResult {
                    token_address,
                    added: false,
                    error: Some(e.to_string()),
                    price: None,
                }),
            }
        }
        results
    }

    /// Tear down a dynamically-added token everywhere: listeners, price
    /// cache, swap listener, mempool monitors.
    pub async fn remove_dynamic_token(&self, token_address: &str) -> bool {
        self.metrics.api_requests.inc();
        let (existed, pools) = self.registry.remove_token(token_address).await;
        self.mempool.remove_pools(&pools);
        self.swaps.stop_listener(token_address);
        existed
    }

    pub async fn start_swap_listener(
        &self,
        spec: SwapListenerSpec,
    ) -> Result<Option<SwapListenerInfo>, PulseError> {
        self.metrics.api_requests.inc();
        self.swaps.start_listener(spec).await
    }

    pub fn stop_swap_listener(&self, token_address: &str) -> bool {
        self.metrics.api_requests.inc();
        self.swaps.stop_listener(token_address)
    }

    pub fn get_swap_listener(&self, token_address: &str) -> Option<SwapListenerInfo> {
        self.swaps.get_listener(token_address)
    }

    pub fn get_active_swap_listeners(&self) -> Vec<SwapListenerInfo> {
        self.swaps.active_listeners()
    }

    pub fn get_token_price(&self, token_address: &str) -> Option<TokenPrice> {
        self.metrics.api_requests.inc();
        let price = self.cache.get(token_address);
        if price.is_some() {
            self.metrics.cache_hits.inc();
        } else {
            self.metrics.cache_misses.inc();
        }
        price
    }

    pub fn get_cached_prices(&self) -> Vec<TokenPrice> {
        self.metrics.api_requests.inc();
        self.cache.all()
    }

    pub fn get_monitored_tokens(&self) -> Vec<String> {
        self.registry.monitored_tokens()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_pending_swaps(&self) -> Vec<PendingSwap> {
        self.mempool.pending_snapshot()
    }

    /// Envelopes dropped by the confirmation emitter so far.
    pub fn confirmation_drops(&self) -> u64 {
        self.emitter.dropped_count()
    }

    // ------------------------------------------------------------------
    // Embedding configuration
    // ------------------------------------------------------------------

    /// Register a static token configuration for `add_token`.
    pub fn register_token_config(&self, token_address: &str, config: TokenConfig) {
        self.registry.register_token_config(token_address, config);
    }

    /// Register an agent-token entry for recursive USD resolution.
    pub fn register_agent_token(&self, token_address: &str, entry: AgentTokenEntry) {
        self.engine.register_agent(token_address, entry);
    }
}
