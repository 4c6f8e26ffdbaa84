//! Client-facing pub/sub socket.
//!
//! Accepts WebSocket sessions, tracks room membership per token, pushes
//! price/swap broadcasts into rooms, heartbeats everyone, and reaps
//! sessions that stop pinging. Room occupancy changes surface as
//! [RoomEvent]s so the coordinator can attach or tear down token listeners.

pub mod messages;

use crate::common::{PulseMetrics, get_timestamp_millis, iso_timestamp, normalize_address};
use crate::price::PriceCache;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

pub use messages::{
    ClientMessage, Features, FormattedPrice, HeartbeatMetrics, PriceUpdatePayload, ServerMessage,
    SwapEventPayload, room_for_token,
};

const SERVICE_NAME: &str = "amm-pulse";

/// Room occupancy transitions the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A session subscribed; `first` is true when the room went 0 → 1.
    Subscribed { token_address: String, first: bool },
    /// The last session left the room (unsubscribe, disconnect, or reap).
    Emptied { token_address: String },
}

struct Session {
    id: u64,
    connected_at: Instant,
    last_ping: Instant,
    subscriptions: HashSet<String>,
    remote_addr: String,
    outbound: mpsc::Sender<ServerMessage>,
    /// Wakes the session's reader loop so a reaped connection closes even
    /// when the peer never sends another frame.
    shutdown: mpsc::Sender<()>,
}

struct FanoutState {
    sessions: RwLock<HashMap<u64, Session>>,
    rooms: RwLock<HashMap<String, HashSet<u64>>>,
    next_id: AtomicU64,
}

/// Cloneable handle for pushing messages into rooms or to everyone.
#[derive(Clone)]
pub struct Broadcaster {
    state: Arc<FanoutState>,
}

impl Broadcaster {
    pub async fn broadcast_room(&self, token_address: &str, message: &ServerMessage) {
        let room = room_for_token(token_address);
        let member_ids: Vec<u64> = {
            let rooms = self.state.rooms.read().await;
            match rooms.get(&room) {
                Some(members) => members.iter().copied().collect(),
                None => return,
            }
        };
        let sessions = self.state.sessions.read().await;
        for id in member_ids {
            if let Some(session) = sessions.get(&id) {
                let _ = session.outbound.try_send(message.clone());
            }
        }
    }

    pub async fn broadcast_all(&self, message: &ServerMessage) {
        let sessions = self.state.sessions.read().await;
        for session in sessions.values() {
            let _ = session.outbound.try_send(message.clone());
        }
    }

    pub async fn room_member_count(&self, token_address: &str) -> usize {
        let rooms = self.state.rooms.read().await;
        rooms
            .get(&room_for_token(token_address))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.state.sessions.read().await.len()
    }
}

/// The pub/sub server. `run` owns the accept loop; timers are separate
/// tasks started by the coordinator via [FanoutServer::spawn_timers].
pub struct FanoutServer {
    state: Arc<FanoutState>,
    price_cache: Arc<PriceCache>,
    metrics: Arc<PulseMetrics>,
    room_events: mpsc::Sender<RoomEvent>,
    heartbeat_interval: Duration,
    stale_cutoff: Duration,
    reaper_interval: Duration,
    started_at: Instant,
}

impl FanoutServer {
    pub fn new(
        price_cache: Arc<PriceCache>,
        metrics: Arc<PulseMetrics>,
        room_events: mpsc::Sender<RoomEvent>,
        heartbeat_interval: Duration,
        stale_cutoff: Duration,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            state: Arc::new(FanoutState {
                sessions: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            price_cache,
            metrics,
            room_events,
            heartbeat_interval,
            stale_cutoff,
            reaper_interval,
            started_at: Instant::now(),
        }
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            state: self.state.clone(),
        }
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!(
            "fan-out socket listening on {:?}",
            listener.local_addr().ok()
        );
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer.to_string()).await;
                    });
                }
                Err(e) => {
                    warn!("fan-out accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Start the heartbeat and stale-reaper timers.
    pub fn spawn_timers(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.heartbeat_interval);
            loop {
                ticker.tick().await;
                server.send_heartbeat().await;
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.reaper_interval);
            loop {
                ticker.tick().await;
                server.reap_stale_sessions().await;
            }
        });
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: String) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("handshake with {} failed: {}", remote_addr, e);
                return;
            }
        };
        let (mut sink, mut source) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        {
            let mut sessions = self.state.sessions.write().await;
            sessions.insert(
                id,
                Session {
                    id,
                    connected_at: now,
                    last_ping: now,
                    subscriptions: HashSet::new(),
                    remote_addr: remote_addr.clone(),
                    outbound: outbound_tx.clone(),
                    shutdown: shutdown_tx,
                },
            );
        }
        self.metrics.ws_connections.inc();
        info!("session {} connected from {}", id, remote_addr);

        // Writer half: serialize outbound messages until the channel closes.
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Ok(json) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let _ = outbound_tx
            .send(ServerMessage::Welcome {
                message: "Connected to AMM pulse feed".to_string(),
                socket_id: id.to_string(),
                service: SERVICE_NAME.to_string(),
                features: Features::default(),
            })
            .await;

        loop {
            let frame = tokio::select! {
                maybe = source.next() => match maybe {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(id, &outbound_tx, message).await,
                Err(e) => {
                    // Malformed input is that session's problem only.
                    let _ = outbound_tx
                        .send(ServerMessage::Error {
                            message: format!("bad message: {}", e),
                        })
                        .await;
                }
            }
        }

        drop(outbound_tx);
        self.drop_session(id).await;
        let _ = writer.await;
        debug!("session {} closed", id);
    }

    async fn handle_client_message(
        &self,
        session_id: u64,
        outbound: &mpsc::Sender<ServerMessage>,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Subscribe { token_address } => {
                let token = normalize_address(&token_address);
                let room = room_for_token(&token);

                {
                    let mut sessions = self.state.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.subscriptions.insert(token.clone());
                    }
                }
                let first = {
                    let mut rooms = self.state.rooms.write().await;
                    let members = rooms.entry(room.clone()).or_default();
                    members.insert(session_id);
                    members.len() == 1
                };
                let _ = self
                    .room_events
                    .send(RoomEvent::Subscribed {
                        token_address: token.clone(),
                        first,
                    })
                    .await;

                let _ = outbound
                    .send(ServerMessage::Subscribed {
                        current_price: self.price_cache.get(&token),
                        token_address: token,
                        room,
                    })
                    .await;
            }
            ClientMessage::Unsubscribe { token_address } => {
                let token = normalize_address(&token_address);
                {
                    let mut sessions = self.state.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.subscriptions.remove(&token);
                    }
                }
                if self.leave_room(session_id, &token).await {
                    let _ = self
                        .room_events
                        .send(RoomEvent::Emptied {
                            token_address: token.clone(),
                        })
                        .await;
                }
                let _ = outbound
                    .send(ServerMessage::Unsubscribed {
                        token_address: token,
                    })
                    .await;
            }
            ClientMessage::Ping => {
                {
                    let mut sessions = self.state.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.last_ping = Instant::now();
                    }
                }
                let _ = outbound
                    .send(ServerMessage::Pong {
                        time: get_timestamp_millis(),
                    })
                    .await;
            }
            ClientMessage::GetAllPrices => {
                let _ = outbound
                    .send(ServerMessage::AllPrices {
                        prices: self.price_cache.all(),
                    })
                    .await;
            }
        }
    }

    /// Remove `session_id` from a token room. True when the room emptied.
    async fn leave_room(&self, session_id: u64, token: &str) -> bool {
        let room = room_for_token(token);
        let mut rooms = self.state.rooms.write().await;
        let Some(members) = rooms.get_mut(&room) else {
            return false;
        };
        members.remove(&session_id);
        if members.is_empty() {
            rooms.remove(&room);
            true
        } else {
            false
        }
    }

    /// Idempotent session removal; emits Emptied for every room the
    /// departure drained.
    async fn drop_session(&self, session_id: u64) {
        let Some(session) = self.state.sessions.write().await.remove(&session_id) else {
            return;
        };
        // No-op when the reader already exited on its own.
        let _ = session.shutdown.try_send(());
        debug!(
            "session {} from {} disconnected after {:?}",
            session_id,
            session.remote_addr,
            session.connected_at.elapsed()
        );
        for token in session.subscriptions {
            if self.leave_room(session_id, &token).await {
                let _ = self
                    .room_events
                    .send(RoomEvent::Emptied {
                        token_address: token,
                    })
                    .await;
            }
        }
    }

    async fn send_heartbeat(&self) {
        let snapshot = self.metrics.snapshot();
        let message = ServerMessage::Heartbeat {
            timestamp: iso_timestamp(),
            monitored_tokens: self.price_cache.len(),
            uptime: self.started_at.elapsed().as_secs(),
            metrics: HeartbeatMetrics {
                price_updates: snapshot.price_updates,
                cache_hits: snapshot.cache_hits,
                events_received: snapshot.events_received,
            },
        };
        self.broadcaster().broadcast_all(&message).await;
    }

    /// Disconnect sessions that have not pinged inside the cutoff. Closing
    /// the outbound channel ends the writer, which closes the socket; the
    /// reader path then runs the same idempotent cleanup.
    async fn reap_stale_sessions(&self) {
        let stale: Vec<u64> = {
            let sessions = self.state.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.last_ping.elapsed() > self.stale_cutoff)
                .map(|s| s.id)
                .collect()
        };
        for id in stale {
            warn!("reaping stale session {}", id);
            self.drop_session(id).await;
        }
    }
}
