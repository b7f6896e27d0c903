//! # Live Event Endpoint
//!
//! Fans the monitoring stream out to WebSocket clients. One shared
//! subscriber task reads the global events channel (every event, project-
//! scoped and stats included, is published there first) and routes each
//! event through per-client filters into bounded delivery queues. A
//! client whose queue is gone or full is dropped; closing the socket
//! removes the registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nexus_shared::monitoring::MonitoringEvent;
use nexus_shared::types::GlobalStats;

use crate::context::SystemContext;
use crate::web::filter::ClientFilter;

/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Per-client delivery queue depth.
const CLIENT_BUFFER_SIZE: usize = 128;

struct ClientSession {
    filter: ClientFilter,
    tx: mpsc::Sender<String>,
}

pub struct WsManager {
    ctx: Arc<SystemContext>,
    clients: DashMap<u64, ClientSession>,
    next_client_id: AtomicU64,
    subscriber_started: AtomicBool,
}

impl std::fmt::Debug for WsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsManager")
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl WsManager {
    pub fn new(ctx: Arc<SystemContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            subscriber_started: AtomicBool::new(false),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start the shared subscriber on first use. Idempotent.
    async fn ensure_subscriber(self: &Arc<Self>) {
        if self
            .subscriber_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let channels = vec![self.ctx.config.monitoring.events_channel.clone()];
        match self.ctx.pubsub.subscribe(&channels).await {
            Ok(mut stream) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    while let Some((_, payload)) = stream.recv().await {
                        manager.route_event(&payload);
                    }
                    info!("live-stream subscriber ended");
                });
            }
            Err(e) => {
                warn!(error = %e, "live-stream subscription failed");
                self.subscriber_started.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Deliver one serialized event to every matching client; drop clients
    /// that cannot accept it.
    fn route_event(&self, payload: &str) {
        let event: Value = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "undecodable monitoring event on stream");
                return;
            }
        };

        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().filter.matches(&event)
                && entry.value().tx.try_send(payload.to_string()).is_err()
            {
                dead.push(*entry.key());
            }
        }
        for client_id in dead {
            debug!(client_id, "dropping unresponsive stream client");
            self.clients.remove(&client_id);
        }
    }

    /// Current stats snapshot: queue depths plus online worker count.
    pub async fn snapshot(&self) -> MonitoringEvent {
        let stats = GlobalStats {
            workers_online: self.ctx.queue.workers_online().await.unwrap_or(0),
            queue: self.ctx.queue.queue_depths().await.unwrap_or_default(),
            tasks_in_progress: 0,
        };
        MonitoringEvent::stats_snapshot(stats.queue.as_map(), stats.workers_online)
    }

    /// Drive one client connection to completion.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, filter: ClientFilter) {
        self.ensure_subscriber().await;

        let (tx, mut rx) = mpsc::channel(CLIENT_BUFFER_SIZE);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(client_id, ClientSession { filter, tx });
        info!(client_id, clients = self.clients.len(), "stream client connected");

        // Snapshot first, before any streamed events
        let snapshot = self.snapshot().await;
        if let Ok(payload) = serde_json::to_string(&snapshot) {
            if socket.send(Message::Text(payload.into())).await.is_err() {
                self.clients.remove(&client_id);
                return;
            }
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(payload) => {
                            if socket.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break, // manager dropped us
                    }
                }
                _ = ping.tick() => {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {} // pongs and client chatter are ignored
                    }
                }
            }
        }

        self.clients.remove(&client_id);
        info!(client_id, clients = self.clients.len(), "stream client disconnected");
    }
}
