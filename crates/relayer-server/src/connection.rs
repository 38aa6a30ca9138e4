//! Connection registry and WebSocket lifecycle.
//!
//! The registry holds each connection's outbound queue and liveness
//! bookkeeping; the socket itself is owned by the per-connection tasks
//! spawned in [`handle_ws_connection`], so dropping a registry entry never
//! closes a transport on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use relayer_core::{ConnectionId, RelayError, ServerEnvelope};

use crate::router::{self, RelayState};

/// Heartbeat timing for one connection.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// How often the writer task sends a keep-alive `pong`.
    pub interval: Duration,
    /// How long the connection may go without inbound traffic before it is
    /// force-closed.
    pub idle_timeout: Duration,
}

/// A connected signaling client.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<ServerEnvelope>,
    pub connected: AtomicBool,
    pub last_seen: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_seen: AtomicU64::new(now_secs()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Record inbound traffic for idle detection.
    pub fn touch(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    /// Seconds since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen.load(Ordering::Relaxed);
        Duration::from_secs(now_secs().saturating_sub(last))
    }

    /// Claim the teardown path. Only the first caller gets `true`; the
    /// guard is what keeps a read-error/idle-timeout race from broadcasting
    /// `user-left` twice.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected signaling clients.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Insert a new connection and create its outbound queue. Registering
    /// an id that is already present is an invariant violation; the caller
    /// is expected to drop the offending connection.
    pub fn register(
        &self,
        id: ConnectionId,
    ) -> Result<mpsc::Receiver<ServerEnvelope>, RelayError> {
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => Err(RelayError::DuplicateRegistration(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.max_send_queue);
                slot.insert(Arc::new(Connection::new(id, tx)));
                Ok(rx)
            }
        }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a connection. Unregistering an absent id is a no-op.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Queue an envelope for one connection. Returns whether it was
    /// accepted; a full or closed queue is a delivery failure reported to
    /// the caller, never an error that escapes.
    pub fn send(&self, id: &ConnectionId, envelope: ServerEnvelope) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        match conn.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(env)) => {
                tracing::warn!(
                    conn_id = %id,
                    kind = env.kind(),
                    "send queue full, dropping envelope"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Drive one WebSocket connection: writer task (outbound queue + heartbeat
/// + idle detection), reader task (inbound frames to the router), and
/// exactly-once teardown when either side finishes.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<ServerEnvelope>,
    relay: RelayState,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    heartbeat: HeartbeatConfig,
) {
    let Some(conn) = relay.registry.lookup(&conn_id) else {
        tracing::error!(conn_id = %conn_id, "connection missing from registry at accept");
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drain the outbound queue, tick the heartbeat, and close
    // the connection when it has been idle past the timeout.
    let writer_conn = Arc::clone(&conn);
    let writer_cid = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(envelope) => {
                            let json = match serde_json::to_string(&envelope) {
                                Ok(json) => json,
                                Err(e) => {
                                    tracing::error!(conn_id = %writer_cid, error = %e, "envelope serialization failed");
                                    continue;
                                }
                            };
                            if let Err(e) = ws_tx.send(WsMessage::Text(json.into())).await {
                                let err = RelayError::Transport(e.to_string());
                                tracing::debug!(conn_id = %writer_cid, kind = err.error_kind(), "{err}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if writer_conn.idle_for() >= heartbeat.idle_timeout {
                        tracing::info!(
                            conn_id = %writer_cid,
                            idle_secs = writer_conn.idle_for().as_secs(),
                            "idle timeout, closing connection"
                        );
                        break;
                    }
                    let json = match serde_json::to_string(&ServerEnvelope::Pong) {
                        Ok(json) => json,
                        Err(_) => break,
                    };
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_cid, "sent heartbeat");
                }
            }
        }

        writer_conn.connected.store(false, Ordering::Relaxed);
        let _ = ws_tx.close().await;
    });

    // Reader task: forward inbound text frames to the router, refresh
    // liveness on any traffic at all.
    let reader_conn = Arc::clone(&conn);
    let reader_cid = conn_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_conn.touch();
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) | WsMessage::Ping(_) => {
                    // axum answers pings itself; both directions count as life
                    reader_conn.touch();
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever task finishes first decides the connection is over.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    router::disconnect_cleanup(&relay, &conn_id);
}
