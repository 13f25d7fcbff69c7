//! WebSocket lock server with dataset-session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── dataset session ── SessionGroup (fan-out)
//! Client B ──┘          │
//!                       ▼
//!                LockCoordinator ── FieldLockTable
//!                       │                  │
//!              Locked / Unlocked    (ds, doc, field) → holder
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!         Client A              Client B
//! ```
//!
//! Each connection joins exactly one dataset session after its ticket
//! passes validation; lock traffic outside that dataset is refused. The
//! coordinator is shared across sessions, so a connection's single lock
//! may live in any dataset the server knows. When a connection ends,
//! for any reason, its lock is force-released and announced before the
//! membership record goes away.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 8 & 9

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{AllowAll, TicketValidator};
use crate::broadcast::{Frame, JoinOutcome, SessionGroup, SessionRegistry};
use crate::coordinator::LockCoordinator;
use crate::protocol::{CellRef, ClientMessage, LockSnapshot, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per dataset session
    pub max_conns_per_dataset: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_conns_per_dataset: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub denied_joins: u64,
    pub active_sessions: usize,
}

/// Everything a connection gains by joining a dataset. Held as one
/// option so a half-joined state cannot exist.
struct JoinedState {
    dataset: String,
    session: Arc<SessionGroup>,
    rx: tokio::sync::broadcast::Receiver<Frame>,
}

/// Why a lock or unlock request cannot be forwarded to the coordinator.
fn rejection_reason(joined: &Option<JoinedState>, cell: &CellRef) -> Option<&'static str> {
    let Some(j) = joined else {
        return Some("no dataset joined");
    };
    if !cell.is_valid() {
        return Some("malformed cell reference");
    }
    if j.dataset != cell.dataset {
        return Some("cell outside joined dataset");
    }
    None
}

/// The lock server.
pub struct CollabServer {
    config: ServerConfig,
    /// Dataset sessions: dataset → membership + fan-out channel
    registry: Arc<SessionRegistry>,
    /// Process-wide lock state
    coordinator: Arc<LockCoordinator>,
    /// Admission check applied to every Join
    validator: Arc<dyn TicketValidator>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a new lock server admitting every ticket.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_validator(config, Arc::new(AllowAll))
    }

    /// Create a server with a custom admission policy.
    pub fn with_validator(config: ServerConfig, validator: Arc<dyn TicketValidator>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.broadcast_capacity));
        let coordinator = Arc::new(LockCoordinator::new(registry.clone()));
        Self {
            config,
            registry,
            coordinator,
            validator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Lock server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let coordinator = self.coordinator.clone();
            let validator = self.validator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, registry, coordinator, validator, stats, config,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<LockCoordinator>,
        validator: Arc<dyn TicketValidator>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("WebSocket connection established from {addr} as {conn_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<JoinedState> = None;
        let result = Self::connection_loop(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            conn_id,
            &mut joined,
            &registry,
            &coordinator,
            &validator,
            &stats,
            &config,
        )
        .await;

        // Cleanup runs whether the loop ended cleanly or with an error.
        // A connection that vanished mid-send must still lose its lock.
        if let Some(j) = joined {
            coordinator.release_all(conn_id).await;
            registry.leave(&j.dataset, &conn_id);
            log::info!("Connection {conn_id} left dataset {}", j.dataset);
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = registry.session_count();
        }

        result
    }

    /// Per-connection message loop. Returns when the peer closes, the
    /// socket errors, or a join is refused.
    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
        ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
        addr: SocketAddr,
        conn_id: Uuid,
        joined: &mut Option<JoinedState>,
        registry: &Arc<SessionRegistry>,
        coordinator: &Arc<LockCoordinator>,
        validator: &Arc<dyn TicketValidator>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let client_msg = match ClientMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match client_msg {
                                ClientMessage::Join { dataset, ticket } => {
                                    if joined.is_some() {
                                        log::warn!(
                                            "Connection {conn_id} sent a second join (for {dataset:?})"
                                        );
                                        let denied = ServerMessage::Denied {
                                            reason: "already joined".to_string(),
                                        };
                                        ws_sender
                                            .send(Message::Binary(denied.encode()?.into()))
                                            .await?;
                                        continue;
                                    }

                                    let refusal = if dataset.is_empty() {
                                        Some("dataset name is empty".to_string())
                                    } else {
                                        validator
                                            .validate(&dataset, &ticket)
                                            .err()
                                            .map(|e| e.to_string())
                                    };
                                    if let Some(reason) = refusal {
                                        log::warn!(
                                            "Join denied for {conn_id} on {dataset:?}: {reason}"
                                        );
                                        {
                                            let mut s = stats.write().await;
                                            s.denied_joins += 1;
                                        }
                                        let denied = ServerMessage::Denied { reason };
                                        ws_sender
                                            .send(Message::Binary(denied.encode()?.into()))
                                            .await?;
                                        return Ok(());
                                    }

                                    let outcome = registry.join(
                                        &dataset,
                                        conn_id,
                                        config.max_conns_per_dataset,
                                    );
                                    let JoinOutcome::Admitted { session, rx } = outcome else {
                                        log::warn!(
                                            "Join denied for {conn_id}: dataset {dataset} is full"
                                        );
                                        {
                                            let mut s = stats.write().await;
                                            s.denied_joins += 1;
                                        }
                                        let denied = ServerMessage::Denied {
                                            reason: "dataset session is full".to_string(),
                                        };
                                        ws_sender
                                            .send(Message::Binary(denied.encode()?.into()))
                                            .await?;
                                        return Ok(());
                                    };

                                    *joined = Some(JoinedState {
                                        dataset: dataset.clone(),
                                        session,
                                        rx,
                                    });
                                    {
                                        let mut s = stats.write().await;
                                        s.active_sessions = registry.session_count();
                                    }

                                    let reply = ServerMessage::Joined { conn: conn_id };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                    log::info!("Connection {conn_id} joined dataset {dataset}");
                                }

                                ClientMessage::Lock { cell } => {
                                    let reply = match rejection_reason(joined, &cell) {
                                        Some(why) => {
                                            log::warn!(
                                                "Lock request from {conn_id} rejected: {why} ({cell})"
                                            );
                                            ServerMessage::LockReply {
                                                granted: false,
                                                revoked: None,
                                            }
                                        }
                                        None => {
                                            let grant = coordinator.acquire(conn_id, &cell).await;
                                            ServerMessage::LockReply {
                                                granted: grant.granted,
                                                revoked: grant.revoked,
                                            }
                                        }
                                    };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }

                                ClientMessage::Unlock { cell, committed } => {
                                    let reply = match rejection_reason(joined, &cell) {
                                        Some(why) => {
                                            log::warn!(
                                                "Unlock request from {conn_id} rejected: {why} ({cell})"
                                            );
                                            ServerMessage::UnlockReply { released: false }
                                        }
                                        None => {
                                            let released = coordinator
                                                .release(conn_id, &cell, committed)
                                                .await;
                                            ServerMessage::UnlockReply { released }
                                        }
                                    };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }

                                ClientMessage::QueryLocks { dataset } => {
                                    let permitted = matches!(
                                        joined, Some(j) if j.dataset == dataset
                                    );
                                    let locks = if permitted {
                                        coordinator.active_locks(&dataset).await
                                    } else {
                                        log::warn!(
                                            "Query from {conn_id} for unjoined dataset {dataset:?}"
                                        );
                                        LockSnapshot::new()
                                    };
                                    let reply = ServerMessage::ActiveLocks { dataset, locks };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Lock event fan-out from the session
                frame = async {
                    if let Some(ref mut j) = joined {
                        j.rx.recv().await
                    } else {
                        // Not joined yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            // The origin already got a direct reply
                            if frame.origin == conn_id {
                                continue;
                            }
                            ws_sender
                                .send(Message::Binary(frame.bytes.to_vec().into()))
                                .await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} lock events");
                            if let Some(ref j) = joined {
                                j.session.record_dropped(n);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the lock coordinator.
    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTickets;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_conns_per_dataset, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.registry().session_count(), 0);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_conns_per_dataset: 50,
            broadcast_capacity: 512,
        };
        let server = CollabServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_server_with_validator() {
        let tickets = StaticTickets::new().grant("t-alpha", "ds1");
        let server = CollabServer::with_validator(ServerConfig::default(), Arc::new(tickets));
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.denied_joins, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_rejection_reasons() {
        let mut joined: Option<JoinedState> = None;
        let cell = CellRef::new("ds1", "doc1", "price");
        assert_eq!(rejection_reason(&joined, &cell), Some("no dataset joined"));

        let registry = SessionRegistry::new(8);
        let conn = Uuid::new_v4();
        let JoinOutcome::Admitted { session, rx } = registry.join("ds1", conn, 8) else {
            panic!("join refused");
        };
        joined = Some(JoinedState {
            dataset: "ds1".to_string(),
            session,
            rx,
        });

        assert_eq!(rejection_reason(&joined, &cell), None);
        assert_eq!(
            rejection_reason(&joined, &CellRef::new("ds1", "doc1", "")),
            Some("malformed cell reference")
        );
        assert_eq!(
            rejection_reason(&joined, &CellRef::new("ds2", "doc1", "price")),
            Some("cell outside joined dataset")
        );
    }
}
