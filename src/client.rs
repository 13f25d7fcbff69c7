//! WebSocket client for the lock server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Lock and unlock requests with acknowledgements
//! - Peer lock events (cell locked / unlocked elsewhere)
//! - Active-lock queries for grid rendering
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{CellRef, ClientMessage, LockSnapshot, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the lock client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Admitted to the dataset session under this connection identity
    Joined { conn: Uuid },
    /// The server refused our join
    Denied { reason: String },
    /// Answer to our lock request
    LockResult {
        granted: bool,
        revoked: Option<CellRef>,
    },
    /// Answer to our unlock request
    UnlockResult { released: bool },
    /// Answer to an active-lock query
    ActiveLocks {
        dataset: String,
        locks: LockSnapshot,
    },
    /// Another connection locked a cell
    CellLocked { cell: CellRef },
    /// Another connection's lock went away
    CellUnlocked { cell: CellRef },
    /// Connection lost
    Disconnected,
}

/// The lock client.
///
/// Manages a WebSocket connection to the lock server for one dataset:
/// joins on connect, relays lock traffic, and surfaces peer lock events
/// to the application.
pub struct CollabClient {
    /// Dataset we join on connect
    dataset: String,

    /// Ticket presented with the join
    ticket: String,

    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Identity the server assigned us, once joined
    conn_id: Arc<RwLock<Option<Uuid>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Background tasks, kept so `abort` can kill the connection
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl CollabClient {
    /// Create a new lock client for one dataset.
    pub fn new(
        dataset: impl Into<String>,
        ticket: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            dataset: dataset.into(),
            ticket: ticket.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            conn_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join our dataset.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    /// The join outcome arrives as a `Joined` or `Denied` event.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let ws_stream = match ws_result {
            Ok((ws_stream, _)) => ws_stream,
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel into the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.writer_task = Some(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        }));

        // Join our dataset
        let join = ClientMessage::Join {
            dataset: self.dataset.clone(),
            ticket: self.ticket.clone(),
        };
        out_tx
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: decode server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let conn_id = self.conn_id.clone();
        self.reader_task = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable server message: {e}");
                                continue;
                            }
                        };

                        let event = match server_msg {
                            ServerMessage::Joined { conn } => {
                                *conn_id.write().await = Some(conn);
                                ClientEvent::Joined { conn }
                            }
                            ServerMessage::Denied { reason } => ClientEvent::Denied { reason },
                            ServerMessage::LockReply { granted, revoked } => {
                                ClientEvent::LockResult { granted, revoked }
                            }
                            ServerMessage::UnlockReply { released } => {
                                ClientEvent::UnlockResult { released }
                            }
                            ServerMessage::ActiveLocks { dataset, locks } => {
                                ClientEvent::ActiveLocks { dataset, locks }
                            }
                            ServerMessage::Locked { cell } => ClientEvent::CellLocked { cell },
                            ServerMessage::Unlocked { cell } => {
                                ClientEvent::CellUnlocked { cell }
                            }
                        };
                        let _ = event_tx.send(event).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            *conn_id.write().await = None;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Request the lock on a cell. The answer arrives as `LockResult`.
    pub async fn lock(&self, cell: &CellRef) -> Result<(), ProtocolError> {
        if !cell.is_valid() {
            return Err(ProtocolError::InvalidCell);
        }
        self.send(ClientMessage::Lock { cell: cell.clone() }).await
    }

    /// Release a cell. `committed` records whether the edit was saved;
    /// it only affects server-side accounting of stale releases.
    pub async fn unlock(&self, cell: &CellRef, committed: bool) -> Result<(), ProtocolError> {
        if !cell.is_valid() {
            return Err(ProtocolError::InvalidCell);
        }
        self.send(ClientMessage::Unlock {
            cell: cell.clone(),
            committed,
        })
        .await
    }

    /// Ask for the active locks in our dataset. The answer arrives as
    /// an `ActiveLocks` event.
    pub async fn query_locks(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::QueryLocks {
            dataset: self.dataset.clone(),
        })
        .await
    }

    /// Close the connection politely. The server releases our lock when
    /// it sees the socket go.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        *self.conn_id.write().await = None;
    }

    /// Kill the connection without a close handshake, as a crashed or
    /// suspended browser tab would. For tests of server-side cleanup.
    pub async fn abort(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        *self.conn_id.write().await = None;
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the identity the server assigned us, if joined.
    pub async fn conn_id(&self) -> Option<Uuid> {
        *self.conn_id.read().await
    }

    /// Get the dataset this client joins.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
