//! Binary wire protocol for edit-lock coordination.
//!
//! Wire format (bincode-encoded tagged enums):
//! ```text
//! ┌─────────────┬──────────────────────────────────────┐
//! │ variant tag │ payload                              │
//! │ varint      │ cell refs / flags / snapshot maps    │
//! └─────────────┴──────────────────────────────────────┘
//! ```
//!
//! Inbound messages never carry a holder identity: the server stamps
//! every request with the connection it arrived on. Broadcasts carry
//! only the cell; mapping a holder to a display name is the UI's job.
//!
//! Performance target: lock request encode < 300ns.
//! Reference: Patterson & Hennessy, Section 5.7 — Data Compression

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a single lockable cell: dataset → document → field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub dataset: String,
    pub document: String,
    pub field: String,
}

impl CellRef {
    pub fn new(
        dataset: impl Into<String>,
        document: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            document: document.into(),
            field: field.into(),
        }
    }

    /// A cell is addressable only if all three components are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.dataset.is_empty() && !self.document.is_empty() && !self.field.is_empty()
    }
}

impl std::fmt::Display for CellRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.dataset, self.document, self.field)
    }
}

/// Snapshot of one dataset's active locks: document → field → holder.
pub type LockSnapshot = HashMap<String, HashMap<String, Uuid>>;

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on a connection: join a dataset session.
    /// The ticket is an opaque credential minted by the session layer.
    Join { dataset: String, ticket: String },
    /// Request the edit lock for a cell.
    Lock { cell: CellRef },
    /// Give a lock back. `committed` marks whether the edit saved,
    /// which makes releasing an already-revoked lock a success.
    Unlock { cell: CellRef, committed: bool },
    /// Ask for the current lock snapshot of a dataset.
    QueryLocks { dataset: String },
}

/// Messages the server sends to clients.
///
/// `Joined`/`Denied`/`LockReply`/`UnlockReply`/`ActiveLocks` are unicast
/// answers; `Locked`/`Unlocked` fan out to every other connection in the
/// cell's dataset session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join accepted; carries the server-assigned connection identity.
    Joined { conn: Uuid },
    /// Join rejected. The connection is closed afterwards.
    Denied { reason: String },
    /// Result of a `Lock` request. `revoked` is the different cell the
    /// requester previously held, released as a side effect.
    LockReply { granted: bool, revoked: Option<CellRef> },
    /// Result of an `Unlock` request.
    UnlockReply { released: bool },
    /// Snapshot answer to `QueryLocks`.
    ActiveLocks { dataset: String, locks: LockSnapshot },
    /// Another connection took the lock on a cell.
    Locked { cell: CellRef },
    /// A cell's lock went away (explicit release, revoke, or disconnect).
    Unlocked { cell: CellRef },
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidCell,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidCell => write!(f, "Cell reference has an empty component"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
