//! Per-dataset fan-out to N-1 connections with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames. Frames carry the originating connection id so the
//! per-connection forward loop can drop its own broadcasts without
//! decoding the payload.
//!
//! Membership and the session map live behind `std::sync::RwLock`: every
//! operation here is a plain map access or a synchronous channel send, so
//! the lock coordinator can fan out lock events from inside its own
//! critical section without ever awaiting.
//!
//! Performance target: 1,000 frames to 100 connections < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// A broadcast frame: pre-encoded bytes tagged with the connection that
/// caused them. Receivers skip frames whose origin is themselves.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring session health.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Atomic session stats — lock-free on the send path.
struct AtomicSessionStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicSessionStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single dataset session.
///
/// All connections viewing the same dataset share one channel. When the
/// coordinator grants or revokes a lock, the event is fanned out to the
/// other N-1 members.
pub struct SessionGroup {
    /// Broadcast channel sender (one per dataset)
    sender: broadcast::Sender<Frame>,

    /// Connections currently joined to this dataset
    members: RwLock<HashSet<Uuid>>,

    /// Channel capacity (frames buffered per receiver)
    capacity: usize,

    /// Lock-free stats (atomics)
    atomic_stats: AtomicSessionStats,
}

impl SessionGroup {
    /// Create a new session group with the given buffer capacity.
    ///
    /// `capacity` determines how many frames can be buffered per member
    /// before a lagging member starts dropping frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicSessionStats::new(),
        }
    }

    /// Add a connection to this session.
    ///
    /// Returns the receiver this connection consumes broadcasts from.
    pub fn add_member(&self, conn: Uuid) -> broadcast::Receiver<Frame> {
        self.members.write().unwrap().insert(conn);
        self.sender.subscribe()
    }

    /// Remove a connection from this session.
    pub fn remove_member(&self, conn: &Uuid) -> bool {
        self.members.write().unwrap().remove(conn)
    }

    /// Broadcast a message to all members.
    ///
    /// Receivers are responsible for skipping frames whose `origin` is
    /// their own connection. Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Uuid, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    /// Fully synchronous: tokio broadcast::send + atomic stats.
    pub fn broadcast_raw(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver dropped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Current member count.
    pub fn member_count(&self) -> usize {
        self.members.read().unwrap().len()
    }

    /// All joined connection ids.
    pub fn members(&self) -> Vec<Uuid> {
        self.members.read().unwrap().iter().copied().collect()
    }

    /// Check whether a connection is joined.
    pub fn has_member(&self, conn: &Uuid) -> bool {
        self.members.read().unwrap().contains(conn)
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without joining. The receiver sees every frame but the
    /// connection does not count as a member.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

/// Outcome of an atomic join attempt.
pub enum JoinOutcome {
    /// Admitted: the connection is a member and the receiver is wired
    /// to the session's channel.
    Admitted {
        session: Arc<SessionGroup>,
        rx: broadcast::Receiver<Frame>,
    },
    /// The session already holds the maximum number of members.
    Full,
}

/// Session registry: maps dataset names to session groups.
///
/// Each dataset gets its own group so lock traffic is isolated between
/// datasets. Groups are created on first join and removed once the last
/// member leaves; both transitions are atomic with respect to each
/// other, so a group reachable through the registry is the one new
/// members land in.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionGroup>>>,
    default_capacity: usize,
}

impl SessionRegistry {
    /// Create a new session registry.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the session for a dataset.
    pub fn get_or_create(&self, dataset: &str) -> Arc<SessionGroup> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().unwrap();
            if let Some(session) = sessions.get(dataset) {
                return session.clone();
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().unwrap();
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(dataset) {
            return session.clone();
        }

        let session = Arc::new(SessionGroup::new(self.default_capacity));
        sessions.insert(dataset.to_string(), session.clone());
        session
    }

    /// Look up an existing session.
    pub fn get(&self, dataset: &str) -> Option<Arc<SessionGroup>> {
        self.sessions.read().unwrap().get(dataset).cloned()
    }

    /// Admit a connection to a dataset's session, creating the session
    /// on first join.
    ///
    /// Lookup, capacity check and membership insert all happen under the
    /// registry lock: a join can never land in a group a concurrent
    /// `leave` is pruning, and two joins racing for the last slot below
    /// `max_members` cannot both get in.
    pub fn join(&self, dataset: &str, conn: Uuid, max_members: usize) -> JoinOutcome {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get(dataset).cloned() {
            if session.member_count() >= max_members {
                return JoinOutcome::Full;
            }
            let rx = session.add_member(conn);
            return JoinOutcome::Admitted { session, rx };
        }
        if max_members == 0 {
            return JoinOutcome::Full;
        }
        let session = Arc::new(SessionGroup::new(self.default_capacity));
        let rx = session.add_member(conn);
        sessions.insert(dataset.to_string(), session.clone());
        JoinOutcome::Admitted { session, rx }
    }

    /// Remove a connection from a dataset's session, pruning the session
    /// once its last member leaves.
    ///
    /// The removal and the emptiness check hold the registry lock,
    /// mirroring `join`. Returns whether the connection was a member.
    pub fn leave(&self, dataset: &str, conn: &Uuid) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        let Some(session) = sessions.get(dataset).cloned() else {
            return false;
        };
        let removed = session.remove_member(conn);
        if session.member_count() == 0 {
            sessions.remove(dataset);
        }
        removed
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Names of all datasets with an active session.
    pub fn active_datasets(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }
}
