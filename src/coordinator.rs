//! Lock coordinator: grant/revoke decisions plus their announcements.
//!
//! One coordinator owns the field-lock table for the whole process. Each
//! operation runs as a single critical section — take the table mutex,
//! mutate, fan out the resulting events, release — with no awaits while
//! the mutex is held (session lookups and channel sends are synchronous).
//! Two racing requests therefore serialize cleanly: first processed wins,
//! and peers never observe a grant and its revoke out of order.
//!
//! ```text
//! Lock { cell } from conn
//!       │
//!       ▼
//! LockCoordinator::acquire()              (one critical section)
//!       │  FieldLockTable::try_acquire
//!       │    ├─ Granted     → reply + Unlocked(prior) + Locked(cell)
//!       │    ├─ AlreadyHeld → reply only
//!       │    └─ Occupied    → reply + Unlocked(prior)
//!       ▼
//! SessionGroup::broadcast_raw             (sync fan-out to N-1)
//! ```
//!
//! Reference: Kleppmann, Chapter 9 — Linearizability

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::SessionRegistry;
use crate::lock_table::{AcquireOutcome, FieldLockTable, ReleaseOutcome};
use crate::protocol::{CellRef, LockSnapshot, ServerMessage};

/// Outcome of an acquire, as answered to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct LockGrant {
    pub granted: bool,
    /// The different cell the requester previously held, released as a
    /// side effect of this request.
    pub revoked: Option<CellRef>,
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default)]
pub struct LockStats {
    pub granted: u64,
    pub denied: u64,
    pub revoked: u64,
    pub released: u64,
    pub force_released: u64,
    pub spurious_releases: u64,
}

struct AtomicLockStats {
    granted: AtomicU64,
    denied: AtomicU64,
    revoked: AtomicU64,
    released: AtomicU64,
    force_released: AtomicU64,
    spurious_releases: AtomicU64,
}

impl AtomicLockStats {
    fn new() -> Self {
        Self {
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            revoked: AtomicU64::new(0),
            released: AtomicU64::new(0),
            force_released: AtomicU64::new(0),
            spurious_releases: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> LockStats {
        LockStats {
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            revoked: self.revoked.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            force_released: self.force_released.load(Ordering::Relaxed),
            spurious_releases: self.spurious_releases.load(Ordering::Relaxed),
        }
    }
}

/// The lock coordinator.
///
/// Constructed per server instance and handed around as `Arc`; never a
/// process-wide singleton, so tests can run several side by side.
pub struct LockCoordinator {
    table: Mutex<FieldLockTable>,
    registry: Arc<SessionRegistry>,
    stats: AtomicLockStats,
}

impl LockCoordinator {
    /// Create a coordinator fanning out through the given registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            table: Mutex::new(FieldLockTable::new()),
            registry,
            stats: AtomicLockStats::new(),
        }
    }

    /// Request the lock on `cell` for connection `conn`.
    ///
    /// Grants if the cell is free, releasing the requester's prior cell
    /// first. A denied request still releases the prior cell. Broadcasts
    /// go out before the table mutex drops, so the revoke always reaches
    /// peers no later than the grant.
    pub async fn acquire(&self, conn: Uuid, cell: &CellRef) -> LockGrant {
        let mut table = self.table.lock().await;
        match table.try_acquire(cell, conn) {
            AcquireOutcome::Granted { revoked } => {
                if let Some(ref prior) = revoked {
                    self.announce_unlocked(conn, prior);
                    self.stats.revoked.fetch_add(1, Ordering::Relaxed);
                }
                self.announce_locked(conn, cell);
                self.stats.granted.fetch_add(1, Ordering::Relaxed);
                log::debug!("Lock granted: {cell} -> {conn}");
                LockGrant {
                    granted: true,
                    revoked,
                }
            }
            AcquireOutcome::AlreadyHeld => {
                log::debug!("Lock re-request for {cell} by {conn} (already held)");
                LockGrant {
                    granted: true,
                    revoked: None,
                }
            }
            AcquireOutcome::Occupied { holder, revoked } => {
                if let Some(ref prior) = revoked {
                    self.announce_unlocked(conn, prior);
                    self.stats.revoked.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.denied.fetch_add(1, Ordering::Relaxed);
                log::debug!("Lock denied: {cell} held by {holder}, requested by {conn}");
                LockGrant {
                    granted: false,
                    revoked,
                }
            }
        }
    }

    /// Release `cell` on behalf of `conn`. Returns whether the release
    /// counts as successful from the caller's point of view.
    pub async fn release(&self, conn: Uuid, cell: &CellRef, committed: bool) -> bool {
        let mut table = self.table.lock().await;
        match table.release(cell, conn, committed) {
            ReleaseOutcome::Released => {
                self.announce_unlocked(conn, cell);
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                log::debug!("Lock released: {cell} by {conn}");
                true
            }
            ReleaseOutcome::AlreadyGone => {
                // Auto-revoked earlier; the unlock already went out with
                // the revoke.
                true
            }
            ReleaseOutcome::NotHeld => {
                log::warn!("Spurious release of unheld cell {cell} by {conn}");
                self.stats.spurious_releases.fetch_add(1, Ordering::Relaxed);
                false
            }
            ReleaseOutcome::HeldByOther(holder) => {
                log::warn!("Spurious release of {cell} by {conn}: held by {holder}");
                self.stats.spurious_releases.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Release whatever `conn` holds. The only cleanup path for a
    /// vanished connection; safe to call repeatedly.
    pub async fn release_all(&self, conn: Uuid) -> Option<CellRef> {
        let mut table = self.table.lock().await;
        let cell = table.release_all(conn)?;
        self.announce_unlocked(conn, &cell);
        self.stats.force_released.fetch_add(1, Ordering::Relaxed);
        log::info!("Released {cell} held by departed connection {conn}");
        Some(cell)
    }

    /// Snapshot of one dataset's active locks. No side effects.
    pub async fn active_locks(&self, dataset: &str) -> LockSnapshot {
        self.table.lock().await.snapshot(dataset)
    }

    /// Number of locked cells across all datasets.
    pub async fn locked_count(&self) -> usize {
        self.table.lock().await.locked_count()
    }

    /// Coordinator statistics snapshot.
    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    /// Tear down: drop every lock without broadcasting.
    ///
    /// Used when the owning server shuts down — the sessions are going
    /// away with it, so there is nobody left to notify.
    pub async fn shutdown(&self) {
        let mut table = self.table.lock().await;
        let dropped = table.locked_count();
        table.clear();
        if dropped > 0 {
            log::info!("Lock coordinator shut down, {dropped} active locks cleared");
        }
    }

    fn announce_locked(&self, origin: Uuid, cell: &CellRef) {
        self.send_to_session(
            origin,
            &cell.dataset,
            &ServerMessage::Locked { cell: cell.clone() },
        );
    }

    fn announce_unlocked(&self, origin: Uuid, cell: &CellRef) {
        self.send_to_session(
            origin,
            &cell.dataset,
            &ServerMessage::Unlocked { cell: cell.clone() },
        );
    }

    fn send_to_session(&self, origin: Uuid, dataset: &str, msg: &ServerMessage) {
        // No session means no peers to tell — the lock still stands.
        if let Some(session) = self.registry.get(dataset) {
            match msg.encode() {
                Ok(bytes) => {
                    session.broadcast_raw(origin, Arc::new(bytes));
                }
                Err(e) => log::error!("Failed to encode lock broadcast: {e}"),
            }
        }
    }
}
