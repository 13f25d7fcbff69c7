//! In-memory field-lock table with a per-holder index.
//!
//! Three-level map — dataset → document → field → holder — where the
//! presence of an entry means the cell is locked. Two invariants hold at
//! every instant:
//!
//! - a cell has at most one holder;
//! - a holder owns at most one cell, tracked in a reverse index so that
//!   disconnect cleanup is a single lookup instead of a table scan.
//!
//! Requesting a new cell supersedes whatever the holder owned before:
//! the prior cell is released first and reported back so the caller can
//! announce it. The table is pure synchronous state; the coordinator
//! wraps it in a mutex and attaches broadcasts.
//!
//! Reference: Kleppmann, Chapter 8 — The Leader and the Lock

use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::{CellRef, LockSnapshot};

/// Result of a lock request against the table.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// The cell was free and now belongs to the requester. `revoked` is
    /// the different cell the requester held before, if any.
    Granted { revoked: Option<CellRef> },
    /// The requester already holds this exact cell — idempotent no-op.
    AlreadyHeld,
    /// The cell belongs to someone else. The requester's prior cell is
    /// still released: the new request supersedes it either way.
    Occupied {
        holder: Uuid,
        revoked: Option<CellRef>,
    },
}

/// Result of a release request against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Entry removed; the cell is free again.
    Released,
    /// Nothing in the table, but the edit committed — the lock was
    /// auto-revoked by a later acquire and its release already announced.
    AlreadyGone,
    /// Cell absent and the edit never saved: caller-side bug.
    NotHeld,
    /// Cell present but owned by a different connection.
    HeldByOther(Uuid),
}

/// The field-lock table.
#[derive(Debug, Default)]
pub struct FieldLockTable {
    /// dataset → document → field → holder
    cells: HashMap<String, LockSnapshot>,
    /// holder → the single cell it currently owns
    owned: HashMap<Uuid, CellRef>,
}

impl FieldLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the lock on `cell` for `holder`.
    pub fn try_acquire(&mut self, cell: &CellRef, holder: Uuid) -> AcquireOutcome {
        if let Some(current) = self.holder_of(cell) {
            if current == holder {
                return AcquireOutcome::AlreadyHeld;
            }
            // Denied, but the request still supersedes whatever the
            // requester held before.
            let revoked = self.revoke_prior(holder);
            return AcquireOutcome::Occupied {
                holder: current,
                revoked,
            };
        }

        let revoked = self.revoke_prior(holder);
        self.cells
            .entry(cell.dataset.clone())
            .or_default()
            .entry(cell.document.clone())
            .or_default()
            .insert(cell.field.clone(), holder);
        self.owned.insert(holder, cell.clone());
        AcquireOutcome::Granted { revoked }
    }

    /// Release `cell` on behalf of `holder`.
    ///
    /// `committed` marks whether the edit saved; it turns a release of a
    /// cell that was auto-revoked earlier into a success instead of a
    /// spurious call.
    pub fn release(&mut self, cell: &CellRef, holder: Uuid, committed: bool) -> ReleaseOutcome {
        match self.holder_of(cell) {
            Some(current) if current == holder => {
                self.remove_entry(cell);
                self.owned.remove(&holder);
                ReleaseOutcome::Released
            }
            Some(other) => ReleaseOutcome::HeldByOther(other),
            None if committed => ReleaseOutcome::AlreadyGone,
            None => ReleaseOutcome::NotHeld,
        }
    }

    /// Release whatever `holder` owns. Disconnect path; idempotent.
    pub fn release_all(&mut self, holder: Uuid) -> Option<CellRef> {
        let cell = self.owned.remove(&holder)?;
        self.remove_entry(&cell);
        Some(cell)
    }

    /// Read-only snapshot of one dataset's locks (empty if none).
    pub fn snapshot(&self, dataset: &str) -> LockSnapshot {
        self.cells.get(dataset).cloned().unwrap_or_default()
    }

    /// Current holder of a cell, if locked.
    pub fn holder_of(&self, cell: &CellRef) -> Option<Uuid> {
        self.cells
            .get(&cell.dataset)?
            .get(&cell.document)?
            .get(&cell.field)
            .copied()
    }

    /// Whether a cell is currently locked.
    pub fn is_locked(&self, cell: &CellRef) -> bool {
        self.holder_of(cell).is_some()
    }

    /// Number of locked cells across all datasets.
    pub fn locked_count(&self) -> usize {
        self.owned.len()
    }

    /// Drop every lock.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.owned.clear();
    }

    /// Release the holder's previous cell, if it owns one.
    ///
    /// Callers handle the same-cell case before reaching here, so the
    /// owned entry — when present — always names a different cell.
    fn revoke_prior(&mut self, holder: Uuid) -> Option<CellRef> {
        let prior = self.owned.remove(&holder)?;
        self.remove_entry(&prior);
        Some(prior)
    }

    /// Remove a cell entry, pruning document and dataset levels that
    /// become empty so snapshots stay clean.
    fn remove_entry(&mut self, cell: &CellRef) {
        if let Some(docs) = self.cells.get_mut(&cell.dataset) {
            if let Some(fields) = docs.get_mut(&cell.document) {
                fields.remove(&cell.field);
                if fields.is_empty() {
                    docs.remove(&cell.document);
                }
            }
            if docs.is_empty() {
                self.cells.remove(&cell.dataset);
            }
        }
    }
}
