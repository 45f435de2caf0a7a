//! Persistence layer.
//!
//! Defines the `Persistence` contract the pipeline writes through and two
//! implementations:
//! - `sqlite::SqliteStore` for production (sqlx over SQLite)
//! - `MemoryStore` for dry runs and tests
//!
//! Opportunities use full-replace semantics: the live set is archived,
//! then cleared, then rewritten. If the archive step fails the live set
//! must be left exactly as it was.

pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::types::{
    HoldingPosition, Item, ItemId, Opportunity, PositionStatus, PurchasePlan, Snapshot,
    VerificationResult,
};

/// Storage contract consumed by every stage.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Every item the pipeline may evaluate.
    async fn load_catalog(&self) -> Result<Vec<Item>>;

    /// Snapshots for one item taken at or after `since`, newest first.
    async fn load_snapshots(&self, item_id: ItemId, since: DateTime<Utc>) -> Result<Vec<Snapshot>>;

    /// Archive the live opportunity set, then replace it with `set`.
    async fn save_opportunities(&self, set: &[Opportunity]) -> Result<()>;

    /// Record a plan (status `pending`) with its verification outcomes.
    async fn save_plan(&self, plan: &PurchasePlan, verification: &[VerificationResult]) -> Result<i64>;

    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<HoldingPosition>>;

    /// Insert (id 0) or update a position; returns its id.
    async fn save_position(&self, position: &HoldingPosition) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// A saved plan and the verification it went through.
#[derive(Debug, Clone)]
pub struct StoredPlan {
    pub id: i64,
    pub plan: PurchasePlan,
    pub verification: Vec<VerificationResult>,
}

#[derive(Debug, Default)]
struct MemoryState {
    catalog: Vec<Item>,
    snapshots: HashMap<ItemId, Vec<Snapshot>>,
    opportunities: Vec<Opportunity>,
    archive: Vec<(DateTime<Utc>, Vec<Opportunity>)>,
    plans: Vec<StoredPlan>,
    positions: Vec<HoldingPosition>,
}

/// Process-local store. State is lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_archive: AtomicBool,
}

fn lock(m: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: Item) {
        lock(&self.state).catalog.push(item);
    }

    pub fn add_snapshot(&self, snapshot: Snapshot) {
        lock(&self.state)
            .snapshots
            .entry(snapshot.item_id)
            .or_default()
            .push(snapshot);
    }

    /// Make the next archive step fail (exercises the no-truncate guarantee).
    pub fn set_fail_archive(&self, fail: bool) {
        self.fail_archive.store(fail, Ordering::SeqCst);
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        lock(&self.state).opportunities.clone()
    }

    /// Number of archived generations.
    pub fn archive_len(&self) -> usize {
        lock(&self.state).archive.len()
    }

    pub fn plans(&self) -> Vec<StoredPlan> {
        lock(&self.state).plans.clone()
    }

    pub fn positions(&self) -> Vec<HoldingPosition> {
        lock(&self.state).positions.clone()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_catalog(&self) -> Result<Vec<Item>> {
        Ok(lock(&self.state).catalog.clone())
    }

    async fn load_snapshots(&self, item_id: ItemId, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let state = lock(&self.state);
        let mut snaps: Vec<Snapshot> = state
            .snapshots
            .get(&item_id)
            .map(|v| v.iter().filter(|s| s.taken_at >= since).cloned().collect())
            .unwrap_or_default();
        snaps.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(snaps)
    }

    async fn save_opportunities(&self, set: &[Opportunity]) -> Result<()> {
        if self.fail_archive.load(Ordering::SeqCst) {
            bail!("Failed to archive opportunities");
        }
        let mut state = lock(&self.state);
        let previous = std::mem::take(&mut state.opportunities);
        state.archive.push((Utc::now(), previous));
        state.opportunities = set.to_vec();
        debug!(count = set.len(), "Opportunities replaced (memory)");
        Ok(())
    }

    async fn save_plan(&self, plan: &PurchasePlan, verification: &[VerificationResult]) -> Result<i64> {
        let mut state = lock(&self.state);
        let id = state.plans.len() as i64 + 1;
        state.plans.push(StoredPlan {
            id,
            plan: plan.clone(),
            verification: verification.to_vec(),
        });
        Ok(id)
    }

    async fn load_positions(&self, statuses: &[PositionStatus]) -> Result<Vec<HoldingPosition>> {
        Ok(lock(&self.state)
            .positions
            .iter()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect())
    }

    async fn save_position(&self, position: &HoldingPosition) -> Result<i64> {
        let mut state = lock(&self.state);
        if position.id == 0 {
            let id = state.positions.iter().map(|p| p.id).max().unwrap_or(0) + 1;
            let mut stored = position.clone();
            stored.id = id;
            state.positions.push(stored);
            return Ok(id);
        }
        match state.positions.iter_mut().find(|p| p.id == position.id) {
            Some(existing) => *existing = position.clone(),
            None => state.positions.push(position.clone()),
        }
        Ok(position.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
