//! Extensible flow store trait for custom backend implementations
//!
//! This module defines the **[`FlowStore`]** trait - the core abstraction for
//! implementing durable flow persistence backends. The trait enables
//! downstream projects to run sagaflow over any storage system with
//! transactional or CAS primitives (PostgreSQL, Redis, NATS JetStream, a
//! transactional K/V store) while preserving the engine's single-owner
//! execution guarantees.
//!
//! # Overview
//!
//! The store is the single persistent substrate shared by both execution
//! models. It holds three row families:
//!
//! - **Snapshots** - one CAS-versioned row per flow instance
//! - **Wait conditions** - the fan-out handshake between a suspended parent
//!   and its children, keyed by correlation id
//! - **ForEach progress** - iteration state per `(flow_id, step)`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  sagaflow-core / sagaflow-saga                               │
//! │  ┌────────────────────────────────────────────────┐         │
//! │  │  Executor                                      │         │
//! │  │  • create / try_claim on entry                 │         │
//! │  │  • update (CAS) at every step boundary         │         │
//! │  │  • heartbeat on a timer while owning           │         │
//! │  └────────────┬───────────────────────────────────┘         │
//! └───────────────┼──────────────────────────────────────────────┘
//!                 │ FlowStore trait
//!                 ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Storage Backend (Your Implementation)                       │
//! │  • MemoryFlowStore (this crate - tests, single process)      │
//! │  • Transactional K/V (production)                            │
//! │  • Streaming log with compaction (production)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Contract
//!
//! Every implementation MUST satisfy the following, verbatim:
//!
//! - **`create`** inserts iff no row with that `flow_id` exists, forcing the
//!   stored `version` to 0. Returns `false` (not an error) when the row
//!   already exists - racing creators converge on `get`.
//! - **`update`** is a compare-and-swap on `version`. On success the stored
//!   version becomes `snapshot.version + 1` and the caller's snapshot is
//!   updated to match. On failure neither side changes.
//! - **`try_claim`** selects at most one non-terminal row of the given type
//!   whose owner is absent or whose heartbeat is older than the claim
//!   timeout, and atomically installs the new owner. Under concurrent
//!   callers each qualifying row is handed to at most one of them.
//! - **`heartbeat`** refreshes `heartbeat_at` iff the caller still owns the
//!   row at the version it last observed; a `false` return means the lease
//!   is lost and the caller must stop mutating.
//! - **Wait-condition updates** must not interleave: serialize them per
//!   correlation id (a fine-grained lock or a transaction).
//! - **Query operations** may be approximate under eventually-consistent
//!   backends but must never cause the claim path to select a terminal row.
//! - Any operation may fail with a transient [`StoreError::Storage`];
//!   callers treat that like a failed CAS (no mutation happened).
//!
//! # Example: custom backend skeleton
//!
//! ```rust,ignore
//! use sagaflow_store::{FlowStore, FlowSnapshot, Result, StoreError};
//! use async_trait::async_trait;
//!
//! struct PostgresFlowStore {
//!     pool: sqlx::PgPool,
//! }
//!
//! #[async_trait]
//! impl FlowStore for PostgresFlowStore {
//!     async fn update(&self, snapshot: &mut FlowSnapshot) -> Result<bool> {
//!         let rows = sqlx::query(
//!             "UPDATE flows SET body = $1, version = version + 1, updated_at = now()
//!              WHERE flow_id = $2 AND version = $3",
//!         )
//!         .bind(serde_json::to_value(&*snapshot)?)
//!         .bind(&snapshot.flow_id)
//!         .bind(snapshot.version as i64)
//!         .execute(&self.pool)
//!         .await
//!         .map_err(|e| StoreError::Storage(e.to_string()))?
//!         .rows_affected();
//!
//!         if rows == 1 {
//!             snapshot.version += 1;
//!             Ok(true)
//!         } else {
//!             Ok(false)
//!         }
//!     }
//!
//!     // ... remaining methods follow the same CAS discipline ...
//! #   async fn create(&self, _: &FlowSnapshot) -> Result<bool> { unimplemented!() }
//! }
//! ```
//!
//! # Thread safety
//!
//! Implementations must be `Send + Sync`; a single store instance is shared
//! by every executor task on the node.

use crate::error::Result;
use crate::progress::ForEachProgress;
use crate::snapshot::{FlowSnapshot, FlowStatus};
use crate::wait::WaitCondition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Core trait for durable flow persistence backends
///
/// See the module documentation for the full contract. The in-memory
/// reference implementation lives in [`MemoryFlowStore`](crate::MemoryFlowStore).
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert a snapshot iff no row with its `flow_id` exists
    ///
    /// The stored version is forced to 0 regardless of the input. Returns
    /// `true` on insert, `false` when a row already exists (the caller
    /// should re-read and continue - this is the create race converging).
    async fn create(&self, snapshot: &FlowSnapshot) -> Result<bool>;

    /// Fetch the current snapshot row, or `None`
    ///
    /// Implementations may return a defensive copy; callers treat the
    /// result as read-only until they win a CAS on it.
    async fn get(&self, flow_id: &str) -> Result<Option<FlowSnapshot>>;

    /// Compare-and-swap update on the snapshot's version
    ///
    /// Succeeds iff the stored version equals `snapshot.version`. On
    /// success the stored row and the caller's snapshot both move to
    /// `version + 1` and `updated_at` is refreshed. On failure nothing
    /// changes on either side.
    async fn update(&self, snapshot: &mut FlowSnapshot) -> Result<bool>;

    /// Atomically claim one abandoned or unowned flow of the given type
    ///
    /// A row qualifies when its status is non-terminal AND it has no owner
    /// or its `heartbeat_at` is older than `now - claim_timeout`. The
    /// winning caller receives the updated snapshot (owner set, heartbeat
    /// refreshed, version bumped); `None` means nothing qualified.
    async fn try_claim(
        &self,
        flow_type: &str,
        node_id: &str,
        claim_timeout: Duration,
    ) -> Result<Option<FlowSnapshot>>;

    /// Refresh the owner's heartbeat iff ownership and version still match
    ///
    /// Returns `false` when the row is gone, owned by someone else, or the
    /// version moved - in every case the caller has lost the lease and must
    /// abort without further writes.
    async fn heartbeat(&self, flow_id: &str, node_id: &str, known_version: u64) -> Result<bool>;

    // --- wait conditions -------------------------------------------------

    /// Store a new wait condition (overwrites any stale row with the key)
    async fn put_wait_condition(&self, condition: &WaitCondition) -> Result<()>;

    /// Fetch a wait condition by correlation id
    async fn wait_condition(&self, correlation_id: &str) -> Result<Option<WaitCondition>>;

    /// Replace an existing wait condition
    ///
    /// Updates for the same correlation id must not interleave.
    async fn update_wait_condition(&self, condition: &WaitCondition) -> Result<()>;

    /// Delete a wait condition; deleting a missing row is not an error
    async fn clear_wait_condition(&self, correlation_id: &str) -> Result<()>;

    /// All conditions that are past their timeout and not yet satisfied
    async fn timed_out_wait_conditions(&self, now: DateTime<Utc>) -> Result<Vec<WaitCondition>>;

    // --- foreach progress ------------------------------------------------

    /// Upsert the iteration state for `(flow_id, step)`
    ///
    /// No CAS is required: only the single owner of the parent flow writes
    /// this row, and cross-node safety comes from the parent's claim lease.
    async fn save_progress(&self, progress: &ForEachProgress) -> Result<()>;

    /// Fetch the iteration state for `(flow_id, step)`, or `None`
    async fn progress(&self, flow_id: &str, step: &str) -> Result<Option<ForEachProgress>>;

    /// Delete the iteration state for `(flow_id, step)`
    async fn clear_progress(&self, flow_id: &str, step: &str) -> Result<()>;

    // --- secondary queries -----------------------------------------------

    /// Snapshots currently in the given status (may be approximate)
    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<FlowSnapshot>>;

    /// Snapshots of the given flow type (may be approximate)
    async fn list_by_type(&self, flow_type: &str) -> Result<Vec<FlowSnapshot>>;

    /// Snapshots created within `[from, to)` (may be approximate)
    async fn list_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowSnapshot>>;
}
