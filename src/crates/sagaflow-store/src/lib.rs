//! # sagaflow-store - Durable Persistence for Flow Execution
//!
//! **Trait-based flow store abstractions and an in-memory implementation**
//! for persisting and restoring flow execution state. This crate is the
//! single substrate shared by the linear saga engine and the DSL flow
//! engine: CAS-versioned snapshots, cooperative leader-lease claims,
//! heartbeats, wait-condition rows for fan-out coordination, and durable
//! ForEach iteration state.
//!
//! ## Core Concepts
//!
//! ### 1. FlowStore Trait
//!
//! The [`FlowStore`] trait defines the persistence contract. Implementors
//! provide:
//!
//! - **`create()` / `get()` / `update()`** - CAS-versioned snapshot rows
//! - **`try_claim()` / `heartbeat()`** - cooperative leader election over
//!   abandoned flows
//! - **wait-condition ops** - the durable fan-out/fan-in handshake
//! - **foreach-progress ops** - resumable loop iteration state
//!
//! ### 2. Single-owner execution
//!
//! A snapshot is owned by at most one node at a time. Ownership transfers
//! only via atomic claim; every mutation goes through version CAS, so late
//! writes from a former owner are rejected. A failed heartbeat means the
//! lease is lost and the executor must stop without further writes.
//!
//! ### 3. Implementation strategy
//!
//! This crate ships [`MemoryFlowStore`] as the reference implementation.
//! For production, implement [`FlowStore`] over a transactional K/V store
//! or a streaming log; the contract each backend must satisfy is spelled
//! out on the trait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sagaflow_store::{FlowSnapshot, FlowStatus, FlowStore, MemoryFlowStore};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> sagaflow_store::Result<()> {
//!     let store = MemoryFlowStore::new();
//!
//!     let mut snapshot = FlowSnapshot::new("order-1", "order-flow", json!({"total": 10}))
//!         .with_status(FlowStatus::Running)
//!         .with_owner("node-a");
//!     store.create(&snapshot).await?;
//!
//!     // Heartbeat while driving the flow
//!     store.heartbeat("order-1", "node-a", snapshot.version).await?;
//!
//!     // Another node can only take over once the heartbeat goes stale
//!     let stolen = store
//!         .try_claim("order-flow", "node-b", Duration::from_secs(30))
//!         .await?;
//!     assert!(stolen.is_none());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`snapshot`] - [`FlowSnapshot`], [`FlowStatus`]
//! - [`position`] - [`FlowPosition`] tree-indexed program counter
//! - [`wait`] - [`WaitCondition`], [`WaitKind`], [`ChildResult`]
//! - [`progress`] - [`ForEachProgress`]
//! - [`traits`] - [`FlowStore`] contract
//! - [`memory`] - [`MemoryFlowStore`] reference implementation
//! - [`serializer`] - [`FlowSerializer`] protocol with JSON and bincode impls
//! - [`error`] - [`StoreError`]

pub mod error;
pub mod memory;
pub mod position;
pub mod progress;
pub mod serializer;
pub mod snapshot;
pub mod traits;
pub mod wait;

// Re-export main types
pub use error::{Result, StoreError};
pub use memory::MemoryFlowStore;
pub use position::FlowPosition;
pub use progress::ForEachProgress;
pub use serializer::{BincodeSerializer, FlowSerializer, JsonSerializer};
pub use snapshot::{unix_millis_now, FlowSnapshot, FlowStatus};
pub use traits::FlowStore;
pub use wait::{ChildResult, WaitCondition, WaitKind};
