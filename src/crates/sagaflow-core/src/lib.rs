//! # sagaflow-core - Declarative Flow Engine
//!
//! The DSL half of sagaflow: a typed, declaratively-built program tree -
//! sequential dispatches, conditional branches, batched loops, distributed
//! fan-out - interpreted by a durable executor over the
//! [`sagaflow-store`](sagaflow_store) substrate.
//!
//! ## Core Concepts
//!
//! ### 1. Programs
//!
//! A [`Program`] is an immutable tree of [`Step`]s built once through
//! [`Program::build`] and shared by every flow instance of its type:
//!
//! ```rust
//! use sagaflow_core::{Message, Program};
//! use serde_json::{json, Value};
//!
//! let program = Program::<Value>::build("greeter", |flow| {
//!     flow.send("hello", |_| Message::new("greeting.send", json!({"to": "world"})))
//! }).unwrap();
//! ```
//!
//! ### 2. Durable interpretation
//!
//! The [`FlowExecutor`] claims a flow, heartbeats while driving it, and
//! persists a CAS-versioned snapshot at every step boundary. A crashed
//! node's flows are claimed by a peer once their heartbeat goes stale, and
//! interpretation resumes exactly at the stored position - branch
//! predicates are never re-evaluated on resume.
//!
//! ### 3. Fan-out and fan-in
//!
//! `WhenAll`/`WhenAny` steps spawn child flows and suspend the parent on a
//! durable wait condition; the [`WaitCoordinator`] consumes child
//! completion events, resumes the parent when the predicate holds, and
//! fails it when the wait times out. There is no in-memory future parked
//! anywhere - the condition row is the rendezvous.
//!
//! ### 4. Compensation scopes
//!
//! [`FlowContext`] wraps handler calls with a LIFO compensation stack:
//! commit on success, automatic reverse-order rollback on every other exit
//! path.
//!
//! ## Module Organization
//!
//! - [`program`] / [`builder`] - step tree and fluent construction
//! - [`executor`] - the interpretation loop, leases, resume
//! - [`foreach`] - batch/parallelism mechanics for loops
//! - [`wait`] - the fan-out coordinator
//! - [`worker`] - host-side claim scavenger and sweep loop
//! - [`context`] - scoped compensation
//! - [`mediator`] - outbound dispatch port + recording test double
//! - [`message`] / [`events`] - envelopes, ids, completion events
//! - [`state`] - the typed-state trait
//! - [`cancel`] / [`retry`] / [`error`] - ambient machinery

pub mod builder;
pub mod cancel;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod foreach;
pub mod mediator;
pub mod message;
pub mod program;
pub mod retry;
pub mod state;
pub mod wait;
pub mod worker;

// Re-export main types
pub use builder::{FlowBuilder, ForEachBuilder, IfChain, SwitchBuilder, WhenAllBuilder, WhenAnyBuilder};
pub use cancel::CancelToken;
pub use context::{run_flow, CompensationAction, FlowContext};
pub use error::{FlowError, Result};
pub use events::{FlowCompletedEvent, FLOW_COMPLETED_EVENT};
pub use executor::{ExecutorConfig, FlowExecutor, FlowOutcome};
pub use mediator::{DispatchResult, Mediator, QueryResult, RecordingMediator};
pub use message::{FlowRouting, Message, MessageIdGenerator, CANCEL_FLOW_MESSAGE};
pub use program::{DelaySpec, FailurePolicy, Program, Step};
pub use retry::RetryPolicy;
pub use state::FlowState;
pub use wait::WaitCoordinator;
pub use worker::FlowWorker;

// Re-export the storage substrate types callers touch directly
pub use sagaflow_store::{
    FlowPosition, FlowSnapshot, FlowStatus, FlowStore, ForEachProgress, MemoryFlowStore,
    WaitCondition, WaitKind,
};
