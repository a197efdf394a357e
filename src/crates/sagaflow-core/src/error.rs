//! Error types and error handling for flow execution
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── Store           - Persistence errors (transient transport included)
//! ├── Mediator        - Transport-level dispatch errors
//! ├── StepFailed      - A step handler reported failure
//! ├── LeaseLost       - A CAS/heartbeat race revealed a lost ownership lease
//! ├── NoCondition     - If step with no condition configured
//! ├── MissingDefault  - Switch with no matching case and no default branch
//! ├── WaitTimeout     - A fan-out wait expired
//! ├── Cancelled       - Cooperative cancellation
//! ├── Serialization   - State (de)serialization errors
//! ├── Configuration   - Invalid executor/builder configuration
//! ├── NotFound        - Re-entry for an unknown flow id
//! └── Custom          - Application-defined errors
//! ```
//!
//! Two variants deserve special handling by callers:
//!
//! - [`FlowError::Store`] wrapping [`StoreError::Storage`] and
//!   [`FlowError::Mediator`] are **transient**: nothing was mutated, retry
//!   with backoff or release the lease and let another node claim.
//! - [`FlowError::LeaseLost`] is **not a business failure**: the executor
//!   aborted without further writes because another node took over.

use sagaflow_store::StoreError;
use thiserror::Error;

/// Convenience result type using [`FlowError`]
pub type Result<T> = std::result::Result<T, FlowError>;

/// Comprehensive error type for flow execution
#[derive(Error, Debug)]
pub enum FlowError {
    /// Persistence error from the flow store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Transport-level mediator error (timeout, broker unavailable)
    #[error("Mediator error: {0}")]
    Mediator(String),

    /// A step handler reported failure
    #[error("Step '{step}' failed: {error}")]
    StepFailed {
        /// Position string of the failing step
        step: String,
        /// Error message from the handler
        error: String,
    },

    /// The ownership lease was lost mid-run; execution aborted without writes
    #[error("Ownership lease lost")]
    LeaseLost,

    /// An If step was built without a condition
    #[error("Step '{step}' has no condition")]
    NoCondition {
        /// Position string of the If step
        step: String,
    },

    /// A Switch selector produced no matching case and no default exists
    #[error("Step '{step}' has no matching case and no default branch")]
    MissingDefault {
        /// Position string of the Switch step
        step: String,
    },

    /// A fan-out wait expired before its predicate held
    #[error("WaitTimeout")]
    WaitTimeout,

    /// Execution was cooperatively cancelled
    #[error("Flow cancelled")]
    Cancelled,

    /// State serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid executor or program configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Re-entry for a flow id that does not exist
    #[error("Flow not found: {0}")]
    NotFound(String),

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl FlowError {
    /// Create a step failure with position context
    pub fn step_failed(step: impl Into<String>, error: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            error: error.into(),
        }
    }

    /// Whether this error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Mediator(_) | Self::Store(StoreError::Storage(_))
        )
    }
}
