//! Typed flow state
//!
//! Every flow program interprets steps against a typed state object. The
//! state must serialize cleanly because it is persisted on the snapshot at
//! every step boundary and restored on resume, possibly on another node.
//!
//! The change-mask methods support delta-persistence optimizations: a
//! backend may persist only the fields whose bits are set instead of the
//! whole blob. The defaults report everything as changed, which makes
//! "persist the whole state on every boundary" the baseline behavior -
//! correct, just not minimal.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// State carried by a flow across steps, suspensions and node hops
///
/// Implement this for your state struct; the default change-mask behavior
/// is usually all you need:
///
/// ```rust
/// use sagaflow_core::FlowState;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct OrderState {
///     order_id: String,
///     payment_id: Option<String>,
/// }
///
/// impl FlowState for OrderState {}
/// ```
pub trait FlowState: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Bitmap of changed fields since the last [`clear_changes`](Self::clear_changes)
    fn changed_mask(&self) -> u64 {
        u64::MAX
    }

    /// Record a mutation of the given field
    fn mark_changed(&mut self, _field: u32) {}

    /// Whether the given field changed since the last clear
    fn is_field_changed(&self, _field: u32) -> bool {
        true
    }

    /// Reset the change bitmap after persistence
    fn clear_changes(&mut self) {}

    /// Record a failed loop item under the CollectErrors policy
    ///
    /// The engine calls this, serialized with the other state hooks, for
    /// every failed item of a ForEach step running with
    /// [`FailurePolicy::CollectErrors`](crate::FailurePolicy::CollectErrors).
    /// The default keeps nothing; override it to make the error list part
    /// of the durable state. The `serde_json::Value` implementation
    /// appends to an `item_errors` array.
    fn record_item_error(&mut self, _index: usize, _error: &str) {}
}

impl FlowState for serde_json::Value {
    fn record_item_error(&mut self, index: usize, error: &str) {
        if let Some(map) = self.as_object_mut() {
            let list = map
                .entry("item_errors")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(list) = list.as_array_mut() {
                list.push(serde_json::json!({"index": index, "error": error}));
            }
        }
    }
}
