//! In-memory flow store for development and testing
//!
//! **[`MemoryFlowStore`]** is the reference implementation of the
//! [`FlowStore`] trait. All rows live in process memory behind
//! `tokio::sync::RwLock`-protected maps, which makes every operation
//! trivially atomic: CAS checks and their mutations happen under one write
//! lock, and wait-condition updates cannot interleave because the whole map
//! is exclusively locked for the duration of a write.
//!
//! **Use it for:** unit and integration tests, local development, and
//! single-process deployments where durability across restarts is not
//! needed. **Do not use it for:** multi-node fleets or anything requiring
//! persistence - implement [`FlowStore`] over a real backend instead.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_store::{FlowSnapshot, FlowStatus, FlowStore, MemoryFlowStore};
//! use serde_json::json;
//!
//! # async fn example() -> sagaflow_store::Result<()> {
//! let store = MemoryFlowStore::new();
//!
//! let mut snapshot = FlowSnapshot::new("order-1", "order-flow", json!({"total": 10}));
//! assert!(store.create(&snapshot).await?);
//! assert!(!store.create(&snapshot).await?); // already exists
//!
//! snapshot.status = FlowStatus::Running;
//! assert!(store.update(&mut snapshot).await?);
//! assert_eq!(snapshot.version, 1);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::progress::ForEachProgress;
use crate::snapshot::{unix_millis_now, FlowSnapshot, FlowStatus};
use crate::traits::FlowStore;
use crate::wait::WaitCondition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Thread-safe in-memory flow store
///
/// Cloning is shallow: clones share the same underlying maps, so a store
/// handed to several executor tasks behaves like one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryFlowStore {
    snapshots: Arc<RwLock<HashMap<String, FlowSnapshot>>>,
    conditions: Arc<RwLock<HashMap<String, WaitCondition>>>,
    progress: Arc<RwLock<HashMap<(String, String), ForEachProgress>>>,
}

impl MemoryFlowStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshot rows currently stored
    pub async fn flow_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Number of wait-condition rows currently stored
    pub async fn condition_count(&self) -> usize {
        self.conditions.read().await.len()
    }

    /// Remove every row (useful between tests)
    pub async fn clear(&self) {
        self.snapshots.write().await.clear();
        self.conditions.write().await.clear();
        self.progress.write().await.clear();
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn create(&self, snapshot: &FlowSnapshot) -> Result<bool> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&snapshot.flow_id) {
            return Ok(false);
        }
        let mut row = snapshot.clone();
        row.version = 0;
        snapshots.insert(row.flow_id.clone(), row);
        Ok(true)
    }

    async fn get(&self, flow_id: &str) -> Result<Option<FlowSnapshot>> {
        Ok(self.snapshots.read().await.get(flow_id).cloned())
    }

    async fn update(&self, snapshot: &mut FlowSnapshot) -> Result<bool> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(&snapshot.flow_id) {
            Some(stored) if stored.version == snapshot.version => {
                snapshot.version += 1;
                snapshot.updated_at = Utc::now();
                *stored = snapshot.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_claim(
        &self,
        flow_type: &str,
        node_id: &str,
        claim_timeout: Duration,
    ) -> Result<Option<FlowSnapshot>> {
        let mut snapshots = self.snapshots.write().await;
        let now = unix_millis_now();
        let stale_before = now - claim_timeout.as_millis() as i64;

        for stored in snapshots.values_mut() {
            if stored.flow_type != flow_type || stored.status.is_terminal() {
                continue;
            }
            let abandoned = stored.owner.is_none() || stored.heartbeat_at < stale_before;
            if !abandoned {
                continue;
            }
            stored.owner = Some(node_id.to_string());
            stored.heartbeat_at = now;
            stored.version += 1;
            stored.updated_at = Utc::now();
            return Ok(Some(stored.clone()));
        }
        Ok(None)
    }

    async fn heartbeat(&self, flow_id: &str, node_id: &str, known_version: u64) -> Result<bool> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(flow_id) {
            Some(stored)
                if stored.owner.as_deref() == Some(node_id)
                    && stored.version == known_version =>
            {
                stored.heartbeat_at = unix_millis_now();
                stored.version += 1;
                stored.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put_wait_condition(&self, condition: &WaitCondition) -> Result<()> {
        self.conditions
            .write()
            .await
            .insert(condition.correlation_id.clone(), condition.clone());
        Ok(())
    }

    async fn wait_condition(&self, correlation_id: &str) -> Result<Option<WaitCondition>> {
        Ok(self.conditions.read().await.get(correlation_id).cloned())
    }

    async fn update_wait_condition(&self, condition: &WaitCondition) -> Result<()> {
        self.conditions
            .write()
            .await
            .insert(condition.correlation_id.clone(), condition.clone());
        Ok(())
    }

    async fn clear_wait_condition(&self, correlation_id: &str) -> Result<()> {
        self.conditions.write().await.remove(correlation_id);
        Ok(())
    }

    async fn timed_out_wait_conditions(&self, now: DateTime<Utc>) -> Result<Vec<WaitCondition>> {
        Ok(self
            .conditions
            .read()
            .await
            .values()
            .filter(|c| c.is_timed_out(now))
            .cloned()
            .collect())
    }

    async fn save_progress(&self, progress: &ForEachProgress) -> Result<()> {
        self.progress.write().await.insert(
            (progress.flow_id.clone(), progress.step.clone()),
            progress.clone(),
        );
        Ok(())
    }

    async fn progress(&self, flow_id: &str, step: &str) -> Result<Option<ForEachProgress>> {
        Ok(self
            .progress
            .read()
            .await
            .get(&(flow_id.to_string(), step.to_string()))
            .cloned())
    }

    async fn clear_progress(&self, flow_id: &str, step: &str) -> Result<()> {
        self.progress
            .write()
            .await
            .remove(&(flow_id.to_string(), step.to_string()));
        Ok(())
    }

    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<FlowSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_type(&self, flow_type: &str) -> Result<Vec<FlowSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.flow_type == flow_type)
            .cloned()
            .collect())
    }

    async fn list_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.created_at >= from && s.created_at < to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{ChildResult, WaitKind};
    use serde_json::json;

    fn snapshot(id: &str) -> FlowSnapshot {
        FlowSnapshot::new(id, "demo", json!({}))
    }

    #[tokio::test]
    async fn test_create_is_first_writer_wins() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        s.version = 7; // ignored on insert

        assert!(store.create(&s).await.unwrap());
        assert!(!store.create(&s).await.unwrap());

        let stored = store.get("f-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_update_cas_increments_version_by_one() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        store.create(&s).await.unwrap();

        s.status = FlowStatus::Running;
        assert!(store.update(&mut s).await.unwrap());
        assert_eq!(s.version, 1);
        assert_eq!(store.get("f-1").await.unwrap().unwrap().version, 1);

        assert!(store.update(&mut s).await.unwrap());
        assert_eq!(s.version, 2);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_leaves_both_sides_untouched() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        store.create(&s).await.unwrap();

        let mut fresh = store.get("f-1").await.unwrap().unwrap();
        fresh.status = FlowStatus::Running;
        assert!(store.update(&mut fresh).await.unwrap());

        // `s` still carries version 0 and must lose.
        s.status = FlowStatus::Failed;
        assert!(!store.update(&mut s).await.unwrap());
        assert_eq!(s.version, 0);

        let stored = store.get("f-1").await.unwrap().unwrap();
        assert_eq!(stored.status, FlowStatus::Running);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_try_claim_takes_unowned_rows() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        s.status = FlowStatus::Suspended;
        store.create(&s).await.unwrap();

        let claimed = store
            .try_claim("demo", "node-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.owner.as_deref(), Some("node-a"));
        assert_eq!(claimed.version, 1);
    }

    #[tokio::test]
    async fn test_try_claim_skips_live_owners_and_terminal_rows() {
        let store = MemoryFlowStore::new();

        let mut live = snapshot("f-live");
        live.status = FlowStatus::Running;
        live.owner = Some("node-a".to_string());
        live.heartbeat_at = unix_millis_now();
        store.create(&live).await.unwrap();

        let mut done = snapshot("f-done");
        done.status = FlowStatus::Completed;
        store.create(&done).await.unwrap();

        let claimed = store
            .try_claim("demo", "node-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_try_claim_takes_stale_owners() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        s.status = FlowStatus::Running;
        s.owner = Some("node-a".to_string());
        s.heartbeat_at = unix_millis_now() - 120_000;
        store.create(&s).await.unwrap();

        let claimed = store
            .try_claim("demo", "node-b", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.owner.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_each_row_to_one_node() {
        let store = MemoryFlowStore::new();
        for i in 0..8 {
            let mut s = snapshot(&format!("f-{}", i));
            s.status = FlowStatus::Suspended;
            store.create(&s).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut won = Vec::new();
                while let Some(claimed) = store
                    .try_claim("demo", &format!("node-{}", n), Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    won.push(claimed.flow_id);
                }
                won
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8, "every row claimed exactly once");
    }

    #[tokio::test]
    async fn test_heartbeat_requires_matching_owner_and_version() {
        let store = MemoryFlowStore::new();
        let mut s = snapshot("f-1");
        s.status = FlowStatus::Running;
        s.owner = Some("node-a".to_string());
        store.create(&s).await.unwrap();

        assert!(store.heartbeat("f-1", "node-a", 0).await.unwrap());
        // Version moved to 1; a repeat at 0 means the lease view is stale.
        assert!(!store.heartbeat("f-1", "node-a", 0).await.unwrap());
        assert!(store.heartbeat("f-1", "node-a", 1).await.unwrap());
        assert!(!store.heartbeat("f-1", "node-b", 2).await.unwrap());
        assert!(!store.heartbeat("missing", "node-a", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_condition_lifecycle() {
        let store = MemoryFlowStore::new();
        let mut c = WaitCondition::new("p-step-0", WaitKind::All, 2, 50, "p", "demo", "0");
        store.put_wait_condition(&c).await.unwrap();

        c.record_result(ChildResult {
            child_flow_id: "c1".to_string(),
            success: true,
            error: None,
            result: None,
        });
        store.update_wait_condition(&c).await.unwrap();

        let loaded = store.wait_condition("p-step-0").await.unwrap().unwrap();
        assert_eq!(loaded.completed_count, 1);

        let later = c.created_at + chrono::Duration::milliseconds(100);
        let expired = store.timed_out_wait_conditions(later).await.unwrap();
        assert_eq!(expired.len(), 1);

        store.clear_wait_condition("p-step-0").await.unwrap();
        assert!(store.wait_condition("p-step-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_lifecycle() {
        let store = MemoryFlowStore::new();
        let mut p = ForEachProgress::new("f-1", "3", 10);
        p.record_success(0);
        store.save_progress(&p).await.unwrap();

        let loaded = store.progress("f-1", "3").await.unwrap().unwrap();
        assert_eq!(loaded.current_index, 1);

        store.clear_progress("f-1", "3").await.unwrap();
        assert!(store.progress("f-1", "3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queries_filter_rows() {
        let store = MemoryFlowStore::new();
        let mut a = snapshot("f-a");
        a.status = FlowStatus::Running;
        store.create(&a).await.unwrap();

        let mut b = FlowSnapshot::new("f-b", "other", json!({}));
        b.status = FlowStatus::Completed;
        store.create(&b).await.unwrap();

        assert_eq!(
            store.list_by_status(FlowStatus::Running).await.unwrap().len(),
            1
        );
        assert_eq!(store.list_by_type("other").await.unwrap().len(), 1);

        let all = store
            .list_by_date_range(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
