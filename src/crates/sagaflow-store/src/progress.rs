//! Durable iteration state for ForEach loops
//!
//! A [`ForEachProgress`] row is written after every batch of a ForEach step
//! so that a crashed flow resumes iteration without re-executing completed
//! items. Keyed by `(flow_id, step)` where `step` is the position string of
//! the loop in the parent program.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Durable iteration state of one ForEach step
///
/// Invariant: `completed_indices ∪ failed_indices ⊆ [0, current_index)`,
/// and the two sets are disjoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachProgress {
    /// Flow id of the owning flow
    pub flow_id: String,

    /// Position string of the ForEach step
    pub step: String,

    /// Index one past the highest attempted item
    pub current_index: usize,

    /// Total number of items in the materialized collection
    pub total_count: usize,

    /// Indices whose sub-program completed successfully
    pub completed_indices: BTreeSet<usize>,

    /// Indices whose sub-program failed
    pub failed_indices: BTreeSet<usize>,
}

impl ForEachProgress {
    /// Create fresh progress for a loop entering its first batch
    pub fn new(flow_id: impl Into<String>, step: impl Into<String>, total_count: usize) -> Self {
        Self {
            flow_id: flow_id.into(),
            step: step.into(),
            current_index: 0,
            total_count,
            completed_indices: BTreeSet::new(),
            failed_indices: BTreeSet::new(),
        }
    }

    /// Whether the given index has already been attempted
    pub fn is_attempted(&self, index: usize) -> bool {
        self.completed_indices.contains(&index) || self.failed_indices.contains(&index)
    }

    /// Record a successful item and move the cursor
    pub fn record_success(&mut self, index: usize) {
        self.failed_indices.remove(&index);
        self.completed_indices.insert(index);
        self.bump_cursor(index);
    }

    /// Record a failed item and move the cursor
    pub fn record_failure(&mut self, index: usize) {
        if !self.completed_indices.contains(&index) {
            self.failed_indices.insert(index);
        }
        self.bump_cursor(index);
    }

    /// Whether every index has been attempted
    pub fn is_complete(&self) -> bool {
        self.completed_indices.len() + self.failed_indices.len() >= self.total_count
    }

    /// Number of attempted items
    pub fn attempted_count(&self) -> usize {
        self.completed_indices.len() + self.failed_indices.len()
    }

    fn bump_cursor(&mut self, index: usize) {
        if index + 1 > self.current_index {
            self.current_index = index + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_progress() {
        let p = ForEachProgress::new("f-1", "2", 10);
        assert_eq!(p.current_index, 0);
        assert_eq!(p.total_count, 10);
        assert!(!p.is_complete());
        assert!(!p.is_attempted(0));
    }

    #[test]
    fn test_cursor_follows_highest_attempted_index() {
        let mut p = ForEachProgress::new("f-1", "2", 5);
        p.record_success(0);
        p.record_failure(2);
        assert_eq!(p.current_index, 3);
        p.record_success(1);
        assert_eq!(p.current_index, 3);
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let mut p = ForEachProgress::new("f-1", "2", 3);
        p.record_success(1);
        p.record_failure(1);
        assert!(p.completed_indices.contains(&1));
        assert!(!p.failed_indices.contains(&1));
    }

    #[test]
    fn test_complete_when_all_attempted() {
        let mut p = ForEachProgress::new("f-1", "2", 3);
        p.record_success(0);
        p.record_failure(1);
        assert!(!p.is_complete());
        p.record_success(2);
        assert!(p.is_complete());
        assert_eq!(p.attempted_count(), 3);
    }

    #[test]
    fn test_progress_serde_round_trip() {
        let mut p = ForEachProgress::new("f-1", "2.1.0", 100);
        for i in 0..50 {
            p.record_success(i);
        }
        let bytes = serde_json::to_vec(&p).unwrap();
        let restored: ForEachProgress = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.current_index, 50);
        assert_eq!(restored.completed_indices.len(), 50);
        assert_eq!(restored.step, "2.1.0");
    }
}
