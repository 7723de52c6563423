//! Bounded read-only history of finished operations.

use crate::operation::state::OperationState;
use std::collections::{HashMap, VecDeque};

/// FIFO-bounded map of terminal operation states. The orchestrator moves
/// an operation here once it finishes; the oldest entry is evicted when
/// the limit is reached.
#[derive(Debug)]
pub struct OperationHistory {
    limit: usize,
    order: VecDeque<String>,
    entries: HashMap<String, OperationState>,
}

impl OperationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, state: OperationState) {
        let id = state.id.clone();
        if self.entries.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&OperationState> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Most recent first.
    pub fn list(&self) -> Vec<OperationState> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::state::{OperationMode, OperationRequest};
    use chrono::NaiveDate;

    fn state(id: &str) -> OperationState {
        let request = OperationRequest::new(
            OperationMode::Initial,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        OperationState::new(id, request, Vec::new())
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let mut history = OperationHistory::new(2);
        history.insert(state("a"));
        history.insert(state("b"));
        history.insert(state("c"));

        assert_eq!(history.len(), 2);
        assert!(!history.contains("a"));
        assert!(history.contains("b"));
        assert!(history.contains("c"));
    }

    #[test]
    fn list_is_most_recent_first() {
        let mut history = OperationHistory::new(5);
        history.insert(state("a"));
        history.insert(state("b"));
        let ids: Vec<_> = history.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn reinsert_same_id_does_not_duplicate() {
        let mut history = OperationHistory::new(5);
        history.insert(state("a"));
        history.insert(state("a"));
        assert_eq!(history.len(), 1);
        assert_eq!(history.list().len(), 1);
    }
}
