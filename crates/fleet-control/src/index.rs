//! Assignment value → agent set index
//!
//! Buckets are never empty: the last member leaving a bucket removes it, and
//! the empty (unassigned) value is never indexed.

use std::collections::{HashMap, HashSet};

use crate::AgentId;

#[derive(Debug, Default)]
pub struct AssignmentIndex {
    buckets: HashMap<String, HashSet<AgentId>>,
}

impl AssignmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, agent: AgentId) {
        if key.is_empty() {
            return;
        }
        self.buckets.entry(key.to_string()).or_default().insert(agent);
    }

    pub fn remove(&mut self, key: &str, agent: AgentId) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.remove(&agent);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
    }

    /// Move an agent from the `from` bucket to the `to` bucket
    pub fn relocate(&mut self, agent: AgentId, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.remove(from, agent);
        self.insert(to, agent);
    }

    pub fn members(&self, key: &str) -> impl Iterator<Item = AgentId> + '_ {
        self.buckets.get(key).into_iter().flatten().copied()
    }

    pub fn contains(&self, key: &str, agent: AgentId) -> bool {
        self.buckets
            .get(key)
            .is_some_and(|bucket| bucket.contains(&agent))
    }

    /// Number of distinct non-empty values
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> impl Iterator<Item = (&String, &HashSet<AgentId>)> {
        self.buckets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_not_indexed() {
        let mut index = AssignmentIndex::new();
        index.insert("", AgentId::new());
        assert!(index.is_empty());
    }

    #[test]
    fn test_last_member_removes_bucket() {
        let mut index = AssignmentIndex::new();
        let a = AgentId::new();
        let b = AgentId::new();

        index.insert("t1", a);
        index.insert("t1", b);
        index.remove("t1", a);
        assert_eq!(index.members("t1").collect::<Vec<_>>(), vec![b]);

        index.remove("t1", b);
        assert!(index.is_empty());
        assert_eq!(index.members("t1").count(), 0);
    }

    #[test]
    fn test_relocate() {
        let mut index = AssignmentIndex::new();
        let a = AgentId::new();

        index.insert("g1", a);
        index.relocate(a, "g1", "g2");
        assert!(!index.contains("g1", a));
        assert!(index.contains("g2", a));
        assert_eq!(index.len(), 1);

        // Moving to "unassigned" drops the agent from the index entirely
        index.relocate(a, "g2", "");
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut index = AssignmentIndex::new();
        index.remove("missing", AgentId::new());
        assert!(index.is_empty());
    }
}
