//! Preemption marks.
//!
//! Ids land here only while their container is live; the set is drained in
//! one step when an allocation snapshot is built, so every mark is delivered
//! exactly once.

use std::collections::{BTreeSet, HashSet};

use capgrid_core::ContainerId;

#[derive(Debug, Default)]
pub struct PreemptionTracker {
    marks: HashSet<ContainerId>,
}

impl PreemptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the id was not already marked.
    pub fn mark(&mut self, id: ContainerId) -> bool {
        self.marks.insert(id)
    }

    pub fn unmark(&mut self, id: &ContainerId) -> bool {
        self.marks.remove(id)
    }

    pub fn is_marked(&self, id: &ContainerId) -> bool {
        self.marks.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.marks.len()
    }

    /// Take every mark, leaving the set empty.
    pub fn drain(&mut self) -> BTreeSet<ContainerId> {
        self.marks.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_twice_is_idempotent() {
        let mut t = PreemptionTracker::new();
        assert!(t.mark(ContainerId::new("c1")));
        assert!(!t.mark(ContainerId::new("c1")));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn drain_empties_the_set() {
        let mut t = PreemptionTracker::new();
        t.mark(ContainerId::new("c2"));
        t.mark(ContainerId::new("c1"));

        let drained: Vec<_> = t.drain().into_iter().collect();
        assert_eq!(drained, vec![ContainerId::new("c1"), ContainerId::new("c2")]);
        assert_eq!(t.len(), 0);
        assert!(t.drain().is_empty());
    }

    #[test]
    fn unmark_removes() {
        let mut t = PreemptionTracker::new();
        t.mark(ContainerId::new("c1"));
        assert!(t.unmark(&ContainerId::new("c1")));
        assert!(!t.is_marked(&ContainerId::new("c1")));
        assert!(!t.unmark(&ContainerId::new("c1")));
    }
}
