use crate::task::{ErasedTask, TaskId};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

/// A task sitting in the ready list, keyed for dispatch.
///
/// Keys are snapshotted at admission: priority is immutable once a task
/// leaves INITIAL and the sequence is fixed for the task's stay in the
/// queue, so heap comparisons never take the task lock.
pub(crate) struct ReadyEntry {
    priority: i32,
    sequence: u64,
    pub(crate) task: Arc<dyn ErasedTask>,
}

impl ReadyEntry {
    pub(crate) fn new(priority: i32, sequence: u64, task: Arc<dyn ErasedTask>) -> Self {
        Self {
            priority,
            sequence,
            task,
        }
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.task.id()
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    /// Reversed so that `BinaryHeap` (a max-heap) pops the lowest
    /// `(priority, sequence)` pair first: smaller priority value wins,
    /// earlier admission breaks ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PriorityTask;
    use std::collections::BinaryHeap;

    fn entry(priority: i32, sequence: u64) -> ReadyEntry {
        let task = PriorityTask::from_fn(|_| Ok(0));
        ReadyEntry::new(priority, sequence, task.inner)
    }

    #[test]
    fn test_lowest_priority_value_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(10, 0));
        heap.push(entry(-10, 1));
        heap.push(entry(0, 2));

        assert_eq!(heap.pop().map(|e| e.priority), Some(-10));
        assert_eq!(heap.pop().map(|e| e.priority), Some(0));
        assert_eq!(heap.pop().map(|e| e.priority), Some(10));
    }

    #[test]
    fn test_sequence_breaks_ties_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 2));
        heap.push(entry(0, 0));
        heap.push(entry(0, 1));

        assert_eq!(heap.pop().map(|e| e.sequence), Some(0));
        assert_eq!(heap.pop().map(|e| e.sequence), Some(1));
        assert_eq!(heap.pop().map(|e| e.sequence), Some(2));
    }

    #[test]
    fn test_large_sequence_gap_does_not_wrap() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, u64::from(u32::MAX) + 10));
        heap.push(entry(0, 1));

        assert_eq!(heap.pop().map(|e| e.sequence), Some(1));
    }
}
