use serde::{Deserialize, Serialize};
use std::fmt;

const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Correlates a dispatched task with its completion.
///
/// Laid out as `(worker_id << 40) | sequence`, so ids from different workers
/// never collide and a worker's ids only repeat after 2^40 tasks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(worker_id: u32, sequence: u64) -> Self {
        TaskId(((worker_id as i64) << SEQUENCE_BITS) | (sequence as i64 & SEQUENCE_MASK))
    }

    pub fn from_raw(raw: i64) -> Self {
        TaskId(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn worker_id(self) -> u32 {
        (self.0 >> SEQUENCE_BITS) as u32
    }

    pub fn sequence(self) -> u64 {
        (self.0 & SEQUENCE_MASK) as u64
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.worker_id(), self.sequence())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-worker source of task ids.
#[derive(Debug)]
pub struct TaskIdGen {
    worker_id: u32,
    next: u64,
}

impl TaskIdGen {
    pub fn new(worker_id: u32) -> Self {
        Self { worker_id, next: 0 }
    }

    pub fn next_id(&mut self) -> TaskId {
        let id = TaskId::new(self.worker_id, self.next);
        self.next = (self.next + 1) & SEQUENCE_MASK as u64;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let id = TaskId::new(3, 17);
        assert_eq!(id.raw(), 3 << 40 | 17);
        assert_eq!(id.worker_id(), 3);
        assert_eq!(id.sequence(), 17);
        assert_eq!(TaskId::from_raw(id.raw()), id);
    }

    #[test]
    fn test_sequence_wraps_within_worker() {
        let mut ids = TaskIdGen::new(1);
        ids.next = SEQUENCE_MASK as u64;
        let last = ids.next_id();
        let first = ids.next_id();
        assert_eq!(last.worker_id(), 1);
        assert_eq!(first, TaskId::new(1, 0));
    }
}
