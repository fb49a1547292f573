//! Min-heap of deadlines with lazy cancellation.
//!
//! Cancelling a timer only drops its entry; the stale heap slot is skipped
//! when it reaches the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Identifies a timer registered with a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

struct Entry<F> {
    deadline: Instant,
    interval: Option<Duration>,
    detached: bool,
    /// `None` while the callback is running.
    callback: Option<F>,
}

pub(crate) struct TimerHeap<F> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, Entry<F>>,
    next_id: u64,
    attached: usize,
}

impl<F> Default for TimerHeap<F> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 1,
            attached: 0,
        }
    }
}

impl<F> TimerHeap<F> {
    pub(crate) fn insert(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        detached: bool,
        callback: F,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        if !detached {
            self.attached += 1;
        }
        self.entries.insert(
            id,
            Entry {
                deadline,
                interval,
                detached,
                callback: Some(callback),
            },
        );
        self.heap.push(Reverse((deadline, id)));
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if !entry.detached {
                    self.attached -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Number of live timers that keep the loop from exiting.
    pub(crate) fn attached(&self) -> usize {
        self.attached
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_stale(&self, deadline: Instant, id: TimerId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.deadline != deadline || entry.callback.is_none(),
            None => true,
        }
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.is_stale(deadline, id) {
                self.heap.pop();
                continue;
            }
            return Some(deadline);
        }
        None
    }

    /// Take the callback of the earliest timer due at `now`.
    ///
    /// One-shot timers are removed. Interval timers stay registered without
    /// a callback until [`restore`](Self::restore) hands it back.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, F)> {
        let deadline = self.next_deadline()?;
        if deadline > now {
            return None;
        }
        let Reverse((_, id)) = self.heap.pop()?;
        let periodic = self.entries.get(&id)?.interval.is_some();
        if periodic {
            let entry = self.entries.get_mut(&id)?;
            let callback = entry.callback.take()?;
            Some((id, callback))
        } else {
            let entry = self.entries.remove(&id)?;
            if !entry.detached {
                self.attached -= 1;
            }
            Some((id, entry.callback?))
        }
    }

    /// Re-arm an interval timer after its callback ran, unless it was cancelled meanwhile.
    pub(crate) fn restore(&mut self, id: TimerId, callback: F, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id)
            && let Some(interval) = entry.interval
        {
            entry.deadline = now + interval;
            entry.callback = Some(callback);
            self.heap.push(Reverse((entry.deadline, id)));
        }
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
        self.attached = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_in_deadline_order() {
        let mut timers = TimerHeap::default();
        let now = Instant::now();
        timers.insert(now + Duration::from_millis(30), None, false, "c");
        timers.insert(now + Duration::from_millis(10), None, false, "a");
        timers.insert(now + Duration::from_millis(20), None, false, "b");

        let later = now + Duration::from_millis(50);
        let order: Vec<_> = std::iter::from_fn(|| timers.pop_expired(later).map(|(_, f)| f)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(timers.attached(), 0);
    }

    #[test]
    fn test_cancel_is_lazy() {
        let mut timers = TimerHeap::default();
        let now = Instant::now();
        let id = timers.insert(now, None, false, 1);
        timers.insert(now + Duration::from_millis(5), None, true, 2);
        assert_eq!(timers.attached(), 1);
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.attached(), 0);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn test_interval_rearms_until_cancelled() {
        let mut timers = TimerHeap::default();
        let now = Instant::now();
        let every = Duration::from_millis(10);
        let id = timers.insert(now, Some(every), false, ());

        let (fired, cb) = timers.pop_expired(now).unwrap();
        assert_eq!(fired, id);
        assert!(timers.pop_expired(now).is_none());
        timers.restore(id, cb, now);
        assert_eq!(timers.next_deadline(), Some(now + every));

        let (_, cb) = timers.pop_expired(now + every).unwrap();
        assert!(timers.cancel(id));
        timers.restore(id, cb, now + every);
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.len(), 0);
    }
}
