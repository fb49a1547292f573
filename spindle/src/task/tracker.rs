use super::id::TaskId;
use crate::error::TaskError;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub type TaskResult = Result<Bytes, TaskError>;

/// Completion handler of a callback-mode task.
pub type TaskCallback<C> = Box<dyn FnOnce(&C, TaskId, TaskResult)>;

/// Key of a parked coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoKey(u64);

enum Waiter<C> {
    Callback(TaskCallback<C>),
    Parked { co: CoKey, index: usize },
}

/// A coroutine waiting on one or more task ids.
struct TaskCo {
    ids: Vec<TaskId>,
    results: Vec<Option<TaskResult>>,
    remaining: usize,
    tx: oneshot::Sender<Vec<TaskResult>>,
}

impl TaskCo {
    fn resume(self) {
        let results = self
            .results
            .into_iter()
            .map(|r| r.unwrap_or(Err(TaskError::Timeout)))
            .collect();
        // The receiver may already be gone if the coroutine was dropped.
        let _ = self.tx.send(results);
    }
}

/// What [`TaskTracker::complete`] did with a result.
pub enum Completion<C> {
    /// Callback to run; its registration is already removed.
    Callback(TaskCallback<C>),
    /// The last awaited result landed and the coroutine was resumed.
    Resumed,
    /// Stored; the coroutine still waits for other ids.
    Pending,
    /// Nobody tracks this id.
    Unknown,
}

/// Tasks issued by one worker whose completion is still awaited.
///
/// Every tracked id ends in exactly one of: result delivered, timeout
/// expiry, or [`TaskTracker::clear`] on worker exit.
pub struct TaskTracker<C> {
    waiters: HashMap<TaskId, Waiter<C>>,
    parked: HashMap<CoKey, TaskCo>,
    next_co: u64,
}

impl<C> Default for TaskTracker<C> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            parked: HashMap::new(),
            next_co: 0,
        }
    }
}

impl<C> TaskTracker<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked task ids.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn parked_num(&self) -> usize {
        self.parked.len()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.waiters.contains_key(&id)
    }

    pub fn track_callback(&mut self, id: TaskId, callback: TaskCallback<C>) {
        self.waiters.insert(id, Waiter::Callback(callback));
    }

    /// Park a coroutine on `ids`. Results come back in the order of `ids`.
    pub fn park(&mut self, ids: Vec<TaskId>) -> (CoKey, oneshot::Receiver<Vec<TaskResult>>) {
        let (tx, rx) = oneshot::channel();
        let co = CoKey(self.next_co);
        self.next_co += 1;
        let task_co = TaskCo {
            results: (0..ids.len()).map(|_| None).collect(),
            remaining: ids.len(),
            ids,
            tx,
        };
        if task_co.remaining == 0 {
            task_co.resume();
            return (co, rx);
        }
        for (index, id) in task_co.ids.iter().enumerate() {
            self.waiters.insert(*id, Waiter::Parked { co, index });
        }
        self.parked.insert(co, task_co);
        (co, rx)
    }

    pub fn complete(&mut self, id: TaskId, result: TaskResult) -> Completion<C> {
        match self.waiters.remove(&id) {
            None => Completion::Unknown,
            Some(Waiter::Callback(callback)) => Completion::Callback(callback),
            Some(Waiter::Parked { co, index }) => {
                let Some(task_co) = self.parked.get_mut(&co) else {
                    return Completion::Unknown;
                };
                task_co.results[index] = Some(result);
                task_co.remaining -= 1;
                if task_co.remaining > 0 {
                    return Completion::Pending;
                }
                if let Some(task_co) = self.parked.remove(&co) {
                    task_co.resume();
                }
                Completion::Resumed
            }
        }
    }

    /// Force-resume `co` with whatever has arrived; outstanding ids are purged
    /// and reported as timed out. Returns false if it was already resumed.
    pub fn expire(&mut self, co: CoKey) -> bool {
        let Some(task_co) = self.parked.remove(&co) else {
            return false;
        };
        for (id, result) in task_co.ids.iter().zip(&task_co.results) {
            if result.is_none() {
                self.waiters.remove(id);
            }
        }
        task_co.resume();
        true
    }

    /// Drop every registration. Parked coroutines observe a closed channel.
    pub fn clear(&mut self) {
        self.waiters.clear();
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ids(n: u64) -> Vec<TaskId> {
        (0..n).map(|seq| TaskId::new(0, seq)).collect()
    }

    #[test]
    fn test_single_result_resumes_once() {
        let mut tracker = TaskTracker::<()>::new();
        let id = TaskId::new(0, 9);
        let (co, mut rx) = tracker.park(vec![id]);
        assert!(matches!(
            tracker.complete(id, Ok(Bytes::from_static(b"ok"))),
            Completion::Resumed
        ));
        assert_eq!(rx.try_recv().unwrap(), vec![Ok(Bytes::from_static(b"ok"))]);
        assert!(!tracker.expire(co));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_join_times_out_with_marker_at_index() {
        let mut tracker = TaskTracker::<()>::new();
        let ids = ids(3);
        let (co, mut rx) = tracker.park(ids.clone());
        assert!(matches!(
            tracker.complete(ids[2], Ok(Bytes::from_static(b"c"))),
            Completion::Pending
        ));
        assert!(matches!(
            tracker.complete(ids[0], Ok(Bytes::from_static(b"a"))),
            Completion::Pending
        ));
        assert!(rx.try_recv().is_err());

        assert!(tracker.expire(co));
        let results = rx.try_recv().unwrap();
        assert_eq!(results[0], Ok(Bytes::from_static(b"a")));
        assert_eq!(results[1], Err(TaskError::Timeout));
        assert_eq!(results[2], Ok(Bytes::from_static(b"c")));

        // The straggler arrives after the caller gave up.
        assert!(matches!(
            tracker.complete(ids[1], Ok(Bytes::new())),
            Completion::Unknown
        ));
        assert!(tracker.is_empty());
        assert_eq!(tracker.parked_num(), 0);
    }

    #[test]
    fn test_join_resumes_when_all_arrive() {
        let mut tracker = TaskTracker::<()>::new();
        let ids = ids(2);
        let (co, mut rx) = tracker.park(ids.clone());
        tracker.complete(ids[1], Err(TaskError::DispatchFailed));
        assert!(matches!(
            tracker.complete(ids[0], Ok(Bytes::new())),
            Completion::Resumed
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            vec![Ok(Bytes::new()), Err(TaskError::DispatchFailed)]
        );
        assert!(!tracker.expire(co));
    }

    #[test]
    fn test_callback_removed_exactly_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = TaskTracker::<u32>::new();
        let id = TaskId::new(1, 1);
        let sink = seen.clone();
        tracker.track_callback(
            id,
            Box::new(move |ctx: &u32, id, result| {
                sink.borrow_mut().push((*ctx, id, result));
            }),
        );
        match tracker.complete(id, Ok(Bytes::from_static(b"x"))) {
            Completion::Callback(cb) => cb(&7, id, Ok(Bytes::from_static(b"x"))),
            _ => panic!("expected callback"),
        }
        assert!(matches!(
            tracker.complete(id, Ok(Bytes::new())),
            Completion::Unknown
        ));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].0, 7);
    }

    #[test]
    fn test_clear_closes_parked_channels() {
        let mut tracker = TaskTracker::<()>::new();
        let (_, mut rx) = tracker.park(ids(2));
        tracker.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_empty_join_resumes_immediately() {
        let mut tracker = TaskTracker::<()>::new();
        let (_, mut rx) = tracker.park(Vec::new());
        assert_eq!(rx.try_recv().unwrap(), Vec::<TaskResult>::new());
    }
}
