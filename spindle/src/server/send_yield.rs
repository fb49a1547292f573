use crate::connection::SessionId;
use crate::error::SendError;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

type Waiter = (u64, oneshot::Sender<Result<(), SendError>>);

/// Coroutines suspended on a full output buffer, per session, in arrival order.
#[derive(Default)]
pub(crate) struct SendWaiters {
    next: u64,
    waiting: HashMap<SessionId, VecDeque<Waiter>>,
}

impl SendWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter on `session_id`; the id is used to expire it.
    pub fn wait(&mut self, session_id: SessionId) -> (u64, oneshot::Receiver<Result<(), SendError>>) {
        let (tx, rx) = oneshot::channel();
        self.next += 1;
        self.waiting
            .entry(session_id)
            .or_default()
            .push_back((self.next, tx));
        (self.next, rx)
    }

    /// Resume every waiter of `session_id`, oldest first.
    pub fn wake(&mut self, session_id: SessionId) -> usize {
        self.resolve_all(session_id, Ok(()))
    }

    /// Fail every waiter of a closed session.
    pub fn reset(&mut self, session_id: SessionId) -> usize {
        self.resolve_all(session_id, Err(SendError::ConnectionReset))
    }

    fn resolve_all(&mut self, session_id: SessionId, result: Result<(), SendError>) -> usize {
        let Some(queue) = self.waiting.remove(&session_id) else {
            return 0;
        };
        let n = queue.len();
        for (_, tx) in queue {
            let _ = tx.send(result.clone());
        }
        n
    }

    /// Time out one waiter; false if it was already resumed.
    pub fn expire(&mut self, session_id: SessionId, id: u64) -> bool {
        let Some(queue) = self.waiting.get_mut(&session_id) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|(wid, _)| *wid == id) else {
            return false;
        };
        let expired = queue.remove(pos);
        if queue.is_empty() {
            self.waiting.remove(&session_id);
        }
        if let Some((_, tx)) = expired {
            let _ = tx.send(Err(SendError::Timeout));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_resumes_all_in_order() {
        let mut waiters = SendWaiters::new();
        let (_, mut a) = waiters.wait(7);
        let (_, mut b) = waiters.wait(7);
        let (_, mut other) = waiters.wait(8);
        assert_eq!(waiters.len(), 3);

        assert_eq!(waiters.wake(7), 2);
        assert_eq!(a.try_recv().unwrap(), Ok(()));
        assert_eq!(b.try_recv().unwrap(), Ok(()));
        assert!(other.try_recv().is_err());
        assert_eq!(waiters.len(), 1);
    }

    #[test]
    fn test_expire_and_reset() {
        let mut waiters = SendWaiters::new();
        let (first, mut a) = waiters.wait(1);
        let (_, mut b) = waiters.wait(1);

        assert!(waiters.expire(1, first));
        assert!(!waiters.expire(1, first));
        assert_eq!(a.try_recv().unwrap(), Err(SendError::Timeout));

        assert_eq!(waiters.reset(1), 1);
        assert_eq!(b.try_recv().unwrap(), Err(SendError::ConnectionReset));
        assert!(waiters.is_empty());
    }
}
