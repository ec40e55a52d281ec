use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: HashSet<String>,
    closed: bool,
}

/// FIFO of deployment IDs awaiting reprocessing.
///
/// An ID that is already waiting is not queued twice, so the queue never
/// holds more entries than there are distinct deployments.
#[derive(Debug, Default)]
pub struct ReprocessQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReprocessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `deployment_id`. Returns `false` if it was already queued or the
    /// queue is closed.
    pub fn push(&self, deployment_id: impl Into<String>) -> bool {
        let id = deployment_id.into();
        {
            let mut state = self.state();
            if state.closed || !state.queued.insert(id.clone()) {
                return false;
            }
            state.order.push_back(id);
        }
        self.notify.notify_one();
        true
    }

    /// Queue every ID, returning how many were new.
    pub fn extend<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter()
            .map(|id| self.push(id))
            .filter(|added| *added)
            .count()
    }

    /// Wait for the next ID. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(id) = state.order.pop_front() {
                    state.queued.remove(&id);
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new IDs. Already queued IDs can still be popped.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn duplicate_ids_are_queued_once() {
        let queue = ReprocessQueue::new();
        assert!(queue.push("d1"));
        assert!(!queue.push("d1"));
        assert_eq!(queue.extend(["d2", "d1", "d3", "d2"]), 2);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().await.as_deref(), Some("d1"));
        // Once popped, the ID may be queued again.
        assert!(queue.push("d1"));
        assert_eq!(queue.pop().await.as_deref(), Some("d2"));
        assert_eq!(queue.pop().await.as_deref(), Some("d3"));
        assert_eq!(queue.pop().await.as_deref(), Some("d1"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(ReprocessQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("d1");
        assert_eq!(popper.await.unwrap().as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = Arc::new(ReprocessQueue::new());
        queue.push("d1");
        queue.close();
        assert!(!queue.push("d2"));
        assert_eq!(queue.pop().await.as_deref(), Some("d1"));
        assert_eq!(queue.pop().await, None);

        let waiting = Arc::new(ReprocessQueue::new());
        let popper = {
            let queue = Arc::clone(&waiting);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiting.close();
        assert_eq!(popper.await.unwrap(), None);
    }
}
