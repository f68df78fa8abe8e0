//! Clearable async queue used as the pipeline spine.
//!
//! Barge-in must be able to drain the TTS text and audio queues from outside
//! the consumer task, which plain channels cannot do; consumers poll with a
//! timeout so they also notice the session cancellation token.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

#[derive(Clone)]
pub struct TaskQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    notify: Arc<Notify>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn push(&self, item: T) {
        self.inner.lock().await.push_back(item);
        self.notify.notify_one();
    }

    /// Pop the next item, waiting up to `timeout`. Returns `None` on timeout
    /// so the caller can re-check its stop condition (1 s poll interval by
    /// convention).
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.inner.lock().await.pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.inner.lock().await.pop_front();
            }
        }
    }

    /// Drop everything queued. Used by abort and close.
    pub async fn clear(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let n = guard.len();
        guard.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_order() {
        let q = TaskQueue::new();
        q.push(1).await;
        q.push(2).await;
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some(1));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some(2));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn clear_drains_everything() {
        let q = TaskQueue::new();
        for i in 0..5 {
            q.push(i).await;
        }
        assert_eq!(q.clear().await, 5);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = TaskQueue::new();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42).await;
        assert_eq!(waiter.await.unwrap(), Some(42));
    }
}
