//! A bounded priority queue of pending requests.
//!
//! Each request kind belongs to a priority class; [`RequestPriorityQueue::drain`]
//! always yields from the highest non-empty class, FIFO within a class.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::api::RequestKind;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued requests over all classes.
    pub capacity: usize,
    /// Request kinds from highest to lowest priority. Kinds not listed share
    /// the lowest class.
    pub order: Vec<RequestKind>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            order: vec![
                RequestKind::Reflect,
                RequestKind::Query,
                RequestKind::Replicate,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("request queue is full")]
    Full,
    #[error("request queue is closed")]
    Closed,
}

#[derive(Debug)]
pub struct RequestPriorityQueue<T> {
    order: Vec<RequestKind>,
    capacity: usize,
    state: Mutex<State<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct State<T> {
    classes: Vec<VecDeque<T>>,
    len: usize,
    closed: bool,
}

impl<T> RequestPriorityQueue<T> {
    pub fn new(config: &QueueConfig) -> Self {
        let classes = (0..=config.order.len()).map(|_| VecDeque::new()).collect();
        Self {
            order: config.order.clone(),
            capacity: config.capacity,
            state: Mutex::new(State {
                classes,
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn class(&self, kind: RequestKind) -> usize {
        self.order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.order.len())
    }

    /// Queue `token` under the class of `kind`. Fails immediately when the
    /// queue is full or closed.
    pub fn enqueue(&self, kind: RequestKind, token: T) -> Result<(), QueueError> {
        let class = self.class(kind);
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.len >= self.capacity {
                return Err(QueueError::Full);
            }
            state.classes[class].push_back(token);
            state.len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next token in priority order.
    ///
    /// Returns `None` once the queue is closed. Tokens still queued at that
    /// point are dropped with the queue.
    pub async fn drain(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(token) = state.classes.iter_mut().find_map(VecDeque::pop_front) {
                    state.len -= 1;
                    return Some(token);
                }
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiting drainer.
    ///
    /// Returns the tokens that were still queued.
    pub fn close(&self) -> Vec<T> {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            state.len = 0;
            state.classes.iter_mut().flat_map(|c| c.drain(..)).collect()
        };
        self.notify.notify_waiters();
        pending
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn queue(capacity: usize) -> RequestPriorityQueue<u32> {
        RequestPriorityQueue::new(&QueueConfig {
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let q = queue(10);
        q.enqueue(RequestKind::Replicate, 1).unwrap();
        q.enqueue(RequestKind::Query, 2).unwrap();
        q.enqueue(RequestKind::Reflect, 3).unwrap();
        q.enqueue(RequestKind::Query, 4).unwrap();
        q.enqueue(RequestKind::Noop, 5).unwrap();
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(q.drain().await.unwrap());
        }
        assert_eq!(out, vec![3, 2, 4, 1, 5]);
        assert!(q.is_empty());
    }

    #[test]
    fn bounded() {
        let q = queue(2);
        q.enqueue(RequestKind::Query, 1).unwrap();
        q.enqueue(RequestKind::Reflect, 2).unwrap();
        assert_eq!(q.enqueue(RequestKind::Query, 3), Err(QueueError::Full));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn drain_waits_for_enqueue() {
        let q = Arc::new(queue(2));
        let drainer = tokio::spawn({
            let q = q.clone();
            async move { q.drain().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(RequestKind::Query, 7).unwrap();
        assert_eq!(drainer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_wakes_drainers() {
        let q = Arc::new(queue(2));
        let drainers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.drain().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.close().is_empty());
        for drainer in drainers {
            assert_eq!(drainer.await.unwrap(), None);
        }
        assert_eq!(q.enqueue(RequestKind::Query, 1), Err(QueueError::Closed));
    }

    #[test]
    fn close_returns_pending() {
        let q = queue(4);
        q.enqueue(RequestKind::Replicate, 1).unwrap();
        q.enqueue(RequestKind::Reflect, 2).unwrap();
        assert_eq!(q.close(), vec![2, 1]);
        assert!(q.is_closed());
    }
}
