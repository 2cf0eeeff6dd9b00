use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// How long a long-poll reader waits on an empty queue before the dispatcher
/// answers with a keepalive.
pub const LONG_POLL_WAIT: Duration = Duration::from_secs(30);

/// Outcome of draining the queue head.
#[derive(Debug, PartialEq)]
pub enum Polled {
    Event(Value),
    /// Nothing arrived within the wait window (or the gateway is stopping).
    Timeout,
}

/// Per-session FIFO of pending events, drained by long-poll readers.
///
/// Writers are plugin `push_event` calls and internal notifications; at most
/// one reader drains the head at a time (enforced by the reader mutex), so
/// delivery order equals enqueue order.
pub struct EventQueue {
    inner: Mutex<VecDeque<Value>>,
    notify: Notify,
    reader: tokio::sync::Mutex<()>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            reader: tokio::sync::Mutex::new(()),
        }
    }

    pub fn push(&self, event: Value) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the head, waiting up to `wait` for one to arrive. A raised stop
    /// flag short-circuits to `Timeout` so shutdown never parks behind a
    /// 30-second window.
    pub async fn poll(&self, wait: Duration, mut stop: watch::Receiver<bool>) -> Polled {
        let _reader = self.reader.lock().await;
        let deadline = Instant::now() + wait;

        loop {
            if let Some(event) = self
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return Polled::Event(event);
            }
            if *stop.borrow() {
                return Polled::Timeout;
            }
            // A dropped stop sender means "never stopping"; park that branch
            // instead of letting changed() spin on the error.
            let stopped = async {
                if stop.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Polled::Timeout,
                _ = stopped => {}
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
