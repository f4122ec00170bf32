// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FIFO restart queue.
//!
//! A single drain task restarts one item at a time, awaiting each restart
//! (including its readiness barrier) before taking the next. A fleet-wide
//! restart therefore never has more than one unit down.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::worker::WorkerHandle;

/// Something the queue can restart.
#[async_trait]
pub trait Restartable: Send + Sync + 'static {
    /// Short name for logs.
    fn label(&self) -> String;

    /// Restart and wait for readiness.
    async fn restart(&self) -> Result<()>;
}

#[async_trait]
impl Restartable for Arc<WorkerHandle> {
    fn label(&self) -> String {
        self.id().to_string()
    }

    async fn restart(&self) -> Result<()> {
        WorkerHandle::restart(self, true).await.map(|_| ())
    }
}

struct Job<T> {
    item: T,
    done: oneshot::Sender<Result<()>>,
}

/// Strictly sequential restart queue.
pub struct RestartQueue<T: Restartable> {
    jobs: mpsc::UnboundedSender<Job<T>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Restartable> Default for RestartQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Restartable> RestartQueue<T> {
    /// Create the queue and start its drain task. The task ends when the
    /// queue is dropped.
    pub fn new() -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(rx, pending.clone()));
        Self { jobs, pending }
    }

    /// Append `item`. The receiver resolves with the restart result.
    pub fn enqueue(&self, item: T) -> oneshot::Receiver<Result<()>> {
        let (done, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Job { item, done }) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            let _ = job
                .done
                .send(Err(Error::Other("restart queue stopped".to_string())));
        }
        rx
    }

    /// Queue every item and wait for all of them, in order. Failures are
    /// reported per item and do not stop the queue.
    pub async fn restart_all(&self, items: Vec<T>) -> Vec<(String, Result<()>)> {
        let receivers: Vec<_> = items
            .into_iter()
            .map(|item| {
                let label = item.label();
                (label, self.enqueue(item))
            })
            .collect();

        let mut results = Vec::with_capacity(receivers.len());
        for (label, rx) in receivers {
            let result = rx
                .await
                .unwrap_or_else(|_| Err(Error::Other("restart queue stopped".to_string())));
            results.push((label, result));
        }
        results
    }

    /// Items queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

async fn drain<T: Restartable>(mut jobs: mpsc::UnboundedReceiver<Job<T>>, pending: Arc<AtomicUsize>) {
    while let Some(job) = jobs.recv().await {
        let label = job.item.label();
        info!(worker = %label, "Restarting from queue");

        let result = job.item.restart().await;
        pending.fetch_sub(1, Ordering::AcqRel);

        match &result {
            Ok(()) => info!(worker = %label, "Queued restart complete"),
            Err(e) => warn!(worker = %label, error = %e, "Queued restart failed"),
        }
        let _ = job.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    struct Probe {
        name: &'static str,
        fail: bool,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Restartable for Probe {
        fn label(&self) -> String {
            self.name.to_string()
        }

        async fn restart(&self) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.order.lock().unwrap().push(self.name);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Other("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_one_at_a_time_in_order() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let probe = |name, fail| Probe {
            name,
            fail,
            in_flight: in_flight.clone(),
            max_in_flight: max_in_flight.clone(),
            order: order.clone(),
        };

        let queue = RestartQueue::new();
        let results = queue
            .restart_all(vec![probe("a", false), probe("b", true), probe("c", false)])
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert!(results[2].1.is_ok());
        assert_eq!(queue.pending(), 0);
    }
}
