//! Bounded worker pool for generation calls.
//!
//! The chat-completion call can take tens of seconds against a local model,
//! so it never runs on the event path directly. A fixed set of workers drains
//! a shared queue; submissions beyond the worker count queue rather than
//! drop, and each caller awaits its own oneshot for the result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Job>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining a shared queue. Must be called from
    /// within a tokio runtime.
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next job, not
                    // while running it, so the other workers keep draining.
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => {
                            tracing::debug!(worker, "worker pool queue closed");
                            break;
                        }
                    }
                }
            });
        }

        Self { queue: tx }
    }

    /// Queue a task for execution on the pool. The receiver resolves with the
    /// task's output; it errs only if the pool is shutting down.
    pub fn submit<T, F>(&self, task: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });
        if self.queue.send(job).is_err() {
            tracing::error!("worker pool queue closed, dropping submission");
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submissions_complete_with_their_results() {
        let pool = WorkerPool::new(2);
        let mut receivers = Vec::new();
        for i in 0..5u32 {
            receivers.push(pool.submit(async move { i * 2 }));
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i as u32 * 2);
        }
    }

    #[tokio::test]
    async fn overflow_queues_instead_of_running_concurrently() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..6 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            receivers.push(pool.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
