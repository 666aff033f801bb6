//! Open-loop worker pool.
//!
//! A fixed set of workers drains a bounded request queue and feeds every
//! outcome to the engine's metrics aggregator; responses are not returned.
//! Closed-loop execution goes through [`Engine::run_scenario`] or
//! [`Engine::execute`] instead.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::request::Request;

pub struct WorkerPool {
    tx: flume::Sender<Request>,
    rx: flume::Receiver<Request>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers over a queue of `2 × max_connections`
    /// descriptors, both taken from the engine's config.
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = engine.config();
        let (tx, rx) = flume::bounded(config.max_connections * 2);
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for worker_id in 0..config.worker_count {
            let engine = Arc::clone(&engine);
            let rx = rx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        request = rx.recv_async() => match request {
                            Ok(request) => {
                                // Transport failures are already folded into
                                // the metrics; only unattemptable requests
                                // surface here.
                                if let Err(err) = engine.execute(&request).await {
                                    tracing::warn!(worker_id, %err, "dropped request");
                                }
                            }
                            Err(_) => break,
                        },
                    }
                }
                tracing::debug!(worker_id, "worker exited");
            });
        }

        Self { tx, rx, cancel, workers }
    }

    /// Queue one descriptor without blocking. A full queue is back-pressure:
    /// the caller retries or backs off.
    pub fn enqueue(&self, request: Request) -> Result<()> {
        self.tx.try_send(request).map_err(|e| match e {
            flume::TrySendError::Full(_) => {
                Error::CapacityExceeded("request queue is full".into())
            }
            flume::TrySendError::Disconnected(_) => {
                Error::NotConnected("worker pool is shut down".into())
            }
        })
    }

    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    /// Broadcast shutdown: workers finish their in-flight descriptor
    /// (bounded by its timeout) and exit; queued descriptors are dropped.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        drop(self.tx);
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                tracing::warn!(%err, "worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use std::time::Duration;

    fn small_engine() -> Arc<Engine> {
        Arc::new(Engine::new(EngineConfig { max_connections: 2, worker_count: 2 }).unwrap())
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        // Zero workers: nothing drains the queue.
        let engine =
            Arc::new(Engine::new(EngineConfig { max_connections: 2, worker_count: 0 }).unwrap());
        let pool = WorkerPool::new(Arc::clone(&engine));

        for _ in 0..4 {
            pool.enqueue(Request::get("http://127.0.0.1:1/")).unwrap();
        }
        let err = pool.enqueue(Request::get("http://127.0.0.1:1/")).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_workers_drain_into_metrics() {
        let engine = small_engine();
        let pool = WorkerPool::new(Arc::clone(&engine));

        for _ in 0..3 {
            pool.enqueue(
                Request::get("http://127.0.0.1:1/").with_timeout(Duration::from_millis(200)),
            )
            .unwrap();
        }

        // Unreachable target: every request fails quickly but is credited.
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.metrics().total_requests < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("workers should drain the queue");

        let snap = engine.metrics();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.failed_requests, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown() {
        let engine = small_engine();
        let pool = WorkerPool::new(Arc::clone(&engine));
        let tx = pool.tx.clone();
        pool.shutdown().await;
        // The queue is disconnected once workers are gone and the pool sender
        // is dropped.
        assert!(tx.try_send(Request::get("http://x/")).is_err());
    }
}
