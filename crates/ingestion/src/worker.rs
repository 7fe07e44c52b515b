//! Background workers
//!
//! A fixed pool of tasks pulls item ids from a bounded queue and drives each
//! item through the pipeline. A separate reconciler task periodically sweeps
//! stuck items and feeds the requeued ones back into the queue.

use ledgerforge_common::errors::{AppError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::Pipeline;

/// Consecutive failures before a worker pauses
const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);

/// Sending side of the work queue
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<Uuid>,
}

impl WorkQueue {
    pub async fn submit(&self, item_id: Uuid) -> Result<()> {
        self.sender
            .send(item_id)
            .await
            .map_err(|_| AppError::Internal {
                message: "work queue is closed".into(),
            })
    }
}

pub struct WorkerPool {
    queue: WorkQueue,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(pipeline: Arc<Pipeline>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, _) = watch::channel(false);

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    pipeline.clone(),
                    receiver.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        info!(workers = workers.max(1), capacity, "Worker pool started");
        Self {
            queue: WorkQueue { sender },
            shutdown,
            handles,
        }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub async fn submit(&self, item_id: Uuid) -> Result<()> {
        self.queue.submit(item_id).await
    }

    /// Receiver that flips to `true` when the pool shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop taking work; items in flight finish first
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    receiver: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_failures = 0;

    loop {
        if consecutive_failures >= MAX_FAILURES {
            warn!(worker_id, failures = consecutive_failures, "Circuit breaker open, pausing...");
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
        }

        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                next = rx.recv() => next,
            }
        };
        let Some(item_id) = next else {
            break;
        };

        match pipeline.process_item(item_id).await {
            Ok(status) => {
                consecutive_failures = 0;
                debug!(worker_id, item_id = %item_id, status = %status, "Item processed");
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    worker_id,
                    item_id = %item_id,
                    error = %e,
                    failures = consecutive_failures,
                    "Failed to process item"
                );
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Periodic sweep for items stuck in an in-progress state
pub fn spawn_reconciler(
    pipeline: Arc<Pipeline>,
    queue: WorkQueue,
    interval: Duration,
    stuck_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match pipeline.reconcile(stuck_after).await {
                        Ok(report) => {
                            for item_id in report.requeued {
                                if let Err(e) = queue.submit(item_id).await {
                                    warn!(item_id = %item_id, error = %e, "Failed to requeue item");
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }
        debug!("Reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{fast_retry, FlakyExtractor};
    use crate::registry::ComponentRegistry;
    use ledgerforge_common::config::AppConfig;
    use ledgerforge_common::ingest::{Batch, Item, ItemStatus, NewBatch, Origin, SourceType};
    use ledgerforge_common::store::{MemoryDestination, MemoryPipelineStore, PipelineStore};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    async fn setup(rows: u32) -> (Arc<Pipeline>, Arc<MemoryPipelineStore>, Vec<Uuid>) {
        let config = AppConfig::default();
        let store = Arc::new(MemoryPipelineStore::new());
        let extractor = Arc::new(FlakyExtractor {
            failures: 0,
            calls: AtomicU32::new(0),
            text: "",
        });
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(MemoryDestination::new()),
            extractor,
            ComponentRegistry::with_defaults(&config, None),
            &config,
        )
        .with_retry(fast_retry());

        let batch = Batch::from_request(NewBatch {
            tenant_id: "t1".into(),
            source_type: SourceType::Invoices,
            origin: Origin::Excel,
            mapping_template: None,
            file_ref: None,
            created_by: None,
        });
        store.insert_batch(&batch).await.unwrap();
        let items = (0..rows)
            .map(|i| {
                let raw = json!({
                    "invoice_number": format!("F-{}", i),
                    "invoice_date": "2024-01-02",
                    "net": 90,
                    "tax": 10,
                    "total": 100,
                });
                Item::new(
                    batch.id,
                    "t1",
                    i,
                    Item::idempotency_key_for("t1", "rows.csv", i),
                    raw.as_object().cloned().unwrap(),
                    None,
                )
            })
            .collect();
        let ids = store
            .insert_items(batch.id, items)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        (Arc::new(pipeline), store, ids)
    }

    #[tokio::test]
    async fn test_pool_processes_submitted_items() {
        let (pipeline, store, ids) = setup(6).await;
        let pool = WorkerPool::start(pipeline, 3, 16);
        for id in &ids {
            pool.submit(*id).await.unwrap();
        }

        let mut done = false;
        for _ in 0..200 {
            let mut all = true;
            for id in &ids {
                let item = store.find_item(*id).await.unwrap().unwrap();
                all &= item.status == ItemStatus::Validated;
            }
            if all {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "items did not finish processing");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_submissions_process_once() {
        let (pipeline, store, ids) = setup(1).await;
        let pool = WorkerPool::start(pipeline, 4, 16);
        for _ in 0..8 {
            pool.submit(ids[0]).await.unwrap();
        }

        for _ in 0..200 {
            let item = store.find_item(ids[0]).await.unwrap().unwrap();
            if item.status == ItemStatus::Validated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let item = store.find_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Validated);
        assert_eq!(item.attempts.values().copied().max(), Some(1));
    }

    #[tokio::test]
    async fn test_reconciler_stops_on_shutdown() {
        let (pipeline, _, _) = setup(0).await;
        let pool = WorkerPool::start(pipeline.clone(), 1, 4);
        let handle = spawn_reconciler(
            pipeline,
            pool.queue(),
            Duration::from_millis(5),
            Duration::from_secs(60),
            pool.shutdown_signal(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
        handle.await.unwrap();
    }
}
