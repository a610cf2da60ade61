use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::models::{parse_port_range, ScanMode, ScanTask, TaskStatus};
use crate::probes::ProbeCatalogue;
use crate::scanner::{self, WorkerKind};
use crate::techniques;

/// Default number of long-lived queue consumer loops
pub const DEFAULT_QUEUE_WORKERS: usize = 5;

const CONNECT_WORKERS: usize = 100;
const SYN_WORKERS: usize = 50;
const UDP_WORKERS: usize = 50;

/// Errors surfaced by task store implementations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested task does not exist in the store
    #[error("task not found")]
    TaskNotFound,

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Persistence boundary for scan tasks.
///
/// Implementations are externally synchronized; each call is atomic from
/// the driver's perspective. `pop_from_queue` blocks until an id becomes
/// available, with no deadline on the driver's side.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &ScanTask) -> Result<(), StoreError>;
    async fn get_task(&self, id: Uuid) -> Result<ScanTask, StoreError>;
    /// Overwrites the stored representation in full
    async fn update_task(&self, task: &ScanTask) -> Result<(), StoreError>;
    async fn push_to_queue(&self, task_id: Uuid) -> Result<(), StoreError>;
    async fn pop_from_queue(&self) -> Result<Uuid, StoreError>;
}

/// In-process `TaskStore` backed by a map and an unbounded queue.
///
/// Stands in for the persistent store in tests and single-process
/// deployments; a production deployment wires the same trait to an external
/// queue.
pub struct MemoryStore {
    tasks: Mutex<HashMap<Uuid, ScanTask>>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            tasks: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &ScanTask) -> Result<(), StoreError> {
        self.tasks.lock().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<ScanTask, StoreError> {
        self.tasks.lock().get(&id).cloned().ok_or(StoreError::TaskNotFound)
    }

    async fn update_task(&self, task: &ScanTask) -> Result<(), StoreError> {
        self.tasks.lock().insert(task.id, task.clone());
        Ok(())
    }

    async fn push_to_queue(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.queue_tx
            .send(task_id)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn pop_from_queue(&self) -> Result<Uuid, StoreError> {
        self.queue_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| StoreError::Backend("task queue closed".to_string()))
    }
}

/// Memoized initialization state for the privileged scan modes.
///
/// The first `syn`/`udp` task pays the capability check; the outcome is
/// cached for the lifetime of this value (one per process, injected at
/// startup), so every later task of that mode sees the identical result.
#[derive(Default)]
pub struct ScanModes {
    syn_init: OnceCell<Result<(), String>>,
    udp_init: OnceCell<Result<(), String>>,
}

impl ScanModes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a task mode to its worker strategy and pool size, running the
    /// mode's one-time init when it has not run yet.
    pub async fn resolve(&self, mode: ScanMode) -> Result<(WorkerKind, usize), String> {
        match mode {
            ScanMode::Connect => Ok((WorkerKind::Connect, CONNECT_WORKERS)),
            ScanMode::Syn => {
                let init = self
                    .syn_init
                    .get_or_init(|| async { techniques::init_syn_scan().map_err(|e| e.to_string()) })
                    .await;
                init.clone().map(|_| (WorkerKind::Syn, SYN_WORKERS))
            }
            ScanMode::Udp => {
                let init = self
                    .udp_init
                    .get_or_init(|| async {
                        techniques::init_udp_scan().await.map_err(|e| e.to_string())
                    })
                    .await;
                init.clone().map(|_| (WorkerKind::Udp, UDP_WORKERS))
            }
        }
    }
}

/// Persist a new task and enqueue it for the worker loops. This is the
/// admission step a front end performs for each accepted scan request.
pub async fn enqueue_task(store: &dyn TaskStore, task: &ScanTask) -> Result<(), StoreError> {
    store.create_task(task).await?;
    store.push_to_queue(task.id).await
}

/// Launch `num_workers` background loops that consume queued tasks until
/// the process exits.
pub fn start_workers(
    store: Arc<dyn TaskStore>,
    catalogue: Arc<ProbeCatalogue>,
    modes: Arc<ScanModes>,
    num_workers: usize,
) {
    for _ in 0..num_workers {
        let store = Arc::clone(&store);
        let catalogue = Arc::clone(&catalogue);
        let modes = Arc::clone(&modes);
        tokio::spawn(async move {
            worker_loop(store, catalogue, modes).await;
        });
    }
}

async fn worker_loop(
    store: Arc<dyn TaskStore>,
    catalogue: Arc<ProbeCatalogue>,
    modes: Arc<ScanModes>,
) {
    loop {
        let task_id = match store.pop_from_queue().await {
            Ok(id) => id,
            Err(e) => {
                error!("worker: failed to pop task: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut task = match store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound) => {
                warn!("worker: task {} disappeared", task_id);
                continue;
            }
            Err(e) => {
                error!("worker: failed to load task {}: {}", task_id, e);
                continue;
            }
        };

        task.status = TaskStatus::Running;
        task.error.clear();
        task.results.clear();
        task.completed_at = None;
        if let Err(e) = store.update_task(&task).await {
            error!("worker: failed to set task {} running: {}", task_id, e);
            continue;
        }

        let (start_port, end_port) = match parse_port_range(&task.ports) {
            Ok(range) => range,
            Err(e) => {
                fail_task(store.as_ref(), task, &e.to_string()).await;
                continue;
            }
        };

        let (worker, worker_count) = match modes.resolve(task.mode).await {
            Ok(resolved) => resolved,
            Err(e) => {
                fail_task(store.as_ref(), task, &e).await;
                continue;
            }
        };

        let results = scanner::execute_scan(
            &task.hosts,
            start_port,
            end_port,
            worker,
            worker_count,
            Arc::clone(&catalogue),
        )
        .await;

        task.status = TaskStatus::Completed;
        task.results = results;
        task.completed_at = Some(Utc::now());
        if let Err(e) = store.update_task(&task).await {
            error!("worker: failed to update task {}: {}", task.id, e);
        }
    }
}

/// Mark a task failed with the given message and persist the transition
async fn fail_task(store: &dyn TaskStore, mut task: ScanTask, message: &str) {
    warn!("worker: task {} failed: {}", task.id, message);
    task.status = TaskStatus::Failed;
    task.error = message.to_string();
    task.results.clear();
    task.completed_at = Some(Utc::now());
    if let Err(e) = store.update_task(&task).await {
        error!("worker: failed to persist failed task {}: {}", task.id, e);
    }
}
