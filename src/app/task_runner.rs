use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    app::errors::AppError,
    documents::DocumentStore,
    eid::Eid,
    entities::{EntityKind, SourceRecord},
    semantic::{self, EmbeddingProvider, EmbeddingRecord, EmbeddingStore},
};

/// How long finished tasks stay visible on the board.
pub const TASK_RETENTION: Duration = Duration::from_secs(10);

const WORKER_THREAD_NAME: &str = "refresh-worker";

pub fn now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Recompute the embedding of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub kind: EntityKind,
    pub entity_id: String,
}

impl RefreshJob {
    pub fn new(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Task {
    /// request to recompute an entity's embedding
    Refresh(RefreshJob),

    /// request to gracefully shutdown task queue
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: Eid,
    pub task: Task,
    pub status: Status,
}

/// Fire-and-forget job submission.
///
/// `schedule` returns as soon as the job is queued. Whatever happens to the
/// job afterwards is logged and recorded on the task board, never reported
/// back to the caller.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, job: RefreshJob) -> Result<(), AppError>;
}

struct BoardEntry {
    dump: TaskDump,
    finished_at: Option<Instant>,
}

/// In-memory record of queued, running and recently finished tasks.
///
/// Finished tasks stay visible for `retention` and are pruned whenever a
/// task is saved or the board is read.
#[derive(Clone)]
pub struct TaskBoard {
    tasks: Arc<RwLock<Vec<BoardEntry>>>,
    retention: Duration,
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new(TASK_RETENTION)
    }
}

impl TaskBoard {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            retention,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<BoardEntry>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(&self, tasks: &mut Vec<BoardEntry>) {
        tasks.retain(|entry| match entry.finished_at {
            Some(finished_at) => finished_at.elapsed() < self.retention,
            None => true,
        });
    }

    pub fn save_task(&self, task: Task, status: Status) -> Eid {
        let id = Eid::new();
        let mut tasks = self.write();
        self.prune(&mut tasks);
        tasks.push(BoardEntry {
            dump: TaskDump {
                id: id.clone(),
                task,
                status,
            },
            finished_at: None,
        });
        id
    }

    pub fn set_status(&self, id: &Eid, status: Status) {
        let finished = matches!(status, Status::Done | Status::Error(_));
        if let Some(entry) = self.write().iter_mut().find(|e| &e.dump.id == id) {
            entry.dump.status = status;
            entry.finished_at = finished.then(Instant::now);
        }
    }

    pub fn dump(&self) -> QueueDump {
        let mut tasks = self.write();
        self.prune(&mut tasks);
        QueueDump {
            queue: tasks.iter().map(|entry| entry.dump.clone()).collect(),
            now: now(),
        }
    }
}

/// Collaborators a refresh job needs.
#[derive(Clone)]
pub struct RefreshContext {
    pub docs: Arc<dyn DocumentStore>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub profile_embeddings: Arc<dyn EmbeddingStore>,
    pub item_embeddings: Arc<dyn EmbeddingStore>,
}

impl RefreshContext {
    pub fn embeddings_for(&self, kind: EntityKind) -> &Arc<dyn EmbeddingStore> {
        match kind {
            EntityKind::Profile => &self.profile_embeddings,
            EntityKind::Item => &self.item_embeddings,
        }
    }

    /// fetch -> normalize -> embed -> upsert
    ///
    /// The stored embedding is only touched by the final upsert, so a failure
    /// at any earlier step leaves the previous record in place.
    pub fn refresh(&self, job: &RefreshJob) -> Result<(), AppError> {
        let RefreshJob { kind, entity_id } = job;
        let kind = *kind;

        let doc = self
            .docs
            .get(kind.source_collection(), entity_id)?
            .ok_or_else(|| AppError::NotFound(format!("{kind} {entity_id}")))?;

        let record = SourceRecord::from_document(kind, entity_id, doc)
            .map_err(|err| anyhow!("malformed {kind} {entity_id}: {err}"))?;

        let text = semantic::build_text(&record, kind.fields());
        if text.is_empty() {
            log::debug!("{kind} {entity_id} has no usable fields");
        }

        let vector = self.provider.embed(&text)?;

        let embedding = EmbeddingRecord {
            entity_id: entity_id.clone(),
            vector,
            generated_at: Utc::now(),
            model: self.provider.name().to_string(),
            snapshot: semantic::snapshot(&record, kind.fields()),
        };

        self.embeddings_for(kind).upsert(entity_id, embedding)?;

        Ok(())
    }
}

/// Channel-backed scheduler running each job on its own worker thread,
/// with at most `max_threads` workers alive at a time.
pub struct TaskQueue {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    board: TaskBoard,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(TASK_RETENTION)
    }
}

impl TaskQueue {
    /// A stopped queue; call [`TaskQueue::start`] before scheduling.
    pub fn new(retention: Duration) -> Self {
        Self {
            tx: Mutex::new(None),
            handle: Mutex::new(None),
            board: TaskBoard::new(retention),
        }
    }

    pub fn start(&self, ctx: RefreshContext, max_threads: u16) {
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        let handle = std::thread::spawn({
            let board = self.board.clone();
            move || start_queue(task_rx, Arc::new(ctx), board, max_threads.max(1))
        });

        *lock(&self.tx) = Some(task_tx);
        *lock(&self.handle) = Some(handle);
    }

    /// Stop accepting jobs and let the dispatcher finish in-flight ones.
    pub fn shutdown(&self) {
        if let Some(tx) = lock(&self.tx).take() {
            if let Err(err) = tx.send(Task::Shutdown) {
                log::error!("failed to send shutdown to task queue: {err:?}");
            }
        }
    }

    /// Block until the dispatcher has exited.
    pub fn wait_finish(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            if let Err(err) = handle.join() {
                log::error!("task queue thread panicked: {err:?}");
            }
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }
}

impl TaskScheduler for TaskQueue {
    fn schedule(&self, job: RefreshJob) -> Result<(), AppError> {
        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or(AppError::QueueClosed)?;
        tx.send(Task::Refresh(job)).map_err(|_| AppError::QueueClosed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts live workers against a fixed limit.
struct Slots {
    running: Mutex<u16>,
    freed: Condvar,
    max_threads: u16,
}

impl Slots {
    fn new(max_threads: u16) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(0),
            freed: Condvar::new(),
            max_threads,
        })
    }

    /// Block until a worker may be started.
    fn acquire(self: &Arc<Self>) -> Slot {
        let mut running = lock(&self.running);
        while *running >= self.max_threads {
            running = self
                .freed
                .wait(running)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *running += 1;
        Slot(self.clone())
    }

    /// Block until every worker has released its slot.
    fn wait_idle(&self) {
        let mut running = lock(&self.running);
        if *running > 0 {
            log::info!("waiting for {} refresh tasks to finish", *running);
        }
        while *running > 0 {
            running = self
                .freed
                .wait(running)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Releases a worker slot when dropped, including on panic.
struct Slot(Arc<Slots>);

impl Drop for Slot {
    fn drop(&mut self) {
        let mut running = lock(&self.0.running);
        *running = running.saturating_sub(1);
        self.0.freed.notify_all();
    }
}

fn run_job(ctx: &RefreshContext, board: &TaskBoard, id: &Eid, job: &RefreshJob) {
    board.set_status(id, Status::InProgress);

    let status = match catch_unwind(AssertUnwindSafe(|| ctx.refresh(job))) {
        Ok(Ok(())) => {
            log::info!("refreshed {} {}", job.kind, job.entity_id);
            Status::Done
        }
        Ok(Err(err)) => {
            log::error!("refresh of {} {} failed: {err}", job.kind, job.entity_id);
            Status::Error(err.to_string())
        }
        Err(_) => {
            log::error!("refresh of {} {} panicked", job.kind, job.entity_id);
            Status::Error("task panicked".to_string())
        }
    };

    board.set_status(id, status);
}

pub fn start_queue(
    task_rx: mpsc::Receiver<Task>,
    ctx: Arc<RefreshContext>,
    board: TaskBoard,
    max_threads: u16,
) {
    let slots = Slots::new(max_threads);

    log::debug!("waiting for job");
    while let Ok(task) = task_rx.recv() {
        let job = match task {
            Task::Refresh(job) => job,
            Task::Shutdown => break,
        };

        log::debug!("got refresh job for {} {}", job.kind, job.entity_id);

        let id = board.save_task(Task::Refresh(job.clone()), Status::Pending);

        // the worker owns the slot, so it is freed once the worker is done
        let slot = slots.acquire();

        let spawned = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn({
                let ctx = ctx.clone();
                let board = board.clone();
                let id = id.clone();
                move || {
                    let _slot = slot;
                    run_job(&ctx, &board, &id, &job);
                }
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn refresh worker: {err}");
            board.set_status(&id, Status::Error(format!("failed to spawn worker: {err}")));
        }
    }

    // explicit shutdown, or every sender dropped
    slots.wait_idle();
}
