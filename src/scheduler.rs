use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Run,
    SnapshotBuild,
    SnapshotUpload,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::SnapshotBuild => "snapshot_build",
            Self::SnapshotUpload => "snapshot_upload",
        }
    }

    /// Uploads already hold a user-visible UPLOADING status, so they go first.
    fn priority(self) -> i64 {
        match self {
            Self::SnapshotUpload => 1,
            Self::Run | Self::SnapshotBuild => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job_id: String,
    pub session_uid: String,
    pub kind: JobKind,
    pub queued_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(kind: JobKind, job_id: impl Into<String>, session_uid: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            session_uid: session_uid.into(),
            kind,
            queued_at: Utc::now(),
        }
    }
}

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Executor = Arc<dyn Fn(ScheduledJob) -> ExecutorFuture + Send + Sync>;

#[derive(Default)]
struct Slots {
    global: usize,
    per_session: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Mutex<Vec<ScheduledJob>>>,
    slots: Arc<Mutex<Slots>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    global_limit: usize,
    per_session_limit: usize,
    max_queue_size: usize,
}

impl Scheduler {
    pub fn new(global_limit: usize, per_session_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            slots: Arc::new(Mutex::new(Slots::default())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            per_session_limit: per_session_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self
            .executor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *writer = Some(executor);
    }

    pub async fn enqueue(&self, job: ScheduledJob) -> AppResult<()> {
        {
            let mut queue = self.queue.lock().await;
            if queue
                .iter()
                .any(|queued| queued.job_id == job.job_id && queued.kind == job.kind)
            {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(AppError::Conflict(format!(
                    "job queue capacity exceeded (max {})",
                    self.max_queue_size
                )));
            }
            tracing::debug!(job_id = %job.job_id, kind = job.kind.as_str(), "queued job");
            queue.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            while let Some(job) = self.pick_next_job().await {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    let session_uid = job.session_uid.clone();
                    let job_id = job.job_id.clone();
                    let kind = job.kind;
                    let failed = scheduler.execute(job).await;
                    scheduler.release_slot(&session_uid).await;
                    if failed {
                        tracing::warn!(job_id = %job_id, kind = kind.as_str(), "scheduled job finished in failed state");
                    }
                    scheduler.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, job: ScheduledJob) -> bool {
        let executor = self
            .executor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match executor {
            Some(executor) => executor(job).await,
            None => true,
        }
    }

    /// Removes the best job whose session still has a free slot and reserves
    /// the slot for it. Ties go to the job queued first.
    async fn pick_next_job(&self) -> Option<ScheduledJob> {
        let mut queue = self.queue.lock().await;
        let mut slots = self.slots.lock().await;
        if queue.is_empty() || slots.global >= self.global_limit {
            return None;
        }

        let now = Utc::now();
        let best_index = queue
            .iter()
            .enumerate()
            .filter(|(_, job)| slots.per_session.get(&job.session_uid).copied().unwrap_or(0) < self.per_session_limit)
            .min_by_key(|(index, job)| (Reverse(effective_priority(job, now)), *index))
            .map(|(index, _)| index)?;

        let job = queue.remove(best_index);
        slots.global += 1;
        *slots.per_session.entry(job.session_uid.clone()).or_insert(0) += 1;
        Some(job)
    }

    async fn release_slot(&self, session_uid: &str) {
        let mut slots = self.slots.lock().await;
        slots.global = slots.global.saturating_sub(1);
        if let Some(entry) = slots.per_session.get_mut(session_uid) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                slots.per_session.remove(session_uid);
            }
        }
    }
}

fn effective_priority(job: &ScheduledJob, now: DateTime<Utc>) -> i64 {
    let waited = (now - job.queued_at).num_seconds().max(0);
    job.kind.priority() * 100 + waited / 15
}
