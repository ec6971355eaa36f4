use crate::adapters::directory::DirectoryResourceSource;
use crate::adapters::outbox::OutboxCloud;
use crate::adapters::{CloudClient, ResourceSource};
use crate::cancellation::CancellationRegistry;
use crate::config::ServiceConfig;
use crate::crypto::Sealer;
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::MigrationSettings;
use crate::runner::RunExecutor;
use crate::scheduler::{JobKind, ScheduledJob, Scheduler};
use crate::session::SessionManager;
use crate::snapshot::{spawn_poller, SnapshotBuilder, SnapshotLifecycle};
use crate::token::TokenManager;
use crate::uploader::Uploader;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub resumed_runs: usize,
    pub interrupted_snapshots: usize,
}

/// Wires the store, the managers and the job scheduler into one service.
pub struct CloudMigrationService {
    config: ServiceConfig,
    db: Arc<Database>,
    scheduler: Scheduler,
    tokens: TokenManager,
    sessions: SessionManager,
    runs: RunExecutor,
    snapshots: SnapshotLifecycle,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl CloudMigrationService {
    /// Uses the file-system collaborators configured for the data directory.
    pub fn from_config(config: ServiceConfig) -> AppResult<Arc<Self>> {
        let source = Arc::new(DirectoryResourceSource::new(config.resources_dir()));
        let cloud = Arc::new(OutboxCloud::new(config.outbox_dir()));
        let sealer = config.sealer()?;
        Self::new(config, sealer, source, cloud)
    }

    pub fn new(
        config: ServiceConfig,
        sealer: Sealer,
        source: Arc<dyn ResourceSource>,
        cloud: Arc<dyn CloudClient>,
    ) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&config.database_path())?);
        let scheduler = Scheduler::new(
            config.scheduler.global_limit,
            config.scheduler.per_session_limit,
            config.scheduler.max_queue_size,
        );
        let cancellations = CancellationRegistry::new();
        let uploader = Uploader::new(cloud);

        let tokens = TokenManager::new(db.clone(), config.instance.clone());
        let sessions = SessionManager::new(db.clone(), tokens.clone(), sealer.clone(), cancellations.clone());
        let runs = RunExecutor::new(
            db.clone(),
            sessions.clone(),
            source.clone(),
            uploader.clone(),
            scheduler.clone(),
            cancellations.clone(),
        );
        let snapshots = SnapshotLifecycle::new(
            db.clone(),
            sessions.clone(),
            SnapshotBuilder::new(source, sealer, config.snapshots_dir()),
            uploader,
            scheduler.clone(),
            cancellations,
        );

        let this = Arc::new(Self {
            config,
            db,
            scheduler: scheduler.clone(),
            tokens,
            sessions,
            runs,
            snapshots,
            poller: Mutex::new(None),
        });

        let weak = Arc::downgrade(&this);
        scheduler.set_executor(Arc::new(move |job: ScheduledJob| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(strong) = weak.upgrade() {
                    strong.execute_job(job).await
                } else {
                    true
                }
            })
        }));

        Ok(this)
    }

    /// Recovers interrupted work and starts the background tasks. Needs a tokio runtime.
    pub async fn start(&self) -> AppResult<StartupReport> {
        let interrupted_snapshots = self.snapshots.recover_on_startup()?;
        self.scheduler.start();
        let resumed_runs = self.runs.resume_incomplete_runs().await?;

        let handle = spawn_poller(self.snapshots.clone(), self.db.clone());
        {
            let mut poller = self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = poller.replace(handle) {
                previous.abort();
            }
        }

        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            instance = %self.config.instance.slug,
            resumed_runs,
            interrupted_snapshots,
            "cloud migration service started"
        );
        Ok(StartupReport {
            resumed_runs,
            interrupted_snapshots,
        })
    }

    async fn execute_job(&self, job: ScheduledJob) -> bool {
        match job.kind {
            JobKind::Run => self.runs.execute_run(&job.job_id).await,
            JobKind::SnapshotBuild => self.snapshots.execute_build(&job.job_id).await,
            JobKind::SnapshotUpload => self.snapshots.execute_upload(&job.job_id).await,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn runs(&self) -> &RunExecutor {
        &self.runs
    }

    pub fn snapshots(&self) -> &SnapshotLifecycle {
        &self.snapshots
    }

    pub fn get_settings(&self) -> AppResult<MigrationSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<MigrationSettings> {
        let settings = self.db.update_settings(update)?;
        tracing::info!(
            item_workers = settings.item_workers,
            max_transfer_attempts = settings.max_transfer_attempts,
            poll_interval_ms = settings.poll_interval_ms,
            "updated migration settings"
        );
        Ok(settings)
    }
}

impl Drop for CloudMigrationService {
    fn drop(&mut self) {
        let poller = self.poller.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }
}
