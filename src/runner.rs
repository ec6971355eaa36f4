use crate::adapters::ResourceSource;
use crate::cancellation::{CancelFlag, CancellationRegistry};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    derive_run_status, MigrateDataResponse, MigrateDataResponseItem, MigrateDataType, ResourcePayload, ResourceRef,
    RunRecord, RunStatus, SessionContext,
};
use crate::scheduler::{JobKind, ScheduledJob, Scheduler};
use crate::session::SessionManager;
use crate::uploader::{RetryPolicy, Uploader};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

pub const RUN_CANCELLED_MESSAGE: &str = "run cancelled";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub run: RunRecord,
    pub status: RunStatus,
    pub items: Vec<MigrateDataResponseItem>,
}

#[derive(Clone)]
pub struct RunExecutor {
    db: Arc<Database>,
    sessions: SessionManager,
    source: Arc<dyn ResourceSource>,
    uploader: Uploader,
    scheduler: Scheduler,
    cancellations: CancellationRegistry,
}

impl RunExecutor {
    pub fn new(
        db: Arc<Database>,
        sessions: SessionManager,
        source: Arc<dyn ResourceSource>,
        uploader: Uploader,
        scheduler: Scheduler,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            db,
            sessions,
            source,
            uploader,
            scheduler,
            cancellations,
        }
    }

    pub async fn start_run(&self, session_uid: &str) -> AppResult<MigrateDataResponse> {
        self.sessions.get_session(session_uid)?;
        let run_uid = Uuid::new_v4().to_string();
        self.db.insert_run(&run_uid, session_uid)?;

        if let Err(error) = self
            .scheduler
            .enqueue(ScheduledJob::new(JobKind::Run, &run_uid, session_uid))
            .await
        {
            self.db.delete_run(&run_uid)?;
            return Err(error);
        }

        tracing::info!(session_uid = %session_uid, run_uid = %run_uid, "queued migration run");
        Ok(MigrateDataResponse {
            run_uid,
            items: Vec::new(),
        })
    }

    pub fn get_run(&self, session_uid: &str, run_uid: &str) -> AppResult<RunDetails> {
        self.sessions.get_session(session_uid)?;
        let run = self
            .db
            .get_run(run_uid)?
            .filter(|run| run.session_uid == session_uid)
            .ok_or_else(|| AppError::NotFound(format!("run {run_uid} not found")))?;
        let items = self.db.list_run_items(run_uid)?;
        Ok(RunDetails {
            status: derive_run_status(run.total_items, run.error_message.as_deref(), &items),
            run,
            items,
        })
    }

    pub fn list_runs(&self, session_uid: &str) -> AppResult<Vec<RunRecord>> {
        self.sessions.get_session(session_uid)?;
        self.db.list_runs(session_uid)
    }

    /// Re-queues runs interrupted by a restart. Items already recorded are kept.
    pub async fn resume_incomplete_runs(&self) -> AppResult<usize> {
        let runs = self.db.list_incomplete_runs()?;
        let mut resumed = 0usize;
        for run in runs {
            match self
                .scheduler
                .enqueue(ScheduledJob::new(JobKind::Run, &run.uid, &run.session_uid))
                .await
            {
                Ok(()) => resumed += 1,
                Err(error) => {
                    tracing::warn!(run_uid = %run.uid, error = %error, "failed to resume run");
                }
            }
        }
        if resumed > 0 {
            tracing::warn!(count = resumed, "resumed interrupted migration runs on startup");
        }
        Ok(resumed)
    }

    /// Scheduler entry point. Returns true when the run could not be driven.
    pub async fn execute_run(&self, run_uid: &str) -> bool {
        match self.drive_run(run_uid).await {
            Ok(()) => false,
            Err(error) => {
                tracing::error!(run_uid = %run_uid, error = %error, "migration run failed");
                true
            }
        }
    }

    async fn drive_run(&self, run_uid: &str) -> AppResult<()> {
        let run = self
            .db
            .get_run(run_uid)?
            .ok_or_else(|| AppError::NotFound(format!("run {run_uid} not found")))?;
        let context = match self.sessions.session_context(&run.session_uid) {
            Ok(context) => context,
            Err(AppError::NotFound(_)) => {
                tracing::info!(run_uid = %run_uid, session_uid = %run.session_uid, "session is gone; skipping run");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let cancel = self.cancellations.register(&run.session_uid, run_uid);
        let outcome = self.process_run(&run, context, cancel).await;
        self.cancellations.release(run_uid);
        outcome
    }

    async fn process_run(&self, run: &RunRecord, context: SessionContext, cancel: CancelFlag) -> AppResult<()> {
        let resources = match self.source.list_resources().await {
            Ok(resources) => resources,
            Err(error) => {
                tracing::error!(run_uid = %run.uid, error = %error, "resource enumeration failed");
                self.db
                    .fail_run(&run.uid, &format!("failed to list resources: {}", error.message()))?;
                return Ok(());
            }
        };
        let total_items = resources.len();
        self.db.set_run_total(&run.uid, total_items)?;

        let recorded = self
            .db
            .list_run_items(&run.uid)?
            .into_iter()
            .map(|item| (item.item_type, item.ref_id))
            .collect::<HashSet<(MigrateDataType, String)>>();

        // A delete that landed before the flag was registered is only visible in the store.
        let session_gone = self.db.get_session(&run.session_uid)?.is_none();

        let settings = self.db.get_settings()?;
        let policy = RetryPolicy::from_settings(&settings);
        let semaphore = Arc::new(Semaphore::new(settings.item_workers.max(1)));
        let context = Arc::new(context);
        let mut workers = JoinSet::new();

        for (position, resource) in resources.into_iter().enumerate() {
            if recorded.contains(&(resource.item_type, resource.ref_id.clone())) {
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|error| AppError::Internal(error.to_string()))?;
            let executor = self.clone();
            let context = context.clone();
            let cancel = cancel.clone();
            let run_uid = run.uid.clone();

            workers.spawn(async move {
                let _permit = permit;
                let item = if session_gone || cancel.is_cancelled() {
                    MigrateDataResponseItem::failed(resource.item_type, resource.ref_id.clone(), RUN_CANCELLED_MESSAGE)
                } else {
                    executor.migrate_item(&context, &resource, policy, &cancel).await
                };
                if let Err(error) = executor.db.insert_run_item(&run_uid, position, &item) {
                    tracing::error!(run_uid = %run_uid, ref_id = %item.ref_id, error = %error, "failed to record run item");
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                tracing::error!(run_uid = %run.uid, error = %error, "run item worker panicked");
            }
        }

        let items = self.db.list_run_items(&run.uid)?;
        let status = derive_run_status(Some(total_items), None, &items);
        let failed = items.iter().filter(|item| item.error.is_some()).count();
        tracing::info!(
            run_uid = %run.uid,
            session_uid = %run.session_uid,
            items = items.len(),
            failed,
            status = ?status,
            "migration run finished"
        );
        Ok(())
    }

    async fn migrate_item(
        &self,
        context: &SessionContext,
        resource: &ResourceRef,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> MigrateDataResponseItem {
        let data = match self.source.serialize(resource).await {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(ref_id = %resource.ref_id, error = %error, "failed to serialize resource");
                return MigrateDataResponseItem::failed(resource.item_type, resource.ref_id.clone(), error.message());
            }
        };

        let payload = ResourcePayload {
            resource: resource.clone(),
            data,
        };
        match self.uploader.migrate_item(context, &payload, policy, cancel).await {
            Ok(()) => MigrateDataResponseItem::ok(resource.item_type, resource.ref_id.clone()),
            Err(_) if cancel.is_cancelled() => {
                MigrateDataResponseItem::failed(resource.item_type, resource.ref_id.clone(), RUN_CANCELLED_MESSAGE)
            }
            Err(error) => {
                tracing::warn!(ref_id = %resource.ref_id, error = %error, "failed to migrate resource");
                MigrateDataResponseItem::failed(resource.item_type, resource.ref_id.clone(), error.message())
            }
        }
    }
}
