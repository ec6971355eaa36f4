use super::builder::SnapshotBuilder;
use crate::adapters::RemoteState;
use crate::cancellation::{CancelFlag, CancellationRegistry};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ListSnapshotsQuery, MigrateDataResponseItem, SnapshotPage, SnapshotRecord, SnapshotStatus, SnapshotWithResults,
};
use crate::scheduler::{JobKind, ScheduledJob, Scheduler};
use crate::session::SessionManager;
use crate::uploader::{RetryPolicy, Uploader};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const SNAPSHOT_CANCELLED_MESSAGE: &str = "snapshot cancelled";
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// States whose driving job lives only in memory and is lost on restart.
const JOB_DRIVEN_STATES: [SnapshotStatus; 3] = [
    SnapshotStatus::Initializing,
    SnapshotStatus::Creating,
    SnapshotStatus::Uploading,
];

const PROCESSING_STATES: [SnapshotStatus; 2] = [SnapshotStatus::PendingProcessing, SnapshotStatus::Processing];

#[derive(Clone)]
pub struct SnapshotLifecycle {
    db: Arc<Database>,
    sessions: SessionManager,
    builder: SnapshotBuilder,
    uploader: Uploader,
    scheduler: Scheduler,
    cancellations: CancellationRegistry,
}

impl SnapshotLifecycle {
    pub fn new(
        db: Arc<Database>,
        sessions: SessionManager,
        builder: SnapshotBuilder,
        uploader: Uploader,
        scheduler: Scheduler,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            db,
            sessions,
            builder,
            uploader,
            scheduler,
            cancellations,
        }
    }

    pub async fn create_snapshot(&self, session_uid: &str) -> AppResult<SnapshotRecord> {
        self.sessions.get_session(session_uid)?;
        let uid = Uuid::new_v4().to_string();
        let snapshot = self.db.insert_snapshot(&uid, session_uid)?;

        if let Err(error) = self
            .scheduler
            .enqueue(ScheduledJob::new(JobKind::SnapshotBuild, &uid, session_uid))
            .await
        {
            self.fail(&uid, error.message())?;
            return Err(error);
        }

        tracing::info!(session_uid = %session_uid, snapshot_uid = %uid, "queued snapshot build");
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, session_uid: &str, uid: &str) -> AppResult<SnapshotWithResults> {
        let mut snapshot = self.snapshot_in_session(session_uid, uid)?;
        if snapshot.status.is_processing() {
            snapshot = self.reconcile(uid).await?;
        }
        let results = self.db.list_snapshot_results(uid)?;
        Ok(SnapshotWithResults { snapshot, results })
    }

    pub fn list_snapshots(&self, session_uid: &str, query: ListSnapshotsQuery) -> AppResult<SnapshotPage> {
        let (offset, limit) = page_bounds(query)?;
        self.sessions.get_session(session_uid)?;
        let (snapshots, total) = self.db.list_snapshots(session_uid, offset, limit)?;
        Ok(SnapshotPage {
            snapshots,
            total,
            offset,
            limit,
        })
    }

    /// Moves a built snapshot to UPLOADING before returning, then transfers it in the background.
    pub async fn upload_snapshot(&self, session_uid: &str, uid: &str) -> AppResult<SnapshotRecord> {
        let snapshot = self.snapshot_in_session(session_uid, uid)?;
        if snapshot.status != SnapshotStatus::PendingUpload {
            return Err(AppError::Conflict(format!(
                "snapshot {uid} is {} and cannot be uploaded",
                snapshot.status.as_str()
            )));
        }
        let uploading = self.db.transition_snapshot(uid, SnapshotStatus::Uploading, None)?;

        if let Err(error) = self
            .scheduler
            .enqueue(ScheduledJob::new(JobKind::SnapshotUpload, uid, session_uid))
            .await
        {
            self.fail(uid, error.message())?;
            return Err(error);
        }

        tracing::info!(session_uid = %session_uid, snapshot_uid = %uid, "queued snapshot upload");
        Ok(uploading)
    }

    pub fn cancel_snapshot(&self, session_uid: &str, uid: &str) -> AppResult<SnapshotRecord> {
        self.snapshot_in_session(session_uid, uid)?;
        let cancelled = self
            .db
            .transition_snapshot(uid, SnapshotStatus::Error, Some(SNAPSHOT_CANCELLED_MESSAGE))?;
        self.cancellations.cancel(uid);
        self.cancellations.release(uid);
        tracing::info!(session_uid = %session_uid, snapshot_uid = %uid, "cancelled snapshot");
        Ok(cancelled)
    }

    /// Scheduler entry point for INITIALIZING snapshots. Returns true on failure.
    pub async fn execute_build(&self, uid: &str) -> bool {
        let cancel = match self.db.get_snapshot(uid) {
            Ok(Some(snapshot)) => self.cancellations.register(&snapshot.session_uid, uid),
            Ok(None) => return true,
            Err(error) => {
                tracing::error!(snapshot_uid = %uid, error = %error, "failed to load snapshot for build");
                return true;
            }
        };
        let outcome = self.drive_build(uid, &cancel).await;
        self.cancellations.release(uid);
        self.report(uid, "build", outcome)
    }

    async fn drive_build(&self, uid: &str, cancel: &CancelFlag) -> AppResult<()> {
        let Some(snapshot) = self.advance(uid, SnapshotStatus::Creating, None)? else {
            return Ok(());
        };

        let built = match self.builder.build(&snapshot.session_uid, uid, cancel).await {
            Ok(built) => built,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(failure) => {
                self.append(uid, &failure.failures)?;
                self.fail(uid, failure.error.message())?;
                return Err(failure.error);
            }
        };
        if cancel.is_cancelled() {
            return Ok(());
        }

        if !self.append(uid, &built.failures)? {
            return Ok(());
        }
        match self.db.set_snapshot_artifact(
            uid,
            &built.artifact_path.to_string_lossy(),
            built.manifest.len(),
        ) {
            Ok(()) => {}
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(snapshot_uid = %uid, reason = %reason, "skipped artifact record");
                return Ok(());
            }
            Err(error) => return Err(error),
        }
        self.advance(uid, SnapshotStatus::PendingUpload, None)?;
        Ok(())
    }

    /// Scheduler entry point for UPLOADING snapshots. Returns true on failure.
    pub async fn execute_upload(&self, uid: &str) -> bool {
        let snapshot = match self.db.get_snapshot(uid) {
            Ok(Some(snapshot)) if snapshot.status == SnapshotStatus::Uploading => snapshot,
            Ok(_) => return false,
            Err(error) => {
                tracing::error!(snapshot_uid = %uid, error = %error, "failed to load snapshot for upload");
                return true;
            }
        };
        let cancel = self.cancellations.register(&snapshot.session_uid, uid);
        let outcome = self.drive_upload(&snapshot, &cancel).await;
        self.cancellations.release(uid);
        self.report(uid, "upload", outcome)
    }

    async fn drive_upload(
        &self,
        snapshot: &SnapshotRecord,
        cancel: &CancelFlag,
    ) -> AppResult<()> {
        let uid = snapshot.uid.as_str();
        let outcome = async {
            let context = self.sessions.session_context(&snapshot.session_uid)?;
            let path = snapshot
                .artifact_path
                .as_deref()
                .ok_or_else(|| AppError::Internal(format!("snapshot {uid} has no artifact")))?;
            let artifact = self.builder.load(Path::new(path)).await?;
            self.builder.open(&artifact)?;

            let policy = RetryPolicy::from_settings(&self.db.get_settings()?);
            self.uploader.upload_snapshot(&context, &artifact, policy, cancel).await?;
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.uploader.start_processing(&context, uid, policy, cancel).await
        }
        .await;

        match outcome {
            Ok(()) if cancel.is_cancelled() => Ok(()),
            Ok(()) => {
                self.advance(uid, SnapshotStatus::PendingProcessing, None)?;
                Ok(())
            }
            Err(_) if cancel.is_cancelled() => Ok(()),
            Err(error) => {
                self.fail(uid, error.message())?;
                Err(error)
            }
        }
    }

    /// One poll step against the remote side for a snapshot awaiting processing.
    pub async fn reconcile(&self, uid: &str) -> AppResult<SnapshotRecord> {
        let snapshot = self
            .db
            .get_snapshot(uid)?
            .ok_or_else(|| AppError::NotFound(format!("snapshot {uid} not found")))?;
        if !snapshot.status.is_processing() {
            return Ok(snapshot);
        }
        let context = match self.sessions.session_context(&snapshot.session_uid) {
            Ok(context) => context,
            Err(AppError::NotFound(_)) => return Ok(snapshot),
            Err(error) => return Err(error),
        };

        let cancel = self.cancellations.register(&snapshot.session_uid, uid);
        if cancel.is_cancelled() {
            return self.current(uid);
        }

        let policy = RetryPolicy::from_settings(&self.db.get_settings()?);
        match self.uploader.poll_status(&context, uid, policy, &cancel).await {
            Ok(_) if cancel.is_cancelled() => {}
            Ok(remote) => {
                if self.append(uid, &remote.results)? {
                    self.apply_remote_state(uid, remote.state)?;
                }
            }
            Err(_) if cancel.is_cancelled() => {}
            Err(error @ (AppError::TransientTransport(_) | AppError::RemoteProcessing(_))) => {
                tracing::warn!(snapshot_uid = %uid, error = %error, "snapshot status poll failed");
                self.fail(uid, error.message())?;
            }
            Err(error) => return Err(error),
        }

        let current = self.current(uid)?;
        if current.status.is_terminal() {
            self.cancellations.release(uid);
        }
        Ok(current)
    }

    fn apply_remote_state(&self, uid: &str, state: RemoteState) -> AppResult<()> {
        match state {
            RemoteState::Queued => {}
            RemoteState::Processing => {
                self.advance(uid, SnapshotStatus::Processing, None)?;
            }
            RemoteState::Finished => {
                self.advance(uid, SnapshotStatus::Processing, None)?;
                if self.advance(uid, SnapshotStatus::Finished, None)?.is_some() {
                    tracing::info!(snapshot_uid = %uid, "snapshot processing finished");
                }
            }
            RemoteState::Failed(message) => {
                tracing::warn!(snapshot_uid = %uid, error = %message, "remote processing failed");
                self.fail(uid, &message)?;
            }
        }
        Ok(())
    }

    /// Poller entry point: reconciles every snapshot awaiting remote processing.
    pub async fn reconcile_all(&self) -> usize {
        let pending = match self.db.list_snapshots_in_status(&PROCESSING_STATES) {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(error = %error, "failed to list snapshots awaiting processing");
                return 0;
            }
        };
        let mut reconciled = 0usize;
        for snapshot in pending {
            match self.reconcile(&snapshot.uid).await {
                Ok(_) => reconciled += 1,
                Err(error) => {
                    tracing::warn!(snapshot_uid = %snapshot.uid, error = %error, "snapshot reconcile failed");
                }
            }
        }
        reconciled
    }

    /// Fails snapshots whose in-memory job did not survive a restart.
    pub fn recover_on_startup(&self) -> AppResult<usize> {
        let mut interrupted = 0usize;
        for snapshot in self.db.list_snapshots_in_status(&JOB_DRIVEN_STATES)? {
            if self.fail(&snapshot.uid, INTERRUPTED_MESSAGE)? {
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "marked interrupted snapshots as failed on startup");
        }
        Ok(interrupted)
    }

    fn snapshot_in_session(&self, session_uid: &str, uid: &str) -> AppResult<SnapshotRecord> {
        self.sessions.get_session(session_uid)?;
        self.db
            .get_snapshot(uid)?
            .filter(|snapshot| snapshot.session_uid == session_uid)
            .ok_or_else(|| AppError::NotFound(format!("snapshot {uid} not found")))
    }

    fn current(&self, uid: &str) -> AppResult<SnapshotRecord> {
        self.db
            .get_snapshot(uid)?
            .ok_or_else(|| AppError::NotFound(format!("snapshot {uid} not found")))
    }

    /// Applies a transition, treating a lost race (cancel, delete, concurrent poll) as a no-op.
    fn advance(
        &self,
        uid: &str,
        next: SnapshotStatus,
        error_message: Option<&str>,
    ) -> AppResult<Option<SnapshotRecord>> {
        match self.db.transition_snapshot(uid, next, error_message) {
            Ok(record) => Ok(Some(record)),
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(snapshot_uid = %uid, reason = %reason, "skipped snapshot transition");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Appends results unless the snapshot already ended. Returns false on a lost race.
    fn append(&self, uid: &str, results: &[MigrateDataResponseItem]) -> AppResult<bool> {
        match self.db.append_snapshot_results(uid, results) {
            Ok(_) => Ok(true),
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(snapshot_uid = %uid, reason = %reason, "dropped late snapshot results");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    fn fail(&self, uid: &str, message: &str) -> AppResult<bool> {
        Ok(self.advance(uid, SnapshotStatus::Error, Some(message))?.is_some())
    }

    fn report(&self, uid: &str, stage: &str, outcome: AppResult<()>) -> bool {
        match outcome {
            Ok(()) => false,
            Err(error) => {
                tracing::error!(snapshot_uid = %uid, stage, error = %error, "snapshot job failed");
                true
            }
        }
    }
}

fn page_bounds(query: ListSnapshotsQuery) -> AppResult<(usize, usize)> {
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::Validation("offset must not be negative".to_string()));
    }
    let limit = match query.limit {
        None | Some(0) => DEFAULT_PAGE_LIMIT as i64,
        Some(limit) if limit < 0 => {
            return Err(AppError::Validation("limit must not be negative".to_string()));
        }
        Some(limit) => limit,
    };
    let to_usize = |value: i64| usize::try_from(value).map_err(|error| AppError::Validation(error.to_string()));
    Ok((to_usize(offset)?, to_usize(limit)?))
}

#[cfg(test)]
mod tests {
    use super::{SnapshotLifecycle, INTERRUPTED_MESSAGE, SNAPSHOT_CANCELLED_MESSAGE};
    use crate::adapters::{RemoteState, ResourceSource};
    use crate::cancellation::CancellationRegistry;
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{ItemStatus, ListSnapshotsQuery, MigrateDataResponseItem, MigrateDataType, SnapshotStatus};
    use crate::scheduler::Scheduler;
    use crate::session::SessionManager;
    use crate::snapshot::builder::SnapshotBuilder;
    use crate::test_support::{
        dashboards, seed_session, test_db, test_instance, test_sealer, ScriptedCloud, StaticResources,
    };
    use crate::token::TokenManager;
    use crate::uploader::Uploader;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        cloud: Arc<ScriptedCloud>,
        sessions: SessionManager,
        snapshots: SnapshotLifecycle,
        session_uid: String,
    }

    fn fixture(source: impl ResourceSource + 'static) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_db(&dir);
        db.update_settings(serde_json::json!({ "retryBackoffMs": 1, "maxTransferAttempts": 2 }))
            .expect("settings");
        let sealer = test_sealer();
        let session = seed_session(&db, &sealer, "acme");
        let registry = CancellationRegistry::new();
        let sessions = SessionManager::new(
            db.clone(),
            TokenManager::new(db.clone(), test_instance()),
            sealer.clone(),
            registry.clone(),
        );
        let cloud = Arc::new(ScriptedCloud::new());
        let snapshots = SnapshotLifecycle::new(
            db.clone(),
            sessions.clone(),
            SnapshotBuilder::new(Arc::new(source), sealer, dir.path().join("snapshots")),
            Uploader::new(cloud.clone()),
            Scheduler::new(2, 1, 16),
            registry,
        );
        Fixture {
            _dir: dir,
            db,
            cloud,
            sessions,
            snapshots,
            session_uid: session.uid,
        }
    }

    async fn built(fx: &Fixture) -> String {
        let snapshot = fx.snapshots.create_snapshot(&fx.session_uid).await.expect("create");
        assert_eq!(snapshot.status, SnapshotStatus::Initializing);
        fx.snapshots.execute_build(&snapshot.uid).await;
        snapshot.uid
    }

    async fn uploaded(fx: &Fixture) -> String {
        let uid = built(fx).await;
        fx.snapshots.upload_snapshot(&fx.session_uid, &uid).await.expect("upload");
        assert!(!fx.snapshots.execute_upload(&uid).await);
        uid
    }

    fn ok(ref_id: &str) -> MigrateDataResponseItem {
        MigrateDataResponseItem::ok(MigrateDataType::Dashboard, ref_id)
    }

    #[tokio::test]
    async fn snapshot_walks_the_full_lifecycle_with_growing_results() {
        let fx = fixture(StaticResources::new(dashboards(&["a", "b", "c"])).with_broken("c"));
        let uid = built(&fx).await;

        let pending = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(pending.snapshot.status, SnapshotStatus::PendingUpload);
        assert_eq!(pending.snapshot.item_count, 2);
        assert_eq!(pending.results.len(), 1);
        assert_eq!(pending.results[0].status, ItemStatus::Error);

        let uploading = fx.snapshots.upload_snapshot(&fx.session_uid, &uid).await.expect("upload");
        assert_eq!(uploading.status, SnapshotStatus::Uploading);
        assert!(!fx.snapshots.execute_upload(&uid).await);
        assert_eq!(
            fx.db.get_snapshot(&uid).expect("read").expect("snapshot").status,
            SnapshotStatus::PendingProcessing
        );

        fx.cloud.push_status(RemoteState::Queued, Vec::new());
        fx.cloud.push_status(RemoteState::Processing, vec![ok("b")]);
        fx.cloud.push_status(RemoteState::Finished, vec![ok("a"), ok("b")]);

        let queued = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(queued.snapshot.status, SnapshotStatus::PendingProcessing);

        let processing = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(processing.snapshot.status, SnapshotStatus::Processing);
        assert!(processing.snapshot.finished.is_none());
        let partial = processing.results.clone();
        assert_eq!(partial.len(), 2);

        let finished = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(finished.snapshot.status, SnapshotStatus::Finished);
        assert!(finished.snapshot.finished.is_some());
        assert_eq!(finished.results.len(), 3);
        assert_eq!(&finished.results[..partial.len()], partial.as_slice());

        let after = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(after.results, finished.results);
        assert_eq!(fx.cloud.poll_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn upload_requires_a_built_snapshot() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let snapshot = fx.snapshots.create_snapshot(&fx.session_uid).await.expect("create");
        assert!(matches!(
            fx.snapshots.upload_snapshot(&fx.session_uid, &snapshot.uid).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            fx.snapshots.upload_snapshot(&fx.session_uid, "missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_conflicts_afterwards() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = built(&fx).await;

        let cancelled = fx.snapshots.cancel_snapshot(&fx.session_uid, &uid).expect("cancel");
        assert_eq!(cancelled.status, SnapshotStatus::Error);
        assert_eq!(cancelled.error_message.as_deref(), Some(SNAPSHOT_CANCELLED_MESSAGE));
        assert!(cancelled.finished.is_some());

        assert!(matches!(
            fx.snapshots.cancel_snapshot(&fx.session_uid, &uid),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            fx.snapshots.upload_snapshot(&fx.session_uid, &uid).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cancel_during_upload_wins_over_the_in_flight_transfer() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = built(&fx).await;
        fx.snapshots.upload_snapshot(&fx.session_uid, &uid).await.expect("upload");
        let gate = fx.cloud.gate_uploads();

        let lifecycle = fx.snapshots.clone();
        let upload_uid = uid.clone();
        let upload = tokio::spawn(async move { lifecycle.execute_upload(&upload_uid).await });
        while fx.cloud.upload_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.snapshots.cancel_snapshot(&fx.session_uid, &uid).expect("cancel");
        gate.notify_one();
        upload.await.expect("upload task");

        let snapshot = fx.db.get_snapshot(&uid).expect("read").expect("snapshot");
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert_eq!(snapshot.error_message.as_deref(), Some(SNAPSHOT_CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn cancel_during_build_leaves_no_artifact_or_results() {
        let (source, gate) = StaticResources::new(dashboards(&["a", "b"])).with_broken("b").gated();
        let fx = fixture(source);
        let snapshot = fx.snapshots.create_snapshot(&fx.session_uid).await.expect("create");

        let lifecycle = fx.snapshots.clone();
        let build_uid = snapshot.uid.clone();
        let build = tokio::spawn(async move { lifecycle.execute_build(&build_uid).await });
        while fx.db.get_snapshot(&snapshot.uid).expect("read").expect("snapshot").status != SnapshotStatus::Creating {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let cancelled = fx.snapshots.cancel_snapshot(&fx.session_uid, &snapshot.uid).expect("cancel");
        assert_eq!(cancelled.status, SnapshotStatus::Error);
        gate.notify_one();
        assert!(!build.await.expect("build task"));

        let after = fx.snapshots.get_snapshot(&fx.session_uid, &snapshot.uid).await.expect("get");
        assert_eq!(after.snapshot.status, SnapshotStatus::Error);
        assert_eq!(after.snapshot.error_message.as_deref(), Some(SNAPSHOT_CANCELLED_MESSAGE));
        assert!(after.snapshot.artifact_path.is_none());
        assert!(after.results.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_poll_drops_the_late_results() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = uploaded(&fx).await;
        fx.cloud.push_status(RemoteState::Processing, vec![ok("early")]);
        fx.snapshots.reconcile(&uid).await.expect("reconcile");
        assert_eq!(
            fx.db.get_snapshot(&uid).expect("read").expect("snapshot").status,
            SnapshotStatus::Processing
        );

        let gate = fx.cloud.gate_polls();
        fx.cloud.push_status(RemoteState::Finished, vec![ok("early"), ok("late")]);
        let lifecycle = fx.snapshots.clone();
        let poll_uid = uid.clone();
        let poll = tokio::spawn(async move { lifecycle.reconcile(&poll_uid).await });
        while fx.cloud.poll_calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.snapshots.cancel_snapshot(&fx.session_uid, &uid).expect("cancel");
        let at_cancel = fx.db.list_snapshot_results(&uid).expect("results");
        gate.notify_one();
        let reconciled = poll.await.expect("poll task").expect("reconcile");

        assert_eq!(reconciled.status, SnapshotStatus::Error);
        assert_eq!(reconciled.error_message.as_deref(), Some(SNAPSHOT_CANCELLED_MESSAGE));
        assert_eq!(fx.db.list_snapshot_results(&uid).expect("results"), at_cancel);
        assert_eq!(
            at_cancel.iter().map(|item| item.ref_id.as_str()).collect::<Vec<_>>(),
            vec!["early"]
        );
    }

    #[tokio::test]
    async fn cancel_while_pending_processing_stops_polling() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = uploaded(&fx).await;

        let cancelled = fx.snapshots.cancel_snapshot(&fx.session_uid, &uid).expect("cancel");
        assert_eq!(cancelled.status, SnapshotStatus::Error);
        fx.cloud.push_status(RemoteState::Finished, vec![ok("a")]);

        let after = fx.snapshots.get_snapshot(&fx.session_uid, &uid).await.expect("get");
        assert_eq!(after.snapshot.status, SnapshotStatus::Error);
        assert!(after.results.is_empty());
        assert_eq!(fx.snapshots.reconcile_all().await, 0);
        assert_eq!(fx.cloud.poll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn build_with_no_serializable_items_records_each_failure() {
        let fx = fixture(StaticResources::new(dashboards(&["a", "b"])).with_broken("a").with_broken("b"));
        let snapshot = fx.snapshots.create_snapshot(&fx.session_uid).await.expect("create");
        assert!(fx.snapshots.execute_build(&snapshot.uid).await);

        let failed = fx.snapshots.get_snapshot(&fx.session_uid, &snapshot.uid).await.expect("get");
        assert_eq!(failed.snapshot.status, SnapshotStatus::Error);
        assert_eq!(
            failed.results.iter().map(|item| item.ref_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(failed.results.iter().all(|item| item.status == ItemStatus::Error));
    }

    #[tokio::test]
    async fn failed_builds_and_uploads_end_in_error() {
        let fx = fixture(StaticResources::failing_enumeration("disk gone"));
        let snapshot = fx.snapshots.create_snapshot(&fx.session_uid).await.expect("create");
        assert!(fx.snapshots.execute_build(&snapshot.uid).await);
        let snapshot = fx.db.get_snapshot(&snapshot.uid).expect("read").expect("snapshot");
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert_eq!(snapshot.error_message.as_deref(), Some("disk gone"));

        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        fx.cloud.fail_uploads(5);
        let uid = built(&fx).await;
        fx.snapshots.upload_snapshot(&fx.session_uid, &uid).await.expect("upload");
        assert!(fx.snapshots.execute_upload(&uid).await);
        let snapshot = fx.db.get_snapshot(&uid).expect("read").expect("snapshot");
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert!(snapshot
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn remote_failures_are_recorded_without_retry() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = uploaded(&fx).await;
        fx.cloud
            .push_status(RemoteState::Failed("dashboard schema rejected".to_string()), vec![]);

        let snapshot = fx.snapshots.reconcile(&uid).await.expect("reconcile");
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert_eq!(snapshot.error_message.as_deref(), Some("dashboard schema rejected"));
        assert_eq!(fx.cloud.poll_calls.load(Ordering::SeqCst), 1);

        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = uploaded(&fx).await;
        fx.cloud
            .push_poll_error(AppError::TransientTransport("timeout".to_string()));
        fx.cloud
            .push_poll_error(AppError::TransientTransport("timeout".to_string()));
        let snapshot = fx.snapshots.reconcile(&uid).await.expect("reconcile");
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        assert_eq!(fx.cloud.poll_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pagination_defaults_and_bounds() {
        let fx = fixture(StaticResources::new(Vec::new()));
        for index in 0..250 {
            fx.db
                .insert_snapshot(&format!("snap-{index:03}"), &fx.session_uid)
                .expect("insert");
        }

        let first = fx
            .snapshots
            .list_snapshots(&fx.session_uid, ListSnapshotsQuery::default())
            .expect("page");
        assert_eq!(first.snapshots.len(), 100);
        assert_eq!(first.total, 250);
        assert!(first.has_more());
        assert_eq!(first.snapshots[0].uid, "snap-249");

        let zero_limit = ListSnapshotsQuery {
            offset: Some(200),
            limit: Some(0),
        };
        let last = fx.snapshots.list_snapshots(&fx.session_uid, zero_limit).expect("page");
        assert_eq!(last.snapshots.len(), 50);
        assert!(!last.has_more());

        let past_end = ListSnapshotsQuery {
            offset: Some(300),
            limit: Some(10),
        };
        let empty = fx.snapshots.list_snapshots(&fx.session_uid, past_end).expect("page");
        assert!(empty.snapshots.is_empty());

        for query in [
            ListSnapshotsQuery {
                offset: Some(-1),
                limit: None,
            },
            ListSnapshotsQuery {
                offset: None,
                limit: Some(-5),
            },
        ] {
            assert!(matches!(
                fx.snapshots.list_snapshots(&fx.session_uid, query),
                Err(AppError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn restart_fails_job_driven_states_only() {
        let fx = fixture(StaticResources::new(Vec::new()));
        fx.db.insert_snapshot("init", &fx.session_uid).expect("insert");
        fx.db.insert_snapshot("uploading", &fx.session_uid).expect("insert");
        fx.db.force_snapshot_status("uploading", "UPLOADING").expect("force");
        fx.db.insert_snapshot("processing", &fx.session_uid).expect("insert");
        fx.db.force_snapshot_status("processing", "PROCESSING").expect("force");
        fx.db.insert_snapshot("ready", &fx.session_uid).expect("insert");
        fx.db.force_snapshot_status("ready", "PENDING_UPLOAD").expect("force");

        assert_eq!(fx.snapshots.recover_on_startup().expect("recover"), 2);
        for uid in ["init", "uploading"] {
            let snapshot = fx.db.get_snapshot(uid).expect("read").expect("snapshot");
            assert_eq!(snapshot.status, SnapshotStatus::Error);
            assert_eq!(snapshot.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        }
        let processing = fx.db.get_snapshot("processing").expect("read").expect("snapshot");
        assert_eq!(processing.status, SnapshotStatus::Processing);

        fx.cloud.push_status(RemoteState::Finished, Vec::new());
        assert_eq!(fx.snapshots.reconcile_all().await, 1);
        let processing = fx.db.get_snapshot("processing").expect("read").expect("snapshot");
        assert_eq!(processing.status, SnapshotStatus::Finished);
    }

    #[tokio::test]
    async fn snapshots_of_deleted_sessions_are_hidden() {
        let fx = fixture(StaticResources::new(dashboards(&["a"])));
        let uid = built(&fx).await;
        fx.sessions.delete_session(&fx.session_uid).await.expect("delete");

        assert!(matches!(
            fx.snapshots.get_snapshot(&fx.session_uid, &uid).await,
            Err(AppError::NotFound(_))
        ));
        let snapshot = fx.db.get_snapshot(&uid).expect("read").expect("snapshot");
        assert_eq!(snapshot.error_message.as_deref(), Some("session deleted"));
    }
}
