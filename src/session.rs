use crate::cancellation::CancellationRegistry;
use crate::crypto::Sealer;
use crate::db::{timestamp_now, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{CloudMigrationSession, CloudMigrationSessionListResponse, SessionContext, SnapshotStatus};
use crate::token::TokenManager;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const SESSION_DELETED_MESSAGE: &str = "session deleted";

#[derive(Clone)]
pub struct SessionManager {
    db: Arc<Database>,
    tokens: TokenManager,
    sealer: Sealer,
    cancellations: CancellationRegistry,
    create_lock: Arc<Mutex<()>>,
}

impl SessionManager {
    pub fn new(
        db: Arc<Database>,
        tokens: TokenManager,
        sealer: Sealer,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            db,
            tokens,
            sealer,
            cancellations,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn create_session(&self, auth_token: &str) -> AppResult<CloudMigrationSession> {
        let auth_token = auth_token.trim();
        if auth_token.is_empty() {
            return Err(AppError::Validation("authToken is required".to_string()));
        }
        let instance = self.tokens.validate(auth_token)?;

        // Check-then-insert must not interleave with another create for the same slug.
        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.db.find_active_session_by_slug(&instance.slug)? {
            return Err(AppError::Conflict(format!(
                "session {} already targets {}",
                existing.uid, instance.slug
            )));
        }

        let now = timestamp_now();
        let session = CloudMigrationSession {
            uid: Uuid::new_v4().to_string(),
            slug: instance.slug.clone(),
            created: now,
            updated: now,
        };
        let sealed = self.sealer.seal_to_string(auth_token)?;
        self.db.insert_session(&session, &instance, &sealed)?;

        tracing::info!(session_uid = %session.uid, slug = %session.slug, stack_id = instance.stack_id, "created migration session");
        Ok(session)
    }

    pub fn get_session(&self, uid: &str) -> AppResult<CloudMigrationSession> {
        self.db
            .get_session(uid)?
            .ok_or_else(|| AppError::NotFound(format!("session {uid} not found")))
    }

    pub fn list_sessions(&self) -> AppResult<CloudMigrationSessionListResponse> {
        Ok(CloudMigrationSessionListResponse {
            sessions: self.db.list_sessions()?,
        })
    }

    /// Resolves the destination and decrypted token for work in a live session.
    pub fn session_context(&self, uid: &str) -> AppResult<SessionContext> {
        let stored = self
            .db
            .get_stored_session(uid)?
            .ok_or_else(|| AppError::NotFound(format!("session {uid} not found")))?;
        let auth_token = self.sealer.open_string(&stored.auth_token_sealed)?;
        Ok(SessionContext {
            session: stored.session,
            instance: stored.instance,
            auth_token,
        })
    }

    pub async fn delete_session(&self, uid: &str) -> AppResult<()> {
        if !self.db.mark_session_deleted(uid)? {
            return Err(AppError::NotFound(format!("session {uid} not found")));
        }

        let mut failed_snapshots = 0usize;
        for snapshot_uid in self.db.list_snapshot_uids_for_session(uid)? {
            match self
                .db
                .transition_snapshot(&snapshot_uid, SnapshotStatus::Error, Some(SESSION_DELETED_MESSAGE))
            {
                Ok(_) => failed_snapshots += 1,
                Err(AppError::Conflict(_)) => {}
                Err(error) => {
                    tracing::warn!(session_uid = %uid, snapshot_uid = %snapshot_uid, error = %error, "failed to stop snapshot of deleted session");
                }
            }
        }
        let cancelled = self.cancellations.cancel_session(uid);

        tracing::info!(
            session_uid = %uid,
            failed_snapshots,
            cancelled_jobs = cancelled,
            "deleted migration session"
        );
        Ok(())
    }
}
