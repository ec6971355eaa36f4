use crate::adapters::{CloudClient, RemoteProcessingStatus, SnapshotArtifact};
use crate::cancellation::CancelFlag;
use crate::errors::{AppError, AppResult};
use crate::models::{MigrationSettings, ResourcePayload, SessionContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const MIN_BACKOFF_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            max_attempts: settings.max_transfer_attempts.max(1),
            backoff_ms: settings.retry_backoff_ms,
        }
    }

    /// Delay before the attempt following `attempt` (1-based), doubling each time.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let multiplier: u64 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(multiplier).max(MIN_BACKOFF_MS))
    }
}

/// Moves data to the hosted side, retrying transport failures with backoff.
/// Any other error is returned on the first occurrence.
#[derive(Clone)]
pub struct Uploader {
    client: Arc<dyn CloudClient>,
}

impl Uploader {
    pub fn new(client: Arc<dyn CloudClient>) -> Self {
        Self { client }
    }

    pub async fn migrate_item(
        &self,
        context: &SessionContext,
        payload: &ResourcePayload,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> AppResult<()> {
        let client = self.client.as_ref();
        with_retry("migrate_item", &payload.resource.ref_id, policy, cancel, move || {
            client.migrate_resource(context, payload)
        })
        .await
    }

    pub async fn upload_snapshot(
        &self,
        context: &SessionContext,
        artifact: &SnapshotArtifact,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> AppResult<()> {
        let client = self.client.as_ref();
        with_retry("upload_snapshot", &artifact.snapshot_uid, policy, cancel, move || {
            client.upload_snapshot(context, artifact)
        })
        .await
    }

    pub async fn start_processing(
        &self,
        context: &SessionContext,
        snapshot_uid: &str,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> AppResult<()> {
        let client = self.client.as_ref();
        with_retry("start_processing", snapshot_uid, policy, cancel, move || {
            client.start_processing(context, snapshot_uid)
        })
        .await
    }

    pub async fn poll_status(
        &self,
        context: &SessionContext,
        snapshot_uid: &str,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> AppResult<RemoteProcessingStatus> {
        let client = self.client.as_ref();
        with_retry("poll_status", snapshot_uid, policy, cancel, move || {
            client.processing_status(context, snapshot_uid)
        })
        .await
    }
}

async fn with_retry<T, F, Fut>(
    operation: &str,
    subject: &str,
    policy: RetryPolicy,
    cancel: &CancelFlag,
    mut call: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Conflict(format!("{operation} for {subject} was cancelled")));
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation,
                    subject,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transfer failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) if error.is_transient() => {
                return Err(AppError::TransientTransport(format!(
                    "{} (gave up after {} attempts)",
                    error.message(),
                    attempt
                )));
            }
            Err(error) => return Err(error),
        }
    }
}
