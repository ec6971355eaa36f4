use super::lifecycle::SnapshotLifecycle;
use crate::db::Database;
use crate::models::MigrationSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Reconciles snapshots awaiting remote processing until the handle is aborted.
/// The interval is re-read from settings on every tick.
pub fn spawn_poller(lifecycle: SnapshotLifecycle, db: Arc<Database>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = poll_interval(&db);
            tokio::time::sleep(interval).await;
            let reconciled = lifecycle.reconcile_all().await;
            if reconciled > 0 {
                tracing::debug!(count = reconciled, "reconciled snapshots with remote processing");
            }
        }
    })
}

fn poll_interval(db: &Database) -> Duration {
    let millis = match db.get_settings() {
        Ok(settings) => settings.poll_interval_ms,
        Err(error) => {
            tracing::warn!(error = %error, "failed to read poll interval; using default");
            MigrationSettings::default().poll_interval_ms
        }
    };
    Duration::from_millis(millis.max(MIN_POLL_INTERVAL_MS))
}
