use super::{CloudClient, RemoteProcessingStatus, RemoteState, SnapshotArtifact};
use crate::errors::{AppError, AppResult};
use crate::models::{MigrateDataResponseItem, ResourcePayload, SessionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessingState {
    polls: u32,
}

/// Stages everything that would be sent to the hosted instance under a local
/// directory. Processing reports half of the manifest on the first poll and
/// finishes on the second, which mirrors how the hosted side streams results.
#[derive(Debug, Clone)]
pub struct OutboxCloud {
    root: PathBuf,
    /// One lock per snapshot directory around `processing.json`.
    processing_locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl OutboxCloud {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            processing_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn processing_lock(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .processing_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    fn snapshot_dir(&self, context: &SessionContext, snapshot_uid: &str) -> PathBuf {
        self.root
            .join(&context.instance.slug)
            .join("snapshots")
            .join(snapshot_uid)
    }
}

#[async_trait]
impl CloudClient for OutboxCloud {
    async fn migrate_resource(&self, context: &SessionContext, payload: &ResourcePayload) -> AppResult<()> {
        let dir = self
            .root
            .join(&context.instance.slug)
            .join("items")
            .join(payload.resource.item_type.as_str().to_ascii_lowercase());
        write_json(&dir.join(format!("{}.json", payload.resource.ref_id)), payload).await
    }

    async fn upload_snapshot(&self, context: &SessionContext, artifact: &SnapshotArtifact) -> AppResult<()> {
        let dir = self.snapshot_dir(context, &artifact.snapshot_uid);
        write_json(&dir.join("artifact.json"), artifact).await
    }

    async fn start_processing(&self, context: &SessionContext, snapshot_uid: &str) -> AppResult<()> {
        let dir = self.snapshot_dir(context, snapshot_uid);
        if !dir.join("artifact.json").is_file() {
            return Err(AppError::RemoteProcessing(format!(
                "snapshot {snapshot_uid} was never uploaded"
            )));
        }
        let lock = self.processing_lock(&dir);
        let _guard = lock.lock().await;
        write_json(&dir.join("processing.json"), &ProcessingState::default()).await
    }

    async fn processing_status(
        &self,
        context: &SessionContext,
        snapshot_uid: &str,
    ) -> AppResult<RemoteProcessingStatus> {
        let dir = self.snapshot_dir(context, snapshot_uid);
        let lock = self.processing_lock(&dir);
        let guard = lock.lock().await;
        let state_path = dir.join("processing.json");
        if !state_path.is_file() {
            return Ok(RemoteProcessingStatus {
                state: RemoteState::Queued,
                results: Vec::new(),
            });
        }

        let artifact: SnapshotArtifact = read_json(&dir.join("artifact.json")).await?;
        let mut state: ProcessingState = read_json(&state_path).await?;
        state.polls += 1;
        write_json(&state_path, &state).await?;
        drop(guard);

        let results = artifact
            .manifest
            .iter()
            .map(|resource| MigrateDataResponseItem::ok(resource.item_type, resource.ref_id.clone()))
            .collect::<Vec<_>>();

        if state.polls == 1 {
            let half = results.len() / 2;
            Ok(RemoteProcessingStatus {
                state: RemoteState::Processing,
                results: results.into_iter().take(half).collect(),
            })
        } else {
            Ok(RemoteProcessingStatus {
                state: RemoteState::Finished,
                results,
            })
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| AppError::TransientTransport(error.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|error| AppError::TransientTransport(error.to_string()))
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> AppResult<T> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|error| AppError::TransientTransport(error.to_string()))?;
    Ok(serde_json::from_slice(&raw)?)
}
