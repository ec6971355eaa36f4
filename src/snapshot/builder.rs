use crate::adapters::{ResourceSource, SnapshotArtifact};
use crate::cancellation::CancelFlag;
use crate::crypto::Sealer;
use crate::errors::{AppError, AppResult};
use crate::models::{MigrateDataResponseItem, ResourcePayload, ResourceRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BuiltSnapshot {
    pub artifact_path: PathBuf,
    pub manifest: Vec<ResourceRef>,
    /// Items that could not be serialized; they are not part of the artifact.
    pub failures: Vec<MigrateDataResponseItem>,
}

/// A build that produced no artifact. `failures` holds the items that were
/// rejected before the build gave up.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: AppError,
    pub failures: Vec<MigrateDataResponseItem>,
}

impl From<AppError> for BuildFailure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            failures: Vec::new(),
        }
    }
}

impl From<std::io::Error> for BuildFailure {
    fn from(error: std::io::Error) -> Self {
        AppError::from(error).into()
    }
}

impl From<serde_json::Error> for BuildFailure {
    fn from(error: serde_json::Error) -> Self {
        AppError::from(error).into()
    }
}

/// Captures every resource of the instance into one sealed artifact on disk.
#[derive(Clone)]
pub struct SnapshotBuilder {
    source: Arc<dyn ResourceSource>,
    sealer: Sealer,
    snapshots_dir: PathBuf,
}

impl SnapshotBuilder {
    pub fn new(source: Arc<dyn ResourceSource>, sealer: Sealer, snapshots_dir: PathBuf) -> Self {
        Self {
            source,
            sealer,
            snapshots_dir,
        }
    }

    pub async fn build(
        &self,
        session_uid: &str,
        snapshot_uid: &str,
        cancel: &CancelFlag,
    ) -> Result<BuiltSnapshot, BuildFailure> {
        let resources = self.source.list_resources().await?;

        let mut payloads = Vec::with_capacity(resources.len());
        let mut failures = Vec::new();
        for resource in resources {
            if cancel.is_cancelled() {
                return Err(AppError::Conflict(format!("snapshot {snapshot_uid} was cancelled")).into());
            }
            match self.source.serialize(&resource).await {
                Ok(data) => payloads.push(ResourcePayload { resource, data }),
                Err(error) => {
                    tracing::warn!(snapshot_uid = %snapshot_uid, ref_id = %resource.ref_id, error = %error, "failed to serialize snapshot item");
                    failures.push(MigrateDataResponseItem::failed(
                        resource.item_type,
                        resource.ref_id,
                        error.message(),
                    ));
                }
            }
        }

        if payloads.is_empty() && !failures.is_empty() {
            return Err(BuildFailure {
                error: AppError::Validation(format!(
                    "none of the {} resources could be serialized",
                    failures.len()
                )),
                failures,
            });
        }

        let manifest = payloads
            .iter()
            .map(|payload| payload.resource.clone())
            .collect::<Vec<_>>();
        let sealed = self.sealer.seal(&serde_json::to_vec(&payloads)?)?;
        let artifact = SnapshotArtifact {
            snapshot_uid: snapshot_uid.to_string(),
            session_uid: session_uid.to_string(),
            manifest: manifest.clone(),
            sealed,
        };

        tokio::fs::create_dir_all(&self.snapshots_dir).await?;
        let artifact_path = self.snapshots_dir.join(format!("{snapshot_uid}.enc.json"));
        tokio::fs::write(&artifact_path, serde_json::to_vec_pretty(&artifact)?).await?;

        tracing::info!(
            snapshot_uid = %snapshot_uid,
            items = manifest.len(),
            failed = failures.len(),
            path = %artifact_path.display(),
            "built snapshot artifact"
        );
        Ok(BuiltSnapshot {
            artifact_path,
            manifest,
            failures,
        })
    }

    pub async fn load(&self, artifact_path: &Path) -> AppResult<SnapshotArtifact> {
        let raw = tokio::fs::read(artifact_path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn open(&self, artifact: &SnapshotArtifact) -> AppResult<Vec<ResourcePayload>> {
        let plaintext = self.sealer.open(&artifact.sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
