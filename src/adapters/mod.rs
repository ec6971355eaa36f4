pub mod directory;
pub mod outbox;

use crate::crypto::SealedPayload;
use crate::errors::AppResult;
use crate::models::{MigrateDataResponseItem, ResourcePayload, ResourceRef, SessionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Enumerates and serializes the local resources eligible for migration.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn list_resources(&self) -> AppResult<Vec<ResourceRef>>;

    /// Errors here are recorded against the item and never retried.
    async fn serialize(&self, resource: &ResourceRef) -> AppResult<serde_json::Value>;
}

/// Built snapshot as handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotArtifact {
    pub snapshot_uid: String,
    pub session_uid: String,
    pub manifest: Vec<ResourceRef>,
    pub sealed: SealedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Queued,
    Processing,
    Finished,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RemoteProcessingStatus {
    pub state: RemoteState,
    /// Every result known to the remote side so far, in any order.
    pub results: Vec<MigrateDataResponseItem>,
}

/// Transport to the hosted ingestion service. Network failures must surface as
/// `AppError::TransientTransport` so the uploader can retry them.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn migrate_resource(&self, context: &SessionContext, payload: &ResourcePayload) -> AppResult<()>;

    async fn upload_snapshot(&self, context: &SessionContext, artifact: &SnapshotArtifact) -> AppResult<()>;

    async fn start_processing(&self, context: &SessionContext, snapshot_uid: &str) -> AppResult<()>;

    async fn processing_status(
        &self,
        context: &SessionContext,
        snapshot_uid: &str,
    ) -> AppResult<RemoteProcessingStatus>;
}
