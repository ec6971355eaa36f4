use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrateDataType {
    Dashboard,
    Datasource,
    Folder,
}

impl MigrateDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dashboard => "DASHBOARD",
            Self::Datasource => "DATASOURCE",
            Self::Folder => "FOLDER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DASHBOARD" => Some(Self::Dashboard),
            "DATASOURCE" => Some(Self::Datasource),
            "FOLDER" => Some(Self::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Ok,
    Error,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateDataResponseItem {
    #[serde(rename = "type")]
    pub item_type: MigrateDataType,
    pub ref_id: String,
    pub status: ItemStatus,
    pub error: Option<String>,
}

impl MigrateDataResponseItem {
    pub fn ok(item_type: MigrateDataType, ref_id: impl Into<String>) -> Self {
        Self {
            item_type,
            ref_id: ref_id.into(),
            status: ItemStatus::Ok,
            error: None,
        }
    }

    pub fn failed(item_type: MigrateDataType, ref_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_type,
            ref_id: ref_id.into(),
            status: ItemStatus::Error,
            error: Some(error.into()),
        }
    }
}

/// A run and the items recorded for it so far, in enumeration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateDataResponse {
    pub run_uid: String,
    pub items: Vec<MigrateDataResponseItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub uid: String,
    pub session_uid: String,
    pub total_items: Option<usize>,
    /// Set when the run could not enumerate its resources.
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors | Self::Failed)
    }
}

/// Run status is never stored; it is read off the recorded items.
pub fn derive_run_status(
    total_items: Option<usize>,
    failure: Option<&str>,
    items: &[MigrateDataResponseItem],
) -> RunStatus {
    if failure.is_some() {
        return RunStatus::Failed;
    }
    let Some(total) = total_items else {
        return RunStatus::Pending;
    };
    if items.len() < total {
        return RunStatus::Running;
    }
    if items.iter().any(|item| item.status == ItemStatus::Error) {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMigrationSession {
    pub uid: String,
    pub slug: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMigrationSessionListResponse {
    pub sessions: Vec<CloudMigrationSession>,
}

/// Identity of the hosted destination a token was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInstance {
    pub stack_id: u64,
    pub slug: String,
    pub region_slug: String,
    pub cluster_slug: String,
}

impl Default for CloudInstance {
    fn default() -> Self {
        Self {
            stack_id: 0,
            slug: "local".to_string(),
            region_slug: "local".to_string(),
            cluster_slug: "local".to_string(),
        }
    }
}

/// Everything the transport needs to talk to a session's destination.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: CloudMigrationSession,
    pub instance: CloudInstance,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRecord {
    pub id: String,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessTokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Initializing,
    Creating,
    PendingUpload,
    Uploading,
    PendingProcessing,
    Processing,
    Finished,
    Error,
    /// Persisted value this build does not recognise. Never produced by a transition.
    Unknown,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Creating => "CREATING",
            Self::PendingUpload => "PENDING_UPLOAD",
            Self::Uploading => "UPLOADING",
            Self::PendingProcessing => "PENDING_PROCESSING",
            Self::Processing => "PROCESSING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "INITIALIZING" => Self::Initializing,
            "CREATING" => Self::Creating,
            "PENDING_UPLOAD" => Self::PendingUpload,
            "UPLOADING" => Self::Uploading,
            "PENDING_PROCESSING" => Self::PendingProcessing,
            "PROCESSING" => Self::Processing,
            "FINISHED" => Self::Finished,
            "ERROR" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    pub fn is_processing(self) -> bool {
        matches!(self, Self::PendingProcessing | Self::Processing)
    }

    pub fn can_transition_to(self, next: SnapshotStatus) -> bool {
        match (self, next) {
            (Self::Finished | Self::Error, _) => false,
            (_, Self::Error) => true,
            (Self::Initializing, Self::Creating)
            | (Self::Creating, Self::PendingUpload)
            | (Self::PendingUpload, Self::Uploading)
            | (Self::Uploading, Self::PendingProcessing)
            | (Self::PendingProcessing, Self::Processing)
            | (Self::Processing, Self::Finished) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub uid: String,
    pub session_uid: String,
    pub status: SnapshotStatus,
    pub error_message: Option<String>,
    pub artifact_path: Option<String>,
    pub item_count: usize,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWithResults {
    pub snapshot: SnapshotRecord,
    pub results: Vec<MigrateDataResponseItem>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPage {
    pub snapshots: Vec<SnapshotRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl SnapshotPage {
    pub fn has_more(&self) -> bool {
        self.offset + self.snapshots.len() < self.total
    }
}

/// A resource eligible for migration, before serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub item_type: MigrateDataType,
    pub ref_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePayload {
    #[serde(flatten)]
    pub resource: ResourceRef,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationSettings {
    pub item_workers: usize,
    pub max_transfer_attempts: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub token_ttl_days: u32,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            item_workers: 4,
            max_transfer_attempts: 3,
            retry_backoff_ms: 500,
            poll_interval_ms: 5_000,
            token_ttl_days: 7,
        }
    }
}
