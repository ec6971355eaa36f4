use crate::models::{
    AccessTokenRecord, CloudMigrationSession, CloudMigrationSessionListResponse, CreateAccessTokenResponse, ItemStatus,
    MigrateDataResponse, MigrateDataResponseItem, MigrateDataType, RunRecord, RunStatus, SnapshotPage, SnapshotRecord,
    SnapshotStatus, SnapshotWithResults,
};
use crate::runner::RunDetails;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAccessTokenResponseDto {
    pub id: String,
    pub display_name: String,
    pub expires_at: String,
    pub first_used_at: String,
    pub last_used_at: String,
    pub created_at: String,
}

impl From<AccessTokenRecord> for GetAccessTokenResponseDto {
    fn from(value: AccessTokenRecord) -> Self {
        Self {
            id: value.id,
            display_name: value.display_name,
            expires_at: format_optional_time(Some(value.expires_at)),
            first_used_at: format_optional_time(value.first_used_at),
            last_used_at: format_optional_time(value.last_used_at),
            created_at: format_optional_time(Some(value.created_at)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccessTokenResponseDto {
    pub token: String,
}

impl From<CreateAccessTokenResponse> for CreateAccessTokenResponseDto {
    fn from(value: CreateAccessTokenResponse) -> Self {
        Self { token: value.token }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudMigrationSessionResponseDto {
    pub uid: String,
    pub slug: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<CloudMigrationSession> for CloudMigrationSessionResponseDto {
    fn from(value: CloudMigrationSession) -> Self {
        Self {
            uid: value.uid,
            slug: value.slug,
            created: value.created,
            updated: value.updated,
        }
    }
}

impl From<CloudMigrationSessionResponseDto> for CloudMigrationSession {
    fn from(value: CloudMigrationSessionResponseDto) -> Self {
        Self {
            uid: value.uid,
            slug: value.slug,
            created: value.created,
            updated: value.updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudMigrationSessionListResponseDto {
    pub sessions: Vec<CloudMigrationSessionResponseDto>,
}

pub fn convert_session_list_to_dto(list: CloudMigrationSessionListResponse) -> CloudMigrationSessionListResponseDto {
    CloudMigrationSessionListResponseDto {
        sessions: list.sessions.into_iter().map(Into::into).collect(),
    }
}

pub fn convert_session_list_from_dto(dto: CloudMigrationSessionListResponseDto) -> CloudMigrationSessionListResponse {
    CloudMigrationSessionListResponse {
        sessions: dto.sessions.into_iter().map(Into::into).collect(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMigrationSessionRequestDto {
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateDataResponseItemDto {
    #[serde(rename = "type")]
    pub item_type: MigrateDataType,
    pub ref_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<MigrateDataResponseItem> for MigrateDataResponseItemDto {
    fn from(value: MigrateDataResponseItem) -> Self {
        Self {
            item_type: value.item_type,
            ref_id: value.ref_id,
            status: value.status,
            error: value.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateDataResponseDto {
    #[serde(rename = "uid")]
    pub run_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub items: Vec<MigrateDataResponseItemDto>,
}

pub fn convert_migrate_data_response_to_dto(response: MigrateDataResponse) -> MigrateDataResponseDto {
    MigrateDataResponseDto {
        run_uid: response.run_uid,
        status: None,
        error: None,
        items: response.items.into_iter().map(Into::into).collect(),
    }
}

impl From<RunDetails> for MigrateDataResponseDto {
    fn from(value: RunDetails) -> Self {
        Self {
            status: Some(value.status),
            error: value.run.error_message,
            run_uid: value.run.uid,
            items: value.items.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateDataResponseListDto {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMigrationRunListDto {
    pub runs: Vec<MigrateDataResponseListDto>,
}

impl From<Vec<RunRecord>> for CloudMigrationRunListDto {
    fn from(value: Vec<RunRecord>) -> Self {
        Self {
            runs: value
                .into_iter()
                .map(|run| MigrateDataResponseListDto { uid: run.uid })
                .collect(),
        }
    }
}

/// Wire form of a snapshot status. Anything this build cannot name is `UNKNOWN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatusDto {
    Initializing,
    Creating,
    PendingUpload,
    Uploading,
    PendingProcessing,
    Processing,
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

pub fn from_snapshot_status(status: SnapshotStatus) -> SnapshotStatusDto {
    match status {
        SnapshotStatus::Initializing => SnapshotStatusDto::Initializing,
        SnapshotStatus::Creating => SnapshotStatusDto::Creating,
        SnapshotStatus::PendingUpload => SnapshotStatusDto::PendingUpload,
        SnapshotStatus::Uploading => SnapshotStatusDto::Uploading,
        SnapshotStatus::PendingProcessing => SnapshotStatusDto::PendingProcessing,
        SnapshotStatus::Processing => SnapshotStatusDto::Processing,
        SnapshotStatus::Finished => SnapshotStatusDto::Finished,
        SnapshotStatus::Error => SnapshotStatusDto::Error,
        SnapshotStatus::Unknown => SnapshotStatusDto::Unknown,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDto {
    pub uid: String,
    pub status: SnapshotStatusDto,
    pub session_uid: String,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl From<SnapshotRecord> for SnapshotDto {
    fn from(value: SnapshotRecord) -> Self {
        Self {
            uid: value.uid,
            status: from_snapshot_status(value.status),
            session_uid: value.session_uid,
            created: value.created,
            finished: value.finished,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSnapshotResponseDto {
    #[serde(flatten)]
    pub snapshot: SnapshotDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<MigrateDataResponseItemDto>,
}

impl From<SnapshotWithResults> for GetSnapshotResponseDto {
    fn from(value: SnapshotWithResults) -> Self {
        let error = value.snapshot.error_message.clone();
        Self {
            snapshot: value.snapshot.into(),
            error,
            results: value.results.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotListResponseDto {
    pub snapshots: Vec<SnapshotDto>,
    pub total: usize,
    pub has_more: bool,
}

impl From<SnapshotPage> for SnapshotListResponseDto {
    fn from(value: SnapshotPage) -> Self {
        let has_more = value.has_more();
        Self {
            total: value.total,
            has_more,
            snapshots: value.snapshots.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponseDto {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponseDto {
    pub kind: String,
    pub message: String,
}

fn format_optional_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{
        convert_session_list_from_dto, convert_session_list_to_dto, from_snapshot_status,
        CloudMigrationSessionListResponseDto, GetAccessTokenResponseDto, MigrateDataResponseDto,
        MigrateDataResponseItemDto, SnapshotStatusDto,
    };
    use crate::models::{
        AccessTokenRecord, CloudMigrationSession, CloudMigrationSessionListResponse, MigrateDataResponseItem,
        MigrateDataType, RunRecord, RunStatus, SnapshotStatus,
    };
    use crate::runner::RunDetails;
    use chrono::{Duration, Utc};

    #[test]
    fn session_list_survives_the_wire_in_order() {
        let now = Utc::now();
        let list = CloudMigrationSessionListResponse {
            sessions: vec![
                CloudMigrationSession {
                    uid: "s-1".to_string(),
                    slug: "acme".to_string(),
                    created: now - Duration::minutes(5),
                    updated: now - Duration::minutes(1),
                },
                CloudMigrationSession {
                    uid: "s-2".to_string(),
                    slug: "globex".to_string(),
                    created: now,
                    updated: now,
                },
            ],
        };

        let wire = serde_json::to_string(&convert_session_list_to_dto(list.clone())).expect("encode");
        let decoded: CloudMigrationSessionListResponseDto = serde_json::from_str(&wire).expect("decode");
        assert_eq!(convert_session_list_from_dto(decoded), list);
    }

    #[test]
    fn token_descriptor_leaves_unused_stamps_empty() {
        let now = Utc::now();
        let dto = GetAccessTokenResponseDto::from(AccessTokenRecord {
            id: "t-1".to_string(),
            display_name: "cloud-migration-acme".to_string(),
            expires_at: now,
            first_used_at: None,
            last_used_at: None,
            created_at: now,
        });
        assert!(dto.first_used_at.is_empty());
        assert!(dto.expires_at.ends_with('Z'));

        let value = serde_json::to_value(&dto).expect("encode");
        assert!(value.get("displayName").is_some());
        assert!(value.get("lastUsedAt").is_some());
    }

    #[test]
    fn item_error_is_omitted_when_absent() {
        let ok = serde_json::to_value(MigrateDataResponseItemDto::from(MigrateDataResponseItem::ok(
            MigrateDataType::Folder,
            "f-1",
        )))
        .expect("encode");
        assert_eq!(ok["type"], "FOLDER");
        assert_eq!(ok["refId"], "f-1");
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn failed_run_carries_its_error() {
        let details = RunDetails {
            run: RunRecord {
                uid: "run-1".to_string(),
                session_uid: "s-1".to_string(),
                total_items: Some(0),
                error_message: Some("failed to list resources: disk gone".to_string()),
                created_at: Utc::now(),
            },
            status: RunStatus::Failed,
            items: Vec::new(),
        };
        let value = serde_json::to_value(MigrateDataResponseDto::from(details)).expect("encode");
        assert_eq!(value["uid"], "run-1");
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["error"], "failed to list resources: disk gone");
    }

    #[test]
    fn unknown_statuses_map_to_unknown_on_the_wire() {
        assert_eq!(from_snapshot_status(SnapshotStatus::Unknown), SnapshotStatusDto::Unknown);
        assert_eq!(
            serde_json::to_value(from_snapshot_status(SnapshotStatus::PendingProcessing)).expect("encode"),
            "PENDING_PROCESSING"
        );
        let parsed: SnapshotStatusDto = serde_json::from_str("\"ARCHIVED\"").expect("decode");
        assert_eq!(parsed, SnapshotStatusDto::Unknown);
    }
}
