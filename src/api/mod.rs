pub mod dtos;

use crate::errors::{AppError, AppResult};
use crate::models::{ListSnapshotsQuery, MigrationSettings};
use crate::service::CloudMigrationService;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dtos::{
    convert_migrate_data_response_to_dto, convert_session_list_to_dto, CloudMigrationRunListDto,
    CloudMigrationSessionListResponseDto, CloudMigrationSessionRequestDto, CloudMigrationSessionResponseDto,
    CreateAccessTokenResponseDto, CreateSnapshotResponseDto, ErrorResponseDto, GetAccessTokenResponseDto,
    GetSnapshotResponseDto, MigrateDataResponseDto, SnapshotDto, SnapshotListResponseDto,
};
use serde_json::Value;
use std::sync::Arc;

type SharedService = Arc<CloudMigrationService>;
type ApiResult<T> = AppResult<Json<T>>;

/// Builds the `/cloudmigration` surface, served both at the root and under `/api`.
pub fn router(service: SharedService) -> Router {
    let routes = Router::new()
        .route("/cloudmigration/token", get(get_token).post(issue_token))
        .route("/cloudmigration/token/{id}", delete(delete_token))
        .route("/cloudmigration/session", get(list_sessions).post(create_session))
        .route("/cloudmigration/session/{uid}", get(get_session).delete(delete_session))
        .route("/cloudmigration/session/{uid}/run", get(list_runs).post(start_run))
        .route("/cloudmigration/session/{uid}/run/{run_uid}", get(get_run))
        .route(
            "/cloudmigration/session/{uid}/snapshot",
            get(list_snapshots).post(create_snapshot),
        )
        .route("/cloudmigration/session/{uid}/snapshot/{snapshot_uid}", get(get_snapshot))
        .route(
            "/cloudmigration/session/{uid}/snapshot/{snapshot_uid}/upload",
            post(upload_snapshot),
        )
        .route(
            "/cloudmigration/session/{uid}/snapshot/{snapshot_uid}/cancel",
            post(cancel_snapshot),
        )
        .route("/cloudmigration/settings", get(get_settings).patch(update_settings));

    Router::new()
        .nest("/api", routes.clone())
        .merge(routes)
        .fallback(no_route)
        .with_state(service)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorResponseDto {
            kind: self.kind().to_string(),
            message: self.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn no_route(method: Method, uri: Uri) -> AppError {
    AppError::NotFound(format!("no route for {method} {}", uri.path()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::Validation(format!("malformed request body: {}", rejection.body_text())))
}

fn page_query(query: Result<Query<ListSnapshotsQuery>, QueryRejection>) -> AppResult<ListSnapshotsQuery> {
    query
        .map(|Query(query)| query)
        .map_err(|rejection| AppError::Validation(format!("invalid page query: {}", rejection.body_text())))
}

async fn get_token(State(service): State<SharedService>) -> ApiResult<GetAccessTokenResponseDto> {
    Ok(Json(service.tokens().get_token()?.into()))
}

async fn issue_token(State(service): State<SharedService>) -> ApiResult<CreateAccessTokenResponseDto> {
    Ok(Json(service.tokens().issue_token()?.into()))
}

async fn delete_token(State(service): State<SharedService>, Path(id): Path<String>) -> AppResult<StatusCode> {
    service.tokens().delete_token(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sessions(State(service): State<SharedService>) -> ApiResult<CloudMigrationSessionListResponseDto> {
    Ok(Json(convert_session_list_to_dto(service.sessions().list_sessions()?)))
}

async fn create_session(
    State(service): State<SharedService>,
    payload: Result<Json<CloudMigrationSessionRequestDto>, JsonRejection>,
) -> ApiResult<CloudMigrationSessionResponseDto> {
    let request = json_body(payload)?;
    let session = service.sessions().create_session(&request.auth_token).await?;
    Ok(Json(session.into()))
}

async fn get_session(
    State(service): State<SharedService>,
    Path(uid): Path<String>,
) -> ApiResult<CloudMigrationSessionResponseDto> {
    Ok(Json(service.sessions().get_session(&uid)?.into()))
}

async fn delete_session(State(service): State<SharedService>, Path(uid): Path<String>) -> AppResult<StatusCode> {
    service.sessions().delete_session(&uid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_run(State(service): State<SharedService>, Path(uid): Path<String>) -> ApiResult<MigrateDataResponseDto> {
    let started = service.runs().start_run(&uid).await?;
    Ok(Json(convert_migrate_data_response_to_dto(started)))
}

async fn list_runs(State(service): State<SharedService>, Path(uid): Path<String>) -> ApiResult<CloudMigrationRunListDto> {
    Ok(Json(service.runs().list_runs(&uid)?.into()))
}

async fn get_run(
    State(service): State<SharedService>,
    Path((uid, run_uid)): Path<(String, String)>,
) -> ApiResult<MigrateDataResponseDto> {
    Ok(Json(service.runs().get_run(&uid, &run_uid)?.into()))
}

async fn create_snapshot(
    State(service): State<SharedService>,
    Path(uid): Path<String>,
) -> ApiResult<CreateSnapshotResponseDto> {
    let snapshot = service.snapshots().create_snapshot(&uid).await?;
    Ok(Json(CreateSnapshotResponseDto { uid: snapshot.uid }))
}

async fn list_snapshots(
    State(service): State<SharedService>,
    Path(uid): Path<String>,
    query: Result<Query<ListSnapshotsQuery>, QueryRejection>,
) -> ApiResult<SnapshotListResponseDto> {
    let query = page_query(query)?;
    Ok(Json(service.snapshots().list_snapshots(&uid, query)?.into()))
}

async fn get_snapshot(
    State(service): State<SharedService>,
    Path((uid, snapshot_uid)): Path<(String, String)>,
) -> ApiResult<GetSnapshotResponseDto> {
    let snapshot = service.snapshots().get_snapshot(&uid, &snapshot_uid).await?;
    Ok(Json(snapshot.into()))
}

async fn upload_snapshot(
    State(service): State<SharedService>,
    Path((uid, snapshot_uid)): Path<(String, String)>,
) -> ApiResult<SnapshotDto> {
    let snapshot = service.snapshots().upload_snapshot(&uid, &snapshot_uid).await?;
    Ok(Json(snapshot.into()))
}

async fn cancel_snapshot(
    State(service): State<SharedService>,
    Path((uid, snapshot_uid)): Path<(String, String)>,
) -> ApiResult<SnapshotDto> {
    let snapshot = service.snapshots().cancel_snapshot(&uid, &snapshot_uid)?;
    Ok(Json(snapshot.into()))
}

async fn get_settings(State(service): State<SharedService>) -> ApiResult<MigrationSettings> {
    Ok(Json(service.get_settings()?))
}

async fn update_settings(
    State(service): State<SharedService>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<MigrationSettings> {
    let update = json_body(payload)?;
    Ok(Json(service.update_settings(update)?))
}

#[cfg(test)]
mod tests {
    use super::page_query;
    use crate::errors::AppError;
    use crate::models::ListSnapshotsQuery;
    use axum::extract::Query;
    use axum::http::{StatusCode, Uri};
    use axum::response::IntoResponse;
    use serde_json::Value;

    fn query_of(uri: &'static str) -> Result<ListSnapshotsQuery, AppError> {
        page_query(Query::<ListSnapshotsQuery>::try_from_uri(&Uri::from_static(uri)))
    }

    #[test]
    fn page_queries_are_percent_decoded() {
        let query = query_of("/cloudmigration/session/s-1/snapshot?offset=%32&limit=%31%30").expect("query");
        assert_eq!(query.offset, Some(2));
        assert_eq!(query.limit, Some(10));

        let query = query_of("/cloudmigration/session/s-1/snapshot").expect("query");
        assert_eq!(query.offset, None);
        assert_eq!(query.limit, None);
    }

    #[test]
    fn non_integer_page_values_are_validation_errors() {
        assert!(matches!(query_of("/x?limit=ten"), Err(AppError::Validation(_))));
        assert!(matches!(query_of("/x?offset=1.5"), Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn errors_render_kind_and_message() {
        let response = AppError::Conflict("snapshot is FINISHED".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["kind"], "CONFLICT");
        assert_eq!(body["message"], "snapshot is FINISHED");
    }
}
