use crate::errors::{AppError, AppResult};
use crate::models::{
    AccessTokenRecord, CloudInstance, CloudMigrationSession, ItemStatus, MigrateDataResponseItem, MigrateDataType,
    MigrationSettings, RunRecord, SnapshotRecord, SnapshotStatus,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SESSION_COLUMNS: &str = "uid, slug, created_at, updated_at";
const SNAPSHOT_COLUMNS: &str =
    "uid, session_uid, status, error_message, artifact_path, item_count, created_at, updated_at, finished_at";
const RUN_COLUMNS: &str = "uid, session_uid, total_items, error_message, created_at";
const TOKEN_COLUMNS: &str = "id, display_name, expires_at, first_used_at, last_used_at, created_at";

/// Token row including the fields never exposed outside the token manager.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub record: AccessTokenRecord,
    pub secret_hash: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session: CloudMigrationSession,
    pub instance: CloudInstance,
    pub auth_token_sealed: String,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_settings(&self) -> AppResult<MigrationSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'migration'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<MigrationSettings>(&raw).unwrap_or_default()),
            None => Ok(MigrationSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<MigrationSettings> {
        if !update.is_object() {
            return Err(AppError::Validation("settings update must be a JSON object".to_string()));
        }
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: MigrationSettings =
            serde_json::from_value(merged).map_err(|error| AppError::Validation(error.to_string()))?;
        if settings.item_workers == 0 {
            return Err(AppError::Validation("itemWorkers must be at least 1".to_string()));
        }
        if settings.max_transfer_attempts == 0 {
            return Err(AppError::Validation("maxTransferAttempts must be at least 1".to_string()));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('migration', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, format_time(Utc::now())],
        )?;

        Ok(settings)
    }

    pub fn insert_token(&self, record: &AccessTokenRecord, secret_hash: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO access_tokens (id, display_name, secret_hash, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.display_name,
                secret_hash,
                format_time(record.created_at),
                format_time(record.expires_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent token that is neither deleted nor expired at `now`.
    pub fn get_active_token(&self, now: DateTime<Utc>) -> AppResult<Option<AccessTokenRecord>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM access_tokens
             WHERE deleted_at IS NULL AND expires_at > ?1
             ORDER BY created_at DESC LIMIT 1"
        );
        let token = conn
            .query_row(&query, [format_time(now)], parse_token_row)
            .optional()?;
        Ok(token)
    }

    pub fn get_stored_token(&self, id: &str) -> AppResult<Option<StoredToken>> {
        let conn = self.lock()?;
        let query = format!("SELECT {TOKEN_COLUMNS}, secret_hash, deleted_at FROM access_tokens WHERE id = ?1");
        let token = conn
            .query_row(&query, [id], |row| {
                Ok(StoredToken {
                    record: parse_token_row(row)?,
                    secret_hash: row.get(6)?,
                    deleted_at: parse_optional_time(row.get(7)?)?,
                })
            })
            .optional()?;
        Ok(token)
    }

    pub fn mark_token_deleted(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE access_tokens SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![format_time(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_token_usage(&self, id: &str, used_at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        let stamp = format_time(used_at);
        conn.execute(
            "UPDATE access_tokens
             SET first_used_at = COALESCE(first_used_at, ?1), last_used_at = ?1
             WHERE id = ?2",
            params![stamp, id],
        )?;
        Ok(())
    }

    pub fn insert_session(
        &self,
        session: &CloudMigrationSession,
        instance: &CloudInstance,
        auth_token_sealed: &str,
    ) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (
               uid, slug, stack_id, region_slug, cluster_slug, auth_token_sealed, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.uid,
                session.slug,
                to_sql_int(instance.stack_id),
                instance.region_slug,
                instance.cluster_slug,
                auth_token_sealed,
                format_time(session.created),
                format_time(session.updated),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, uid: &str) -> AppResult<Option<CloudMigrationSession>> {
        let conn = self.lock()?;
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE uid = ?1 AND deleted_at IS NULL");
        let session = conn.query_row(&query, [uid], parse_session_row).optional()?;
        Ok(session)
    }

    pub fn get_stored_session(&self, uid: &str) -> AppResult<Option<StoredSession>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {SESSION_COLUMNS}, stack_id, region_slug, cluster_slug, auth_token_sealed
             FROM sessions WHERE uid = ?1 AND deleted_at IS NULL"
        );
        let stored = conn
            .query_row(&query, [uid], |row| {
                let session = parse_session_row(row)?;
                let instance = CloudInstance {
                    stack_id: u64::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
                    slug: session.slug.clone(),
                    region_slug: row.get(5)?,
                    cluster_slug: row.get(6)?,
                };
                Ok(StoredSession {
                    session,
                    instance,
                    auth_token_sealed: row.get(7)?,
                })
            })
            .optional()?;
        Ok(stored)
    }

    pub fn find_active_session_by_slug(&self, slug: &str) -> AppResult<Option<CloudMigrationSession>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE slug = ?1 AND deleted_at IS NULL LIMIT 1"
        );
        let session = conn.query_row(&query, [slug], parse_session_row).optional()?;
        Ok(session)
    }

    pub fn list_sessions(&self) -> AppResult<Vec<CloudMigrationSession>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE deleted_at IS NULL ORDER BY created_at ASC, rowid ASC"
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map([], parse_session_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn mark_session_deleted(&self, uid: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let now = format_time(Utc::now());
        let changed = conn.execute(
            "UPDATE sessions SET deleted_at = ?1, updated_at = ?1 WHERE uid = ?2 AND deleted_at IS NULL",
            params![now, uid],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_run(&self, uid: &str, session_uid: &str) -> AppResult<RunRecord> {
        let created_at = timestamp_now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (uid, session_uid, created_at) VALUES (?1, ?2, ?3)",
            params![uid, session_uid, format_time(created_at)],
        )?;
        Ok(RunRecord {
            uid: uid.to_string(),
            session_uid: session_uid.to_string(),
            total_items: None,
            error_message: None,
            created_at,
        })
    }

    pub fn set_run_total(&self, uid: &str, total_items: usize) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET total_items = ?1 WHERE uid = ?2",
            params![to_sql_int(total_items as u64), uid],
        )?;
        Ok(())
    }

    /// Ends a run that could not enumerate its resources.
    pub fn fail_run(&self, uid: &str, message: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET total_items = 0, error_message = ?1 WHERE uid = ?2",
            params![message, uid],
        )?;
        Ok(())
    }

    /// Only used to roll back a run that never made it onto the queue.
    pub fn delete_run(&self, uid: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM run_items WHERE run_uid = ?1", [uid])?;
        conn.execute("DELETE FROM runs WHERE uid = ?1", [uid])?;
        Ok(())
    }

    pub fn get_run(&self, uid: &str) -> AppResult<Option<RunRecord>> {
        let conn = self.lock()?;
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE uid = ?1");
        let run = conn.query_row(&query, [uid], parse_run_row).optional()?;
        Ok(run)
    }

    /// Most recent first.
    pub fn list_runs(&self, session_uid: &str) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE session_uid = ?1 ORDER BY created_at DESC, rowid DESC"
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map([session_uid], parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Runs of live sessions that have not recorded every item yet.
    pub fn list_incomplete_runs(&self) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT r.uid, r.session_uid, r.total_items, r.error_message, r.created_at
             FROM runs r JOIN sessions s ON s.uid = r.session_uid
             WHERE s.deleted_at IS NULL
               AND (r.total_items IS NULL
                    OR r.total_items > (SELECT COUNT(*) FROM run_items i WHERE i.run_uid = r.uid))
             ORDER BY r.created_at ASC",
        )?;
        let rows = statement.query_map([], parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Records an item once; returns false when the item was already recorded for the run.
    pub fn insert_run_item(&self, run_uid: &str, position: usize, item: &MigrateDataResponseItem) -> AppResult<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO run_items (run_uid, position, item_type, ref_id, status, error, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_uid,
                to_sql_int(position as u64),
                item.item_type.as_str(),
                item.ref_id,
                item.status.as_str(),
                item.error,
                format_time(Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_run_items(&self, run_uid: &str) -> AppResult<Vec<MigrateDataResponseItem>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT item_type, ref_id, status, error FROM run_items WHERE run_uid = ?1 ORDER BY position ASC",
        )?;
        let rows = statement.query_map([run_uid], parse_item_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn insert_snapshot(&self, uid: &str, session_uid: &str) -> AppResult<SnapshotRecord> {
        let now = timestamp_now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snapshots (uid, session_uid, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![uid, session_uid, SnapshotStatus::Initializing.as_str(), format_time(now)],
        )?;
        Ok(SnapshotRecord {
            uid: uid.to_string(),
            session_uid: session_uid.to_string(),
            status: SnapshotStatus::Initializing,
            error_message: None,
            artifact_path: None,
            item_count: 0,
            created: now,
            updated: now,
            finished: None,
        })
    }

    pub fn get_snapshot(&self, uid: &str) -> AppResult<Option<SnapshotRecord>> {
        let conn = self.lock()?;
        query_snapshot(&conn, uid)
    }

    /// Compare-and-set on the snapshot status. The read, the graph check and the
    /// write happen under one connection lock so concurrent writers serialize here.
    pub fn transition_snapshot(
        &self,
        uid: &str,
        next: SnapshotStatus,
        error_message: Option<&str>,
    ) -> AppResult<SnapshotRecord> {
        let conn = self.lock()?;
        let current = query_snapshot(&conn, uid)?
            .ok_or_else(|| AppError::NotFound(format!("snapshot {uid} not found")))?;

        if !current.status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "snapshot {} cannot move from {} to {}",
                uid,
                current.status.as_str(),
                next.as_str()
            )));
        }

        let now = timestamp_now();
        let finished = if next.is_terminal() { Some(now) } else { None };
        let error_message = if next == SnapshotStatus::Error {
            error_message.map(ToString::to_string)
        } else {
            None
        };
        conn.execute(
            "UPDATE snapshots SET status = ?1, error_message = ?2, updated_at = ?3, finished_at = ?4 WHERE uid = ?5",
            params![
                next.as_str(),
                error_message,
                format_time(now),
                finished.map(format_time),
                uid
            ],
        )?;

        Ok(SnapshotRecord {
            status: next,
            error_message,
            updated: now,
            finished,
            ..current
        })
    }

    /// Records the built artifact. Only a snapshot still in CREATING accepts it.
    pub fn set_snapshot_artifact(&self, uid: &str, artifact_path: &str, item_count: usize) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE snapshots SET artifact_path = ?1, item_count = ?2, updated_at = ?3
             WHERE uid = ?4 AND status = ?5",
            params![
                artifact_path,
                to_sql_int(item_count as u64),
                format_time(Utc::now()),
                uid,
                SnapshotStatus::Creating.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(AppError::Conflict(format!(
                "snapshot {uid} is no longer being created"
            )));
        }
        Ok(())
    }

    /// Appends results that are not recorded yet. Existing refs keep their original
    /// position and status, so readers only ever see the list grow.
    /// Fails with `Conflict` once the snapshot is terminal.
    pub fn append_snapshot_results(&self, uid: &str, results: &[MigrateDataResponseItem]) -> AppResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let raw_status: Option<String> = tx
            .query_row("SELECT status FROM snapshots WHERE uid = ?1", [uid], |row| row.get(0))
            .optional()?;
        let Some(raw_status) = raw_status else {
            return Err(AppError::NotFound(format!("snapshot {uid} not found")));
        };
        let status = SnapshotStatus::parse(&raw_status);
        if status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "snapshot {uid} is {} and no longer accepts results",
                status.as_str()
            )));
        }
        let mut seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM snapshot_results WHERE snapshot_uid = ?1",
            [uid],
            |row| row.get(0),
        )?;
        let mut inserted = 0usize;
        for item in results {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO snapshot_results (snapshot_uid, seq, item_type, ref_id, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uid,
                    seq + 1,
                    item.item_type.as_str(),
                    item.ref_id,
                    item.status.as_str(),
                    item.error
                ],
            )?;
            if changed > 0 {
                seq += 1;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn list_snapshot_results(&self, uid: &str) -> AppResult<Vec<MigrateDataResponseItem>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT item_type, ref_id, status, error FROM snapshot_results WHERE snapshot_uid = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement.query_map([uid], parse_item_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// One page ordered by creation, newest first, plus the total for the session.
    pub fn list_snapshots(
        &self,
        session_uid: &str,
        offset: usize,
        limit: usize,
    ) -> AppResult<(Vec<SnapshotRecord>, usize)> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE session_uid = ?1",
            [session_uid],
            |row| row.get(0),
        )?;

        let query = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE session_uid = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(
            params![session_uid, to_sql_int(limit as u64), to_sql_int(offset as u64)],
            parse_snapshot_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok((result, usize::try_from(total).unwrap_or_default()))
    }

    /// Snapshots of live sessions whose status is one of `statuses`, oldest first.
    pub fn list_snapshots_in_status(&self, statuses: &[SnapshotStatus]) -> AppResult<Vec<SnapshotRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = (1..=statuses.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT {} FROM snapshots sn JOIN sessions s ON s.uid = sn.session_uid
             WHERE s.deleted_at IS NULL AND sn.status IN ({}) ORDER BY sn.created_at ASC",
            SNAPSHOT_COLUMNS
                .split(", ")
                .map(|column| format!("sn.{column}"))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders
        );
        let mut statement = conn.prepare(&query)?;
        let raw = statuses.iter().map(|status| status.as_str()).collect::<Vec<_>>();
        let rows = statement.query_map(rusqlite::params_from_iter(raw), parse_snapshot_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_snapshot_uids_for_session(&self, session_uid: &str) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare("SELECT uid FROM snapshots WHERE session_uid = ?1")?;
        let rows = statement.query_map([session_uid], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    #[cfg(test)]
    pub fn force_snapshot_status(&self, uid: &str, raw_status: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE snapshots SET status = ?1 WHERE uid = ?2",
            params![raw_status, uid],
        )?;
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES ('migration', ?1, ?2)",
            params![
                serde_json::to_string(&MigrationSettings::default())?,
                format_time(Utc::now())
            ],
        )?;
        Ok(())
    }
}

fn query_snapshot(conn: &Connection, uid: &str) -> AppResult<Option<SnapshotRecord>> {
    let query = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE uid = ?1");
    let snapshot = conn.query_row(&query, [uid], parse_snapshot_row).optional()?;
    Ok(snapshot)
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CloudMigrationSession> {
    Ok(CloudMigrationSession {
        uid: row.get(0)?,
        slug: row.get(1)?,
        created: parse_time(&row.get::<_, String>(2)?)?,
        updated: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_token_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessTokenRecord> {
    Ok(AccessTokenRecord {
        id: row.get(0)?,
        display_name: row.get(1)?,
        expires_at: parse_time(&row.get::<_, String>(2)?)?,
        first_used_at: parse_optional_time(row.get(3)?)?,
        last_used_at: parse_optional_time(row.get(4)?)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        uid: row.get(0)?,
        session_uid: row.get(1)?,
        total_items: row
            .get::<_, Option<i64>>(2)?
            .map(|total| usize::try_from(total).unwrap_or_default()),
        error_message: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        uid: row.get(0)?,
        session_uid: row.get(1)?,
        status: SnapshotStatus::parse(&row.get::<_, String>(2)?),
        error_message: row.get(3)?,
        artifact_path: row.get(4)?,
        item_count: usize::try_from(row.get::<_, i64>(5)?).unwrap_or_default(),
        created: parse_time(&row.get::<_, String>(6)?)?,
        updated: parse_time(&row.get::<_, String>(7)?)?,
        finished: parse_optional_time(row.get(8)?)?,
    })
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrateDataResponseItem> {
    Ok(MigrateDataResponseItem {
        item_type: parse_item_type(&row.get::<_, String>(0)?)?,
        ref_id: row.get(1)?,
        status: parse_item_status(&row.get::<_, String>(2)?),
        error: row.get(3)?,
    })
}

fn parse_item_type(raw: &str) -> rusqlite::Result<MigrateDataType> {
    MigrateDataType::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown item type '{}'", raw),
            )),
        )
    })
}

fn parse_item_status(raw: &str) -> ItemStatus {
    match raw {
        "OK" => ItemStatus::Ok,
        _ => ItemStatus::Error,
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_time(&raw)).transpose()
}

/// Current time at the precision the store keeps, so freshly built records
/// compare equal to what a later read returns.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC timestamps so text ordering in SQL matches time ordering.
fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
