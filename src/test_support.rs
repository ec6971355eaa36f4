use crate::adapters::{CloudClient, RemoteProcessingStatus, RemoteState, ResourceSource, SnapshotArtifact};
use crate::crypto::Sealer;
use crate::db::{timestamp_now, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{
    CloudInstance, CloudMigrationSession, MigrateDataResponseItem, MigrateDataType, ResourcePayload, ResourceRef,
    SessionContext,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn test_instance() -> CloudInstance {
    CloudInstance {
        stack_id: 7,
        slug: "acme".to_string(),
        region_slug: "us".to_string(),
        cluster_slug: "prod-us-0".to_string(),
    }
}

pub fn test_sealer() -> Sealer {
    Sealer::new([9u8; 32])
}

pub fn test_db(dir: &tempfile::TempDir) -> Arc<Database> {
    Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"))
}

/// Inserts a live session directly, bypassing token validation.
pub fn seed_session(db: &Database, sealer: &Sealer, slug: &str) -> CloudMigrationSession {
    let now = timestamp_now();
    let session = CloudMigrationSession {
        uid: uuid::Uuid::new_v4().to_string(),
        slug: slug.to_string(),
        created: now,
        updated: now,
    };
    let instance = CloudInstance {
        slug: slug.to_string(),
        ..test_instance()
    };
    let sealed = sealer.seal_to_string("test-token").expect("seal");
    db.insert_session(&session, &instance, &sealed).expect("insert session");
    session
}

pub fn dashboards(ids: &[&str]) -> Vec<ResourceRef> {
    ids.iter()
        .map(|id| ResourceRef {
            item_type: MigrateDataType::Dashboard,
            ref_id: id.to_string(),
            name: format!("Dashboard {id}"),
        })
        .collect()
}

#[derive(Default)]
pub struct StaticResources {
    resources: Vec<ResourceRef>,
    broken: HashSet<String>,
    list_error: Option<String>,
    serialize_gate: Option<Arc<Notify>>,
    pub serialize_calls: AtomicUsize,
}

impl StaticResources {
    pub fn new(resources: Vec<ResourceRef>) -> Self {
        Self {
            resources,
            ..Self::default()
        }
    }

    pub fn with_broken(mut self, ref_id: &str) -> Self {
        self.broken.insert(ref_id.to_string());
        self
    }

    /// Holds the first serialization until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.serialize_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn failing_enumeration(message: &str) -> Self {
        Self {
            list_error: Some(message.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResourceSource for StaticResources {
    async fn list_resources(&self) -> AppResult<Vec<ResourceRef>> {
        match &self.list_error {
            Some(message) => Err(AppError::Io(message.clone())),
            None => Ok(self.resources.clone()),
        }
    }

    async fn serialize(&self, resource: &ResourceRef) -> AppResult<serde_json::Value> {
        let call = self.serialize_calls.fetch_add(1, Ordering::SeqCst);
        if let (0, Some(gate)) = (call, &self.serialize_gate) {
            gate.notified().await;
        }
        if self.broken.contains(&resource.ref_id) {
            return Err(AppError::Validation(format!("cannot serialize {}", resource.ref_id)));
        }
        Ok(serde_json::json!({ "uid": resource.ref_id, "title": resource.name }))
    }
}

/// In-memory cloud whose failures and processing progress are scripted per test.
#[derive(Default)]
pub struct ScriptedCloud {
    transient_failures: Mutex<HashMap<String, usize>>,
    rejected: Mutex<HashSet<String>>,
    upload_failures: AtomicUsize,
    processing: Mutex<VecDeque<AppResult<RemoteProcessingStatus>>>,
    upload_gate: Mutex<Option<Arc<Notify>>>,
    migrate_gate: Mutex<Option<Arc<Notify>>>,
    poll_gate: Mutex<Option<Arc<Notify>>>,
    pub migrated: Mutex<Vec<String>>,
    pub migrate_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
}

impl ScriptedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transiently(&self, ref_id: &str, times: usize) {
        lock(&self.transient_failures).insert(ref_id.to_string(), times);
    }

    pub fn reject(&self, ref_id: &str) {
        lock(&self.rejected).insert(ref_id.to_string());
    }

    pub fn fail_uploads(&self, times: usize) {
        self.upload_failures.store(times, Ordering::SeqCst);
    }

    pub fn push_status(&self, state: RemoteState, results: Vec<MigrateDataResponseItem>) {
        lock(&self.processing).push_back(Ok(RemoteProcessingStatus { state, results }));
    }

    pub fn push_poll_error(&self, error: AppError) {
        lock(&self.processing).push_back(Err(error));
    }

    /// Holds every upload until the returned handle is notified.
    pub fn gate_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.upload_gate) = Some(gate.clone());
        gate
    }

    /// Holds every item transfer until the returned handle is notified.
    pub fn gate_migrations(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.migrate_gate) = Some(gate.clone());
        gate
    }

    /// Holds every status poll until the returned handle is notified.
    pub fn gate_polls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.poll_gate) = Some(gate.clone());
        gate
    }

    pub fn migrated_ids(&self) -> Vec<String> {
        lock(&self.migrated).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CloudClient for ScriptedCloud {
    async fn migrate_resource(&self, _context: &SessionContext, payload: &ResourcePayload) -> AppResult<()> {
        self.migrate_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.migrate_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let ref_id = payload.resource.ref_id.clone();
        if lock(&self.rejected).contains(&ref_id) {
            return Err(AppError::RemoteProcessing(format!("{ref_id} rejected")));
        }
        {
            let mut failures = lock(&self.transient_failures);
            if let Some(remaining) = failures.get_mut(&ref_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AppError::TransientTransport("connection reset".to_string()));
                }
            }
        }
        lock(&self.migrated).push(ref_id);
        Ok(())
    }

    async fn upload_snapshot(&self, _context: &SessionContext, _artifact: &SnapshotArtifact) -> AppResult<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.upload_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let remaining = self.upload_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.upload_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::TransientTransport("upload interrupted".to_string()));
        }
        Ok(())
    }

    async fn start_processing(&self, _context: &SessionContext, _snapshot_uid: &str) -> AppResult<()> {
        Ok(())
    }

    async fn processing_status(
        &self,
        _context: &SessionContext,
        _snapshot_uid: &str,
    ) -> AppResult<RemoteProcessingStatus> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.poll_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        lock(&self.processing).pop_front().unwrap_or(Ok(RemoteProcessingStatus {
            state: RemoteState::Processing,
            results: Vec::new(),
        }))
    }
}
