use crate::crypto::Sealer;
use crate::errors::{AppError, AppResult};
use crate::models::CloudInstance;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "CLOUD_MIGRATION_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".cloud-migration";
const CONFIG_FILE: &str = "config.yaml";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8450";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub global_limit: usize,
    pub per_session_limit: usize,
    pub max_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_limit: 4,
            per_session_limit: 2,
            max_queue_size: 512,
        }
    }
}

/// Bootstrap configuration read once at startup from `<data_dir>/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Destination identity embedded in the tokens this instance issues.
    pub instance: CloudInstance,
    /// Base64 AES-256 key. Falls back to the OS keyring when unset.
    pub encryption_key: Option<String>,
    pub resources_dir: Option<PathBuf>,
    pub outbox_dir: Option<PathBuf>,
    /// Address the HTTP surface binds to.
    pub listen_addr: String,
    pub log_filter: String,
    pub scheduler: SchedulerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            instance: CloudInstance::default(),
            encryption_key: None,
            resources_dir: None,
            outbox_dir: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_filter: "info".to_string(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn data_dir_from_env() -> PathBuf {
        std::env::var_os(DATA_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str::<Self>(&raw)?
            }
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.instance.slug.trim().is_empty() {
            return Err(AppError::Validation("instance.slug must not be empty".to_string()));
        }
        if self.scheduler.global_limit == 0 || self.scheduler.per_session_limit == 0 {
            return Err(AppError::Validation("scheduler limits must be at least 1".to_string()));
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(AppError::Validation(format!(
                "listenAddr must be a socket address, got '{}'",
                self.listen_addr
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("state.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.resources_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("resources"))
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.outbox_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("outbox"))
    }

    pub fn sealer(&self) -> AppResult<Sealer> {
        match &self.encryption_key {
            Some(encoded) => Sealer::from_base64(encoded),
            None => Sealer::from_keyring(),
        }
    }
}
