use super::ResourceSource;
use crate::errors::{AppError, AppResult};
use crate::models::{MigrateDataType, ResourceRef};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static REF_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("valid ref id regex"));

/// Folders first so that dashboards land after the folders they live in.
const LAYOUT: [(&str, MigrateDataType); 3] = [
    ("folders", MigrateDataType::Folder),
    ("datasources", MigrateDataType::Datasource),
    ("dashboards", MigrateDataType::Dashboard),
];

/// Reads exported resources from `<root>/{folders,datasources,dashboards}/<refId>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryResourceSource {
    root: PathBuf,
}

impl DirectoryResourceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, resource: &ResourceRef) -> PathBuf {
        let folder = LAYOUT
            .iter()
            .find(|(_, item_type)| *item_type == resource.item_type)
            .map(|(folder, _)| *folder)
            .unwrap_or("dashboards");
        self.root.join(folder).join(format!("{}.json", resource.ref_id))
    }
}

#[async_trait]
impl ResourceSource for DirectoryResourceSource {
    async fn list_resources(&self) -> AppResult<Vec<ResourceRef>> {
        let mut resources = Vec::new();
        for (folder, item_type) in LAYOUT {
            let dir = self.root.join(folder);
            if !dir.is_dir() {
                continue;
            }
            let mut entries = list_json_files(&dir).await?;
            entries.sort();
            for path in entries {
                let Some(ref_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if !REF_ID_RE.is_match(ref_id) {
                    tracing::warn!(path = %path.display(), "skipping resource with unsupported file name");
                    continue;
                }
                let name = read_title(&path).await.unwrap_or_else(|| ref_id.to_string());
                resources.push(ResourceRef {
                    item_type,
                    ref_id: ref_id.to_string(),
                    name,
                });
            }
        }
        Ok(resources)
    }

    async fn serialize(&self, resource: &ResourceRef) -> AppResult<serde_json::Value> {
        let path = self.path_for(resource);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|error| {
            AppError::NotFound(format!("{} {}: {}", resource.item_type.as_str(), resource.ref_id, error))
        })?;
        serde_json::from_str::<serde_json::Value>(&raw).map_err(|error| {
            AppError::Validation(format!(
                "{} {} is not valid JSON: {}",
                resource.item_type.as_str(),
                resource.ref_id,
                error
            ))
        })
    }
}

async fn list_json_files(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

async fn read_title(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value
        .get("title")
        .or_else(|| value.get("name"))
        .and_then(|title| title.as_str())
        .map(ToString::to_string)
}
