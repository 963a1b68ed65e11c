//! Persisted description of a downloaded item
//!
//! The manifest is the item description with every remote reference
//! replaced by the local file it was downloaded to. Paths are stored
//! relative to a placeholder for the storage root, because the root can move
//! between launches (app container paths change on reinstall and restore).
//!
//! Rewriting is a separate pass over the untyped JSON tree, so fields the
//! crate does not model (carried in [`PlayableItem::extra`]) are covered as
//! well.

use crate::error::{OfflineError, Result};
use crate::file::storage::{atomic_write, path_exists, MediaStorage};
use crate::media::item::PlayableItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Stands for the storage root inside a stored manifest
pub const ROOT_PLACEHOLDER: &str = "${OFFLINE_ROOT}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub downloaded_at: DateTime<Utc>,
    /// Item description pointing at local files
    pub item: PlayableItem,
}

impl Manifest {
    pub fn new(item: PlayableItem) -> Self {
        Self {
            version: MANIFEST_VERSION,
            downloaded_at: Utc::now(),
            item,
        }
    }

    /// Encode with paths under `root` made portable
    pub fn to_portable_json(&self, root: &Path) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        let root = root_prefix(root);
        rewrite_strings(&mut value, &|s| {
            strip_root(s, &root).map(|rest| format!("{}{}", ROOT_PLACEHOLDER, rest))
        });
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Decode, resolving the placeholder against `root`
    pub fn from_portable_json(json: &str, root: &Path) -> Result<Self> {
        let mut value: Value = serde_json::from_str(json)?;
        let root = root_prefix(root);
        rewrite_strings(&mut value, &|s| {
            s.strip_prefix(ROOT_PLACEHOLDER)
                .map(|rest| format!("{}{}", root, rest))
        });

        let manifest: Manifest = serde_json::from_value(value)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(OfflineError::ManifestError(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Write the manifest into the item's directory
    pub async fn save(&self, storage: &MediaStorage) -> Result<()> {
        let media_id = self
            .item
            .id()
            .ok_or_else(|| OfflineError::ManifestError("item has no media id".to_string()))?;
        let json = self.to_portable_json(storage.root())?;
        atomic_write(&storage.manifest_path(media_id), json.as_bytes()).await
    }

    /// Read whatever manifest is stored at `path`. `Ok(None)` if there is none.
    pub async fn read(path: &Path, root: &Path) -> Result<Option<Self>> {
        if !path_exists(path).await {
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OfflineError::file_io("read", path, e))?;
        Self::from_portable_json(&json, root).map(Some)
    }

    /// Read the manifest for `media_id`. `Ok(None)` if there is none.
    pub async fn load(storage: &MediaStorage, media_id: &str) -> Result<Option<Self>> {
        let path = storage.manifest_path(media_id);
        let Some(manifest) = Self::read(&path, storage.root()).await? else {
            return Ok(None);
        };

        if manifest.item.id() != Some(media_id) {
            return Err(OfflineError::ManifestError(format!(
                "{} describes a different item",
                path.display()
            )));
        }
        Ok(Some(manifest))
    }
}

/// Apply `rewrite` to every string in the tree, replacing those it maps
pub fn rewrite_strings<F>(value: &mut Value, rewrite: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if let Some(replacement) = rewrite(s) {
                *s = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_strings(item, rewrite);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                rewrite_strings(item, rewrite);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn root_prefix(root: &Path) -> String {
    let root = root.to_string_lossy();
    let trimmed = root.trim_end_matches(std::path::MAIN_SEPARATOR);
    if trimmed.is_empty() {
        root.into_owned()
    } else {
        trimmed.to_string()
    }
}

/// The part of `s` after `root`, if `s` is `root` or a path below it
fn strip_root<'a>(s: &'a str, root: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(root)?;
    if rest.is_empty() || rest.starts_with(std::path::MAIN_SEPARATOR) {
        Some(rest)
    } else {
        None
    }
}
