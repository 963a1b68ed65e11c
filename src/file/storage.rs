// OfflineKit - Offline Media Downloads for Mobile Players
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! On-disk layout of downloaded items
//!
//! Every item lives in its own directory directly under the storage root:
//!
//! ```text
//! <root>/
//!   item-<id>/
//!     item.json            manifest
//!     videoSource.mp4      or videoSource.movpkg/index.m3u8
//!     posterImage.jpg
//!     mediaTrack-0.vtt
//! ```
//!
//! # Key Operations
//! - Item directory creation and removal (with retry)
//! - Replacing moves for finished downloads (files and packages)
//! - Atomic manifest writes
//! - Enumerating item directories

use crate::error::{OfflineError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Prefix of every item directory name
pub const ITEM_DIRECTORY_PREFIX: &str = "item-";

/// File name of the manifest inside an item directory
pub const MANIFEST_FILE_NAME: &str = "item.json";

/// Root-scoped filesystem access for downloaded items
#[derive(Debug, Clone)]
pub struct MediaStorage {
    root: PathBuf,
}

impl MediaStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root every item directory lives under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything downloaded for `media_id`.
    ///
    /// Distinct ids always get distinct directories.
    pub fn item_directory(&self, media_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", ITEM_DIRECTORY_PREFIX, encode_component(media_id)))
    }

    pub fn manifest_path(&self, media_id: &str) -> PathBuf {
        self.item_directory(media_id).join(MANIFEST_FILE_NAME)
    }

    /// Create the item directory (and the root) if missing
    pub async fn create_item_directory(&self, media_id: &str) -> Result<PathBuf> {
        let dir = self.item_directory(media_id);
        ensure_directory_exists(&dir).await?;
        Ok(dir)
    }

    /// Delete an item directory and everything in it, with retry.
    ///
    /// A missing directory is not an error.
    pub async fn remove_item(&self, media_id: &str) -> Result<()> {
        let dir = self.item_directory(media_id);
        safe_delete(&dir).await
    }

    /// Every `item-*` directory under the root
    pub async fn item_directories(&self) -> Result<Vec<PathBuf>> {
        if !path_exists(&self.root).await {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| OfflineError::file_io("read directory", &self.root, e))?;

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OfflineError::file_io("read directory entry in", &self.root, e))?
        {
            let is_item = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(ITEM_DIRECTORY_PREFIX))
                .unwrap_or(false);
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);

            if is_item && is_dir {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}

/// Percent-encode a media id into a single path component.
///
/// Only `[A-Za-z0-9-_.~]` pass through, so the mapping is injective and the
/// result never contains a separator.
pub fn encode_component(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Ensure directory exists, creating parent directories as needed
pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
    if path_exists(path).await {
        return Ok(());
    }

    fs::create_dir_all(path)
        .await
        .map_err(|e| OfflineError::file_io("create directory", path, e))
}

/// Check if a file or directory exists
pub async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Move `source` to `destination`, replacing whatever is there, with retry.
///
/// Works for plain files as well as package directories. The source must
/// exist.
pub async fn replace_with(source: &Path, destination: &Path) -> Result<()> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        match try_replace(source, destination).await {
            Ok(()) => return Ok(()),
            Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                return Err(OfflineError::FileIoError(format!(
                    "Failed to move after {} attempts: {} -> {}: {}",
                    MAX_RETRY_ATTEMPTS,
                    source.display(),
                    destination.display(),
                    e
                )));
            }
            Err(e) => {
                log::debug!("Move attempt {} failed, retrying: {}", attempts, e);
                sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn try_replace(source: &Path, destination: &Path) -> Result<()> {
    if !path_exists(source).await {
        return Err(OfflineError::FileIoError(format!(
            "Nothing to move at {}",
            source.display()
        )));
    }

    delete_once(destination).await?;

    if let Some(parent) = destination.parent() {
        ensure_directory_exists(parent).await?;
    }

    fs::rename(source, destination).await.map_err(|e| {
        OfflineError::FileIoError(format!(
            "Move failed: {} -> {}: {}",
            source.display(),
            destination.display(),
            e
        ))
    })
}

/// Delete a file or directory tree with retry. Missing paths are fine.
pub async fn safe_delete(path: &Path) -> Result<()> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        match delete_once(path).await {
            Ok(()) => return Ok(()),
            Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                return Err(OfflineError::FileIoError(format!(
                    "Failed to delete after {} attempts: {}: {}",
                    MAX_RETRY_ATTEMPTS,
                    path.display(),
                    e
                )));
            }
            Err(_) => sleep(RETRY_DELAY).await,
        }
    }
}

async fn delete_once(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(OfflineError::file_io("inspect", path, e)),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OfflineError::file_io("delete", path, e)),
    }
}

/// Atomic write: write to a hidden temp file, sync, then rename
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&temp_path, contents)
        .await
        .map_err(|e| OfflineError::file_io("write temp file", &temp_path, e))?;

    let file = fs::OpenOptions::new()
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| OfflineError::file_io("open temp file for sync", &temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| OfflineError::file_io("sync temp file", &temp_path, e))?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(OfflineError::FileIoError(format!(
            "Failed to rename temp file {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_item_layout() {
        let storage = MediaStorage::new("/data/offline");
        assert_eq!(
            storage.item_directory("abc123"),
            PathBuf::from("/data/offline/item-abc123")
        );
        assert_eq!(
            storage.manifest_path("abc123"),
            PathBuf::from("/data/offline/item-abc123/item.json")
        );
    }

    #[test]
    fn test_ids_cannot_escape_root() {
        let storage = MediaStorage::new("/data/offline");
        let dir = storage.item_directory("../../etc/passwd");
        assert_eq!(dir.parent(), Some(Path::new("/data/offline")));
        assert_eq!(encode_component("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_distinct_ids_get_distinct_directories() {
        let storage = MediaStorage::new("/data/offline");
        let ids = ["a/b", "a_b", "a%2Fb", "a b", "a_20b"];
        let dirs: std::collections::HashSet<_> =
            ids.iter().map(|id| storage.item_directory(id)).collect();
        assert_eq!(dirs.len(), ids.len());
        assert_eq!(storage.item_directory("a_b"), PathBuf::from("/data/offline/item-a_b"));
    }

    #[tokio::test]
    async fn test_create_and_remove_item() {
        let temp_dir = TempDir::new().unwrap();
        let storage = MediaStorage::new(temp_dir.path().join("offline"));

        let dir = storage.create_item_directory("abc").await.unwrap();
        fs::write(dir.join("videoSource.mp4"), b"video").await.unwrap();
        assert!(dir.exists());

        storage.remove_item("abc").await.unwrap();
        assert!(!dir.exists());

        // Removing again is fine
        storage.remove_item("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_with_overwrites_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("download.part");
        let dest = temp_dir.path().join("item-a").join("videoSource.mp4");

        fs::create_dir_all(dest.parent().unwrap()).await.unwrap();
        fs::write(&dest, b"old").await.unwrap();
        fs::write(&source, b"new").await.unwrap();

        replace_with(&source, &dest).await.unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_replace_with_moves_directories() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join(".asset-tmp");
        let dest = temp_dir.path().join("videoSource.movpkg");

        fs::create_dir_all(&source).await.unwrap();
        fs::write(source.join("index.m3u8"), b"#EXTM3U").await.unwrap();
        fs::create_dir_all(&dest).await.unwrap();
        fs::write(dest.join("stale.ts"), b"old").await.unwrap();

        replace_with(&source, &dest).await.unwrap();

        assert!(dest.join("index.m3u8").exists());
        assert!(!dest.join("stale.ts").exists());
    }

    #[tokio::test]
    async fn test_replace_with_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = replace_with(&temp_dir.path().join("nope"), &temp_dir.path().join("dest"))
            .await
            .unwrap_err();
        assert!(err.is_file_error());
    }

    #[tokio::test]
    async fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("item.json");

        atomic_write(&file, b"{}").await.unwrap();

        assert_eq!(fs::read_to_string(&file).await.unwrap(), "{}");
        assert!(!temp_dir.path().join(".item.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_item_directories() {
        let temp_dir = TempDir::new().unwrap();
        let storage = MediaStorage::new(temp_dir.path());

        storage.create_item_directory("b").await.unwrap();
        storage.create_item_directory("a").await.unwrap();
        fs::create_dir_all(temp_dir.path().join("unrelated")).await.unwrap();
        fs::write(temp_dir.path().join("item-file"), b"").await.unwrap();

        let dirs = storage.item_directories().await.unwrap();
        assert_eq!(
            dirs,
            vec![temp_dir.path().join("item-a"), temp_dir.path().join("item-b")]
        );

        let empty = MediaStorage::new(temp_dir.path().join("missing"));
        assert!(empty.item_directories().await.unwrap().is_empty());
    }
}
