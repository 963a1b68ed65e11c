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


//! Download configuration
//!
//! The host application usually builds a [`DownloadConfig`] in code with
//! only `storage_root` set, but the whole configuration can also be stored
//! as JSON next to the downloaded content.

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Root directory every item directory lives under
    pub storage_root: PathBuf,

    /// Maximum number of items downloading at once
    pub max_concurrent_items: usize,

    /// Maximum resources (media, poster, tracks) per item downloading at once
    pub max_concurrent_resources: usize,

    /// Maximum streaming segments fetched at once
    pub segment_concurrency: usize,

    /// Lowest acceptable variant bitrate for streaming assets, in bits/s.
    /// `None` picks the highest quality.
    pub minimum_bitrate: Option<u64>,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum number of images held by the image cache
    pub image_cache_capacity: usize,

    /// Maximum total bytes held by the image cache
    pub image_cache_max_bytes: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("."),
            max_concurrent_items: 2,
            max_concurrent_resources: 4,
            segment_concurrency: 4,
            minimum_bitrate: None,
            request_timeout_secs: 300, // 5 minute timeout
            image_cache_capacity: 64,
            image_cache_max_bytes: 32 * 1024 * 1024,
        }
    }
}

impl DownloadConfig {
    /// Create a default configuration rooted at `storage_root`
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values that would stall the queues
    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(OfflineError::ConfigurationError(
                "storage_root must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("max_concurrent_items", self.max_concurrent_items),
            ("max_concurrent_resources", self.max_concurrent_resources),
            ("segment_concurrency", self.segment_concurrency),
        ] {
            if value == 0 {
                return Err(OfflineError::ConfigurationError(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(OfflineError::ConfigurationError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OfflineError::file_io("read config", path, e))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| OfflineError::file_io("write config", path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DownloadConfig::new("/tmp/offline");
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = DownloadConfig {
            max_concurrent_resources: 0,
            ..DownloadConfig::new("/tmp/offline")
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_resources"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DownloadConfig =
            serde_json::from_str(r#"{"storage_root": "/data", "minimum_bitrate": 265000}"#).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/data"));
        assert_eq!(config.minimum_bitrate, Some(265_000));
        assert_eq!(config.max_concurrent_items, 2);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = DownloadConfig {
            segment_concurrency: 8,
            ..DownloadConfig::new(dir.path())
        };
        config.save(&path).await.unwrap();

        let loaded = DownloadConfig::load(&path).await.unwrap();
        assert_eq!(loaded.segment_concurrency, 8);
        assert_eq!(loaded.storage_root, dir.path());
    }
}
