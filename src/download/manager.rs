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


//! Download manager for playable items
//!
//! # Item Lifecycle
//! - `Online`: nothing stored, no download in flight
//! - `Downloading`: a download is registered for the media id
//! - `Local`: a loadable manifest exists in the item directory
//!
//! State is derived from the filesystem and the registry on every request;
//! nothing is cached.
//!
//! # Download Registry
//! - Tracking token (`Uuid`) -> media id, observer, cancel token
//! - At most one record per media id; checked and inserted under one lock
//! - A record is removed once its download finished and, on failure, the
//!   item directory was purged; only then is the observer notified
//!
//! # Queue Management
//! - Items run on a bounded queue (`max_concurrent_items`)
//! - Resources within an item run on the item's own bounded queue

use crate::config::DownloadConfig;
use crate::download::item::DownloadPlayerItemOperation;
use crate::download::manifest::Manifest;
use crate::download::observer::PlayerItemDownloadObserver;
use crate::download::operation::{AsyncOperation, OperationQueue};
use crate::download::transport::Transport;
use crate::error::{OfflineError, Result};
use crate::file::storage::{MediaStorage, MANIFEST_FILE_NAME};
use crate::media::item::PlayableItem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where an item currently is in its offline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Online,
    Downloading,
    Local,
}

/// Registry entry for an in-flight download
#[derive(Debug, Clone)]
struct DownloadRecord {
    media_id: String,
    observer: PlayerItemDownloadObserver,
    cancel: CancellationToken,
}

/// Downloads items for offline playback and hands them back rehydrated
pub struct PlayerItemDownloadManager {
    /// Configuration
    config: DownloadConfig,

    storage: MediaStorage,

    transport: Transport,

    /// Bounded queue for item downloads
    queue: OperationQueue,

    /// In-flight downloads (tracking token -> record)
    records: Arc<RwLock<HashMap<Uuid, DownloadRecord>>>,

    /// Parent of every download's cancel token
    shutdown: CancellationToken,
}

impl PlayerItemDownloadManager {
    /// Create a manager with the default transport
    pub fn new(config: DownloadConfig) -> Result<Self> {
        config.validate()?;
        let transport = Transport::from_config(&config)?;
        Self::with_transport(config, transport)
    }

    /// Create a manager with a custom transport (e.g. a platform asset
    /// downloader)
    pub fn with_transport(config: DownloadConfig, transport: Transport) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            storage: MediaStorage::new(config.storage_root.clone()),
            queue: OperationQueue::new(config.max_concurrent_items),
            config,
            transport,
            records: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn storage(&self) -> &MediaStorage {
        &self.storage
    }

    /// Start downloading an item.
    ///
    /// Returns `None` without doing anything if the item has no media id, is
    /// already stored locally or downloading, or its directory holds another
    /// item.
    pub async fn download(&self, item: &PlayableItem) -> Option<PlayerItemDownloadObserver> {
        let Some(media_id) = item.id().map(str::to_string) else {
            log::warn!("Ignoring download request for an item without media id");
            return None;
        };

        let mut records = self.records.write().await;
        let directory = self.storage.item_directory(&media_id);

        match Manifest::read(&self.storage.manifest_path(&media_id), self.storage.root()).await {
            Ok(Some(manifest)) if manifest.item.id() == Some(media_id.as_str()) => {
                log::info!("{} is already stored locally", media_id);
                return None;
            }
            Ok(Some(manifest)) => {
                log::warn!(
                    "Refusing to download {}: {} belongs to {:?}",
                    media_id,
                    directory.display(),
                    manifest.item.id()
                );
                return None;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Replacing unusable manifest of {}: {}", media_id, e),
        }
        if records
            .values()
            .any(|r| r.media_id == media_id || self.storage.item_directory(&r.media_id) == directory)
        {
            log::info!("{} is already downloading", media_id);
            return None;
        }

        let token = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let observer = PlayerItemDownloadObserver::new(media_id.clone());

        let operation = Arc::new(DownloadPlayerItemOperation::new(
            item.clone(),
            self.storage.clone(),
            self.transport.clone(),
            &self.config,
            cancel.clone(),
        ));
        operation.set_progress_tracker(Arc::new(observer.relay()));

        records.insert(
            token,
            DownloadRecord {
                media_id: media_id.clone(),
                observer: observer.clone(),
                cancel,
            },
        );
        drop(records);

        log::info!("Queued download of {} ({})", media_id, token);
        self.queue.enqueue(Arc::clone(&operation));
        self.spawn_completion(token, media_id, operation, observer.clone());

        Some(observer)
    }

    /// Clean up after a download and notify its observer
    fn spawn_completion(
        &self,
        token: Uuid,
        media_id: String,
        operation: Arc<DownloadPlayerItemOperation>,
        observer: PlayerItemDownloadObserver,
    ) {
        let records = Arc::clone(&self.records);
        let storage = self.storage.clone();

        tokio::spawn(async move {
            let error = operation.status().finished().await;
            drop(operation);

            if let Some(ref e) = error {
                log::warn!("Download of {} failed: {}", media_id, e);
                if let Err(cleanup) = storage.remove_item(&media_id).await {
                    log::warn!("Could not purge {}: {}", media_id, cleanup);
                }
            } else {
                log::info!("Download of {} complete", media_id);
            }

            records.write().await.remove(&token);
            observer.complete(error);
        });
    }

    /// Delete a downloaded item
    pub async fn remove(&self, media_id: &str) -> Result<()> {
        if self.state(media_id).await != ItemState::Local {
            return Err(OfflineError::ItemNotLocal(media_id.to_string()));
        }

        self.storage.remove_item(media_id).await?;
        log::info!("Removed {}", media_id);
        Ok(())
    }

    /// The stored item with every reference pointing at local files
    pub async fn downloaded_item(&self, media_id: &str) -> Option<PlayableItem> {
        self.load_manifest(media_id).await.map(|manifest| manifest.item)
    }

    pub async fn state(&self, media_id: &str) -> ItemState {
        if media_id.trim().is_empty() {
            return ItemState::Online;
        }
        // Held across the manifest check so a finishing download is seen
        // either as downloading or as local, never as online
        let records = self.records.read().await;
        if self.load_manifest(media_id).await.is_some() {
            return ItemState::Local;
        }

        if records.values().any(|r| r.media_id == media_id) {
            ItemState::Downloading
        } else {
            ItemState::Online
        }
    }

    /// Cancel the in-flight download of an item
    pub async fn cancel(&self, media_id: &str) -> Result<()> {
        let records = self.records.read().await;
        let record = records
            .values()
            .find(|r| r.media_id == media_id)
            .ok_or_else(|| OfflineError::NotDownloading(media_id.to_string()))?;

        log::info!("Cancelling download of {}", media_id);
        record.cancel.cancel();
        Ok(())
    }

    /// Observer of an in-flight download, for re-attaching to it
    pub async fn observer(&self, media_id: &str) -> Option<PlayerItemDownloadObserver> {
        let records = self.records.read().await;
        records
            .values()
            .find(|r| r.media_id == media_id)
            .map(|r| r.observer.clone())
    }

    /// Media ids of every stored item with a loadable manifest
    pub async fn downloaded_ids(&self) -> Vec<String> {
        let dirs = match self.storage.item_directories().await {
            Ok(dirs) => dirs,
            Err(e) => {
                log::warn!("Could not list stored items: {}", e);
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for dir in dirs {
            let path = dir.join(MANIFEST_FILE_NAME);
            let Ok(json) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match Manifest::from_portable_json(&json, self.storage.root()) {
                Ok(manifest) => {
                    if let Some(id) = manifest.item.id() {
                        ids.push(id.to_string());
                    }
                }
                Err(e) => log::warn!("Skipping unreadable manifest {}: {}", path.display(), e),
            }
        }
        ids.sort();
        ids
    }

    /// Cancel every in-flight download
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    async fn load_manifest(&self, media_id: &str) -> Option<Manifest> {
        match Manifest::load(&self.storage, media_id).await {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("Manifest for {} is unusable: {}", media_id, e);
                None
            }
        }
    }
}

impl Drop for PlayerItemDownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
