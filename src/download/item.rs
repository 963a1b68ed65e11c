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


//! Whole-item download orchestration
//!
//! # Flow
//! 1. Create the item directory
//! 2. Classify the primary source (progressive file or streaming asset)
//! 3. Plan one download per resource: primary media, poster, each track
//! 4. Run them on a private bounded queue and wait for all of them
//! 5. If any failed, fail with the first failure in completion order
//! 6. Rewrite the item to point at the local files and persist the manifest
//!
//! Directory cleanup after a failure is the caller's job; the manager
//! purges the item directory before reporting the error.

use crate::config::DownloadConfig;
use crate::download::asset::DownloadAssetOperation;
use crate::download::file::DownloadFileOperation;
use crate::download::manifest::Manifest;
use crate::download::operation::{AsyncOperation, OperationQueue, OperationStatus};
use crate::download::progress::SharedProgressTracker;
use crate::download::transport::Transport;
use crate::error::{OfflineError, Result};
use crate::file::storage::MediaStorage;
use crate::media::item::{url_extension, MediaKind, PlayableItem};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// What a downloaded resource is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    PrimaryMedia,
    Poster,
    /// Index into the item's track list
    Track(usize),
}

impl fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRole::PrimaryMedia => write!(f, "primary media"),
            ResourceRole::Poster => write!(f, "poster image"),
            ResourceRole::Track(index) => write!(f, "track {}", index),
        }
    }
}

/// One remote resource and where it goes
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadDescriptor {
    pub source: Url,
    /// The reference exactly as it appears in the item description
    pub source_key: String,
    pub destination: PathBuf,
    pub role: ResourceRole,
}

/// Progress of the orchestration itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Pending,
    FanningOut,
    AwaitingChildren,
    WritingManifest,
    Done,
    Failed,
}

/// A child download of either kind
#[derive(Clone)]
pub enum ResourceOperation {
    File(Arc<DownloadFileOperation>),
    Asset(Arc<DownloadAssetOperation>),
}

impl ResourceOperation {
    pub fn as_operation(&self) -> &dyn AsyncOperation {
        match self {
            ResourceOperation::File(op) => op.as_ref(),
            ResourceOperation::Asset(op) => op.as_ref(),
        }
    }

    /// Where the playable result will be
    pub fn local_path(&self) -> PathBuf {
        match self {
            ResourceOperation::File(op) => op.destination().to_path_buf(),
            ResourceOperation::Asset(op) => op.local_path(),
        }
    }

    pub fn set_progress_tracker(&self, tracker: SharedProgressTracker) {
        match self {
            ResourceOperation::File(op) => op.set_progress_tracker(tracker),
            ResourceOperation::Asset(op) => op.set_progress_tracker(tracker),
        }
    }

    fn enqueue(&self, queue: &OperationQueue) {
        match self {
            ResourceOperation::File(op) => queue.enqueue(Arc::clone(op)),
            ResourceOperation::Asset(op) => queue.enqueue(Arc::clone(op)),
        }
    }
}

/// Plan the downloads for `item` into `directory`.
///
/// Fails if the primary source is missing, unparseable or of an unsupported
/// format, or if the poster reference is not a URL. Tracks with unusable
/// references are skipped.
pub fn plan_downloads(item: &PlayableItem, directory: &Path) -> Result<(MediaKind, Vec<DownloadDescriptor>)> {
    let primary = item.primary_source().ok_or(OfflineError::MissingMediaSource)?;
    let primary_url = Url::parse(&primary.file)?;
    let kind = MediaKind::classify(&primary_url)?;

    let primary_name = match &kind {
        MediaKind::Progressive { extension } => format!("videoSource.{}", extension),
        MediaKind::Streaming => "videoSource.movpkg".to_string(),
    };

    let mut descriptors = vec![DownloadDescriptor {
        source: primary_url,
        source_key: primary.file.clone(),
        destination: directory.join(primary_name),
        role: ResourceRole::PrimaryMedia,
    }];

    if let Some(image) = &item.image {
        let url = Url::parse(image)?;
        let ext = url_extension(&url).unwrap_or_else(|| "jpg".to_string());
        descriptors.push(DownloadDescriptor {
            source: url,
            source_key: image.clone(),
            destination: directory.join(format!("posterImage.{}", ext)),
            role: ResourceRole::Poster,
        });
    }

    for (index, track) in item.tracks.iter().enumerate() {
        let url = match Url::parse(&track.file) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("Skipping track {} with unusable reference '{}': {}", index, track.file, e);
                continue;
            }
        };
        let ext = url_extension(&url).unwrap_or_else(|| "vtt".to_string());
        descriptors.push(DownloadDescriptor {
            source: url,
            source_key: track.file.clone(),
            destination: directory.join(format!("mediaTrack-{}.{}", index, ext)),
            role: ResourceRole::Track(index),
        });
    }

    Ok((kind, descriptors))
}

/// Point every downloaded reference in `item` at its local file.
///
/// Only the primary source is kept. A missing mapping for the primary source
/// or the poster is an error; tracks without one are dropped.
pub fn localize_item(item: &PlayableItem, local: &HashMap<String, PathBuf>) -> Result<PlayableItem> {
    let lookup = |key: &str| local.get(key).map(|path| path.to_string_lossy().into_owned());
    let mut localized = item.clone();

    let mut primary = item
        .primary_source()
        .cloned()
        .ok_or(OfflineError::MissingMediaSource)?;
    primary.file = lookup(&primary.file).ok_or_else(|| {
        OfflineError::ManifestError(format!("no local file for media source {}", primary.file))
    })?;
    localized.sources = vec![primary];

    if let Some(image) = &item.image {
        let path = lookup(image).ok_or_else(|| {
            OfflineError::ManifestError(format!("no local file for poster {}", image))
        })?;
        localized.image = Some(path);
    }

    localized.tracks = item
        .tracks
        .iter()
        .filter_map(|track| match lookup(&track.file) {
            Some(path) => {
                let mut track = track.clone();
                track.file = path;
                Some(track)
            }
            None => {
                log::warn!("Dropping track {} without a local file", track.file);
                None
            }
        })
        .collect();

    Ok(localized)
}

/// Downloads an item with all of its resources and writes its manifest
pub struct DownloadPlayerItemOperation {
    item: PlayableItem,
    storage: MediaStorage,
    transport: Transport,
    max_concurrent_resources: usize,
    minimum_bitrate: Option<u64>,
    status: OperationStatus,
    cancel: CancellationToken,
    phase: Mutex<ItemPhase>,
    tracker: RwLock<Option<SharedProgressTracker>>,
}

impl DownloadPlayerItemOperation {
    pub fn new(
        item: PlayableItem,
        storage: MediaStorage,
        transport: Transport,
        config: &DownloadConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            item,
            storage,
            transport,
            max_concurrent_resources: config.max_concurrent_resources,
            minimum_bitrate: config.minimum_bitrate,
            status: OperationStatus::new(),
            cancel,
            phase: Mutex::new(ItemPhase::Pending),
            tracker: RwLock::new(None),
        }
    }

    pub fn item(&self) -> &PlayableItem {
        &self.item
    }

    pub fn phase(&self) -> ItemPhase {
        *self.phase.lock()
    }

    /// Receives the primary media's progress
    pub fn set_progress_tracker(&self, tracker: SharedProgressTracker) {
        *self.tracker.write() = Some(tracker);
    }

    fn enter(&self, phase: ItemPhase) {
        log::debug!("{}: {:?}", self.describe(), phase);
        *self.phase.lock() = phase;
    }

    fn resource_operation(&self, descriptor: &DownloadDescriptor, kind: &MediaKind) -> ResourceOperation {
        let cancel = self.cancel.child_token();
        let is_asset = descriptor.role == ResourceRole::PrimaryMedia && *kind == MediaKind::Streaming;

        if is_asset {
            ResourceOperation::Asset(Arc::new(DownloadAssetOperation::new(
                self.transport.asset_downloader(),
                descriptor.source.clone(),
                descriptor.destination.clone(),
                self.item.display_title(),
                self.minimum_bitrate,
                cancel,
            )))
        } else {
            ResourceOperation::File(Arc::new(DownloadFileOperation::new(
                self.transport.client().clone(),
                descriptor.source.clone(),
                descriptor.destination.clone(),
                cancel,
            )))
        }
    }

    async fn run(&self, media_id: &str) -> Result<()> {
        self.enter(ItemPhase::FanningOut);
        let directory = self.storage.create_item_directory(media_id).await?;
        let (kind, descriptors) = plan_downloads(&self.item, &directory)?;

        let children: Vec<(DownloadDescriptor, ResourceOperation)> = descriptors
            .into_iter()
            .map(|descriptor| {
                let operation = self.resource_operation(&descriptor, &kind);
                (descriptor, operation)
            })
            .collect();

        if let Some(tracker) = self.tracker.read().clone() {
            if let Some((_, primary)) = children
                .iter()
                .find(|(d, _)| d.role == ResourceRole::PrimaryMedia)
            {
                primary.set_progress_tracker(tracker);
            }
        }

        let queue = OperationQueue::new(self.max_concurrent_resources);
        for (_, operation) in &children {
            operation.enqueue(&queue);
        }

        self.enter(ItemPhase::AwaitingChildren);
        let mut pending: FuturesUnordered<_> = children
            .iter()
            .map(|(descriptor, operation)| async move {
                let error = operation.as_operation().status().finished().await;
                (descriptor.role, error)
            })
            .collect();

        let mut first_failure: Option<(ResourceRole, Arc<OfflineError>)> = None;
        while let Some((role, error)) = pending.next().await {
            if let Some(error) = error {
                log::debug!("{} of {} failed: {}", role, media_id, error);
                if first_failure.is_none() {
                    first_failure = Some((role, error));
                }
            }
        }
        drop(pending);

        if self.cancel.is_cancelled() {
            return Err(OfflineError::Cancelled);
        }
        if let Some((role, source)) = first_failure {
            return Err(OfflineError::ResourceDownloadFailed {
                role: role.to_string(),
                source,
            });
        }

        self.enter(ItemPhase::WritingManifest);
        let local: HashMap<String, PathBuf> = children
            .iter()
            .map(|(descriptor, operation)| (descriptor.source_key.clone(), operation.local_path()))
            .collect();
        let localized = localize_item(&self.item, &local)?;
        Manifest::new(localized).save(&self.storage).await?;

        Ok(())
    }
}

#[async_trait]
impl AsyncOperation for DownloadPlayerItemOperation {
    fn status(&self) -> &OperationStatus {
        &self.status
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn describe(&self) -> String {
        format!("item download {}", self.item.id().unwrap_or("<no id>"))
    }

    async fn execute(&self) -> Result<()> {
        let media_id = self
            .item
            .id()
            .ok_or_else(|| OfflineError::invalid_input("item has no media id"))?
            .to_string();

        log::info!("Downloading '{}' ({})", self.item.display_title(), media_id);
        match self.run(&media_id).await {
            Ok(()) => {
                self.enter(ItemPhase::Done);
                log::info!("Downloaded {}", media_id);
                Ok(())
            }
            Err(e) => {
                self.enter(ItemPhase::Failed);
                Err(e)
            }
        }
    }
}
