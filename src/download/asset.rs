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


//! Streaming asset download
//!
//! A streaming asset is downloaded as a package directory by an
//! [`AssetDownloader`]. The downloader works in a temporary location of its
//! own choosing under the request's work directory and reports how much of
//! the timeline it has loaded through [`AssetEvent`] messages. Once it hands
//! back the finished package, [`DownloadAssetOperation`] moves it to its
//! final destination.
//!
//! # Progress
//! Progress is the summed duration of the loaded time ranges divided by the
//! expected duration, clamped to `[0, 1]`. Downloaders may report ranges out
//! of order, so observers must tolerate values that go down.

use crate::download::operation::{AsyncOperation, OperationStatus};
use crate::download::progress::SharedProgressTracker;
use crate::error::{OfflineError, Result};
use crate::file::storage::{replace_with, safe_delete};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Playable entry point inside a downloaded package
pub const PACKAGE_ENTRY_POINT: &str = "index.m3u8";

/// A span of the media timeline, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn new(start: f64, duration: f64) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Notification from an asset downloader
#[derive(Debug, Clone, PartialEq)]
pub enum AssetEvent {
    /// The set of loaded ranges changed
    TimeRangesLoaded {
        loaded: Vec<TimeRange>,
        expected: TimeRange,
    },
}

/// What an asset downloader is asked to fetch
#[derive(Debug, Clone)]
pub struct AssetDownloadRequest {
    pub source: Url,
    pub title: String,
    /// Lowest acceptable variant bitrate in bits/s, `None` for best quality
    pub minimum_bitrate: Option<u64>,
    /// Directory the downloader creates its temporary package in
    pub work_directory: PathBuf,
}

/// Platform capability that downloads a streaming asset as a package.
///
/// Implementations must remove their temporary package before returning an
/// error, and must stop promptly once `cancel` fires.
#[async_trait]
pub trait AssetDownloader: Send + Sync {
    /// Download the asset and return the path of the finished temporary
    /// package directory.
    async fn download_asset(
        &self,
        request: &AssetDownloadRequest,
        events: mpsc::UnboundedSender<AssetEvent>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// Fraction of `expected` covered by `loaded`, clamped to `[0, 1]`
pub fn loaded_fraction(loaded: &[TimeRange], expected: &TimeRange) -> f64 {
    if expected.duration <= 0.0 {
        return 0.0;
    }
    let total: f64 = loaded.iter().map(|r| r.duration.max(0.0)).sum();
    (total / expected.duration).clamp(0.0, 1.0)
}

/// Downloads a streaming asset into a package directory
pub struct DownloadAssetOperation {
    downloader: Arc<dyn AssetDownloader>,
    request: AssetDownloadRequest,
    destination: PathBuf,
    status: OperationStatus,
    cancel: CancellationToken,
    tracker: RwLock<Option<SharedProgressTracker>>,
}

impl DownloadAssetOperation {
    pub fn new(
        downloader: Arc<dyn AssetDownloader>,
        source: Url,
        destination: PathBuf,
        title: impl Into<String>,
        minimum_bitrate: Option<u64>,
        cancel: CancellationToken,
    ) -> Self {
        let work_directory = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            downloader,
            request: AssetDownloadRequest {
                source,
                title: title.into(),
                minimum_bitrate,
                work_directory,
            },
            destination,
            status: OperationStatus::new(),
            cancel,
            tracker: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &Url {
        &self.request.source
    }

    /// Package directory the asset ends up in
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Playable entry point of the finished package
    pub fn local_path(&self) -> PathBuf {
        self.destination.join(PACKAGE_ENTRY_POINT)
    }

    pub fn set_progress_tracker(&self, tracker: SharedProgressTracker) {
        *self.tracker.write() = Some(tracker);
    }

    fn report(&self, progress: f64) {
        if let Some(tracker) = self.tracker.read().as_ref() {
            tracker.set_progress(progress);
        }
    }

    async fn relay_events(&self, mut events: mpsc::UnboundedReceiver<AssetEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AssetEvent::TimeRangesLoaded { loaded, expected } => {
                    self.report(loaded_fraction(&loaded, &expected));
                }
            }
        }
    }
}

#[async_trait]
impl AsyncOperation for DownloadAssetOperation {
    fn status(&self) -> &OperationStatus {
        &self.status
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn describe(&self) -> String {
        format!("asset download {}", self.request.source)
    }

    async fn execute(&self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        // The sender is dropped with the download future, which ends the relay
        let download = self.downloader.download_asset(&self.request, tx, &self.cancel);
        let (result, ()) = tokio::join!(download, self.relay_events(rx));
        let package = result?;

        if self.cancel.is_cancelled() {
            if let Err(cleanup) = safe_delete(&package).await {
                log::warn!("Could not remove cancelled package {}: {}", package.display(), cleanup);
            }
            return Err(OfflineError::Cancelled);
        }

        if let Err(e) = replace_with(&package, &self.destination).await {
            if let Err(cleanup) = safe_delete(&package).await {
                log::warn!("Could not remove asset package {}: {}", package.display(), cleanup);
            }
            return Err(e);
        }

        log::debug!(
            "Stored asset '{}' at {}",
            self.request.title,
            self.destination.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::operation::run_operation;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Writes a tiny package and reports two loading steps
    struct FakeDownloader {
        fail: bool,
        /// Cancel right after the package is complete
        cancel_when_done: bool,
        seen_request: Mutex<Option<AssetDownloadRequest>>,
    }

    impl FakeDownloader {
        fn new(fail: bool) -> Self {
            Self { fail, cancel_when_done: false, seen_request: Mutex::new(None) }
        }
    }

    #[async_trait]
    impl AssetDownloader for FakeDownloader {
        async fn download_asset(
            &self,
            request: &AssetDownloadRequest,
            events: mpsc::UnboundedSender<AssetEvent>,
            cancel: &CancellationToken,
        ) -> Result<PathBuf> {
            *self.seen_request.lock() = Some(request.clone());
            let expected = TimeRange::new(0.0, 10.0);

            let _ = events.send(AssetEvent::TimeRangesLoaded {
                loaded: vec![TimeRange::new(0.0, 5.0)],
                expected,
            });
            if self.fail {
                return Err(OfflineError::network_error("connection reset", true));
            }

            let package = request.work_directory.join(".asset-test");
            tokio::fs::create_dir_all(&package).await?;
            tokio::fs::write(package.join(PACKAGE_ENTRY_POINT), b"#EXTM3U\n").await?;

            let _ = events.send(AssetEvent::TimeRangesLoaded {
                loaded: vec![TimeRange::new(0.0, 5.0), TimeRange::new(5.0, 5.0)],
                expected,
            });
            if self.cancel_when_done {
                cancel.cancel();
            }
            Ok(package)
        }
    }

    fn operation(downloader: Arc<FakeDownloader>, destination: PathBuf) -> DownloadAssetOperation {
        DownloadAssetOperation::new(
            downloader,
            Url::parse("https://cdn.example.com/master.m3u8").unwrap(),
            destination,
            "Big Buck Bunny",
            Some(265_000),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_loaded_fraction() {
        let expected = TimeRange::new(0.0, 20.0);
        assert_eq!(loaded_fraction(&[], &expected), 0.0);
        assert_eq!(loaded_fraction(&[TimeRange::new(0.0, 5.0)], &expected), 0.25);
        assert_eq!(loaded_fraction(&[TimeRange::new(0.0, 50.0)], &expected), 1.0);
        assert_eq!(loaded_fraction(&[TimeRange::new(0.0, 5.0)], &TimeRange::new(0.0, 0.0)), 0.0);
    }

    #[tokio::test]
    async fn test_package_is_moved_into_place() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.movpkg");
        let downloader = Arc::new(FakeDownloader::new(false));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let op = operation(Arc::clone(&downloader), dest.clone());
        op.set_progress_tracker(Arc::new(move |p: f64| sink.lock().push(p)));

        run_operation(&op).await;

        assert!(op.status().error().is_none());
        assert!(op.local_path().exists());
        assert!(!dir.path().join(".asset-test").exists());
        assert_eq!(*seen.lock(), vec![0.5, 1.0]);

        let request = downloader.seen_request.lock().clone().unwrap();
        assert_eq!(request.work_directory, dir.path());
        assert_eq!(request.minimum_bitrate, Some(265_000));
        assert_eq!(request.title, "Big Buck Bunny");
    }

    #[tokio::test]
    async fn test_failure_leaves_no_package() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.movpkg");

        let op = operation(Arc::new(FakeDownloader::new(true)), dest.clone());
        run_operation(&op).await;

        assert!(op.status().error().unwrap().is_transport_error());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_after_download_discards_package() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.movpkg");
        let downloader = Arc::new(FakeDownloader {
            cancel_when_done: true,
            ..FakeDownloader::new(false)
        });

        let op = operation(downloader, dest.clone());
        run_operation(&op).await;

        assert!(matches!(op.status().error().as_deref(), Some(OfflineError::Cancelled)));
        assert!(!dest.exists());
        assert!(!dir.path().join(".asset-test").exists());
    }
}
