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


//! Single-file HTTP download
//!
//! # Key Features
//! - Streams the body in chunks into `<destination>.part`
//! - Buffered writes, flushed once at the end
//! - Replaces any existing file at the destination only after the body is
//!   complete, so a failed download never clobbers an older copy
//! - Removes the partial file on every failure path
//! - Cancellation is observed while waiting for headers and between chunks

use crate::download::operation::{AsyncOperation, OperationStatus};
use crate::download::progress::{ProgressThrottle, SharedProgressTracker};
use crate::error::{OfflineError, Result};
use crate::file::storage::{ensure_directory_exists, replace_with, safe_delete};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Write buffer size
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Downloads one remote resource to one local file
pub struct DownloadFileOperation {
    client: Client,
    source: Url,
    destination: PathBuf,
    status: OperationStatus,
    cancel: CancellationToken,
    tracker: RwLock<Option<SharedProgressTracker>>,
}

impl DownloadFileOperation {
    pub fn new(client: Client, source: Url, destination: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            client,
            source,
            destination,
            status: OperationStatus::new(),
            cancel,
            tracker: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Attach the sink for progress reports
    pub fn set_progress_tracker(&self, tracker: SharedProgressTracker) {
        *self.tracker.write() = Some(tracker);
    }

    fn report(&self, progress: f64) {
        if let Some(tracker) = self.tracker.read().as_ref() {
            tracker.set_progress(progress);
        }
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self
            .destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        self.destination.with_file_name(name)
    }

    /// Stream the body into `part`, returning the throttle for the final report
    async fn fetch_into(&self, part: &Path) -> Result<ProgressThrottle> {
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(OfflineError::Cancelled),
            response = self.client.get(self.source.clone()).send() => {
                response.map_err(OfflineError::transport)?
            }
        };

        if !response.status().is_success() {
            return Err(OfflineError::UnexpectedStatusCode {
                status_code: response.status().as_u16(),
                url: self.source.to_string(),
            });
        }

        let content_length = response.content_length();
        let mut throttle = ProgressThrottle::new(content_length);

        if let Some(parent) = part.parent() {
            ensure_directory_exists(parent).await?;
        }
        let file = File::create(part)
            .await
            .map_err(|e| OfflineError::file_io("create", part, e))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OfflineError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(OfflineError::transport)?;

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| OfflineError::file_io("write", part, e))?;
            received += chunk.len() as u64;

            if let Some(progress) = throttle.update(received) {
                self.report(progress);
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| OfflineError::file_io("flush", part, e))?;
        writer
            .shutdown()
            .await
            .map_err(|e| OfflineError::file_io("close", part, e))?;

        if received == 0 {
            return Err(OfflineError::EmptyPayload(self.source.to_string()));
        }
        if let Some(expected) = content_length {
            if received < expected {
                return Err(OfflineError::network_error(
                    format!(
                        "Connection closed after {}/{} bytes of {}",
                        received, expected, self.source
                    ),
                    true,
                ));
            }
        }

        log::debug!("Fetched {} bytes from {}", received, self.source);
        Ok(throttle)
    }
}

#[async_trait]
impl AsyncOperation for DownloadFileOperation {
    fn status(&self) -> &OperationStatus {
        &self.status
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn describe(&self) -> String {
        format!("file download {}", self.source)
    }

    async fn execute(&self) -> Result<()> {
        let part = self.part_path();

        let result = match self.fetch_into(&part).await {
            Ok(throttle) => replace_with(&part, &self.destination).await.map(|()| throttle),
            Err(e) => Err(e),
        };

        match result {
            Ok(mut throttle) => {
                if let Some(progress) = throttle.finish() {
                    self.report(progress);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = safe_delete(&part).await {
                    log::warn!("Could not remove partial download {}: {}", part.display(), cleanup);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::operation::run_operation;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(body: Vec<u8>, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }

    fn operation(server: &MockServer, destination: PathBuf) -> DownloadFileOperation {
        let url = Url::parse(&format!("{}/video.mp4", server.uri())).unwrap();
        DownloadFileOperation::new(Client::new(), url, destination, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_download_reports_monotonic_progress() {
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let server = serve(body.clone(), 200).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("item-a").join("videoSource.mp4");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let op = operation(&server, dest.clone());
        op.set_progress_tracker(Arc::new(move |p: f64| sink.lock().push(p)));

        run_operation(&op).await;

        assert!(op.status().error().is_none());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
        assert!(!dir.path().join("item-a").join("videoSource.mp4.part").exists());

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
        assert_eq!(seen.iter().filter(|p| **p == 1.0).count(), 1);
    }

    #[tokio::test]
    async fn test_not_found_leaves_nothing_behind() {
        let server = serve(Vec::new(), 404).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.mp4");

        let op = operation(&server, dest.clone());
        run_operation(&op).await;

        let error = op.status().error().unwrap();
        assert!(matches!(*error, OfflineError::UnexpectedStatusCode { status_code: 404, .. }));
        assert!(!dest.exists());
        assert!(!dir.path().join("videoSource.mp4.part").exists());
    }

    #[tokio::test]
    async fn test_empty_body_is_an_error() {
        let server = serve(Vec::new(), 200).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.mp4");

        let op = operation(&server, dest.clone());
        run_operation(&op).await;

        assert!(matches!(op.status().error().as_deref(), Some(OfflineError::EmptyPayload(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_replaces_existing_file() {
        let server = serve(b"fresh".to_vec(), 200).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.mp4");
        tokio::fs::write(&dest, b"stale content").await.unwrap();

        let op = operation(&server, dest.clone());
        run_operation(&op).await;

        assert!(op.status().error().is_none());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("videoSource.mp4");

        let op = Arc::new(operation(&server, dest.clone()));
        let runner = Arc::clone(&op);
        let handle = tokio::spawn(async move { run_operation(runner.as_ref()).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        op.cancel();
        handle.await.unwrap();

        assert!(matches!(op.status().error().as_deref(), Some(OfflineError::Cancelled)));
        assert!(!dest.exists());
    }
}
