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


//! HLS packaging
//!
//! Downloads an HLS stream into a self-contained package directory:
//!
//! ```text
//! videoSource.movpkg/
//!   index.m3u8        media playlist rewritten to local file names
//!   init-0.mp4        EXT-X-MAP sections
//!   key-0.key         EXT-X-KEY URIs
//!   segment-0.ts ...
//! ```
//!
//! # Variant Selection
//! For a master playlist, the non-I-frame variant with the lowest bandwidth
//! at or above the minimum bitrate is picked. Without a minimum, or when no
//! variant reaches it, the highest bandwidth wins.
//!
//! # Progress
//! Segments map onto the playlist timeline by their durations. Every
//! finished segment adds its span to a merged set of loaded ranges, which is
//! reported as an [`AssetEvent::TimeRangesLoaded`].

use crate::download::asset::{
    AssetDownloadRequest, AssetDownloader, AssetEvent, TimeRange, PACKAGE_ENTRY_POINT,
};
use crate::error::{OfflineError, Result};
use crate::file::storage::{ensure_directory_exists, safe_delete};
use crate::media::item::url_extension;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist, VariantStream};
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default [`AssetDownloader`]: packages HLS streams
#[derive(Debug, Clone)]
pub struct HlsAssetDownloader {
    client: Client,
    segment_concurrency: usize,
}

/// Merged, sorted loaded spans of the timeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedRanges {
    ranges: Vec<TimeRange>,
}

impl LoadedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a span, merging it with any span it touches
    pub fn insert(&mut self, range: TimeRange) {
        if range.duration <= 0.0 {
            return;
        }
        self.ranges.push(range);
        self.ranges
            .sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end() + 1e-6 => {
                    let end = last.end().max(range.end());
                    last.duration = end - last.start;
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }
}

/// One file to fetch into the package
#[derive(Debug, Clone)]
struct PackageFile {
    url: Url,
    local_name: String,
    /// Timeline spans this file completes
    spans: Vec<TimeRange>,
}

/// Pick the variant to download from a master playlist
pub fn select_variant(
    variants: &[VariantStream],
    minimum_bitrate: Option<u64>,
) -> Option<&VariantStream> {
    let candidates = variants.iter().filter(|v| !v.is_i_frame);

    let qualifying = minimum_bitrate.and_then(|minimum| {
        candidates
            .clone()
            .filter(|v| v.bandwidth >= minimum)
            .min_by_key(|v| v.bandwidth)
    });

    qualifying.or_else(|| candidates.max_by_key(|v| v.bandwidth))
}

impl HlsAssetDownloader {
    pub fn new(client: Client, segment_concurrency: usize) -> Self {
        Self {
            client,
            segment_concurrency: segment_concurrency.max(1),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(OfflineError::transport)?;

        if !response.status().is_success() {
            return Err(OfflineError::UnexpectedStatusCode {
                status_code: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(OfflineError::transport)?;
        if body.is_empty() {
            return Err(OfflineError::EmptyPayload(url.to_string()));
        }
        Ok(body)
    }

    /// Resolve `source` down to a media playlist and the URL it came from
    async fn load_media_playlist(
        &self,
        source: &Url,
        minimum_bitrate: Option<u64>,
    ) -> Result<(Url, MediaPlaylist)> {
        log::info!("Fetching playlist {}", source);
        let body = self.fetch(source).await?;

        match parse_playlist(&body)? {
            Playlist::MediaPlaylist(playlist) => Ok((source.clone(), playlist)),
            Playlist::MasterPlaylist(master) => {
                let variant = select_variant(&master.variants, minimum_bitrate).ok_or_else(|| {
                    OfflineError::PlaylistParse(format!("{} has no playable variants", source))
                })?;
                let variant_url = source.join(&variant.uri)?;
                log::info!(
                    "Selected variant {} (bandwidth {})",
                    variant_url,
                    variant.bandwidth
                );

                let body = self.fetch(&variant_url).await?;
                match parse_playlist(&body)? {
                    Playlist::MediaPlaylist(playlist) => Ok((variant_url, playlist)),
                    Playlist::MasterPlaylist(_) => Err(OfflineError::PlaylistParse(format!(
                        "{} is a master playlist nested in another",
                        variant_url
                    ))),
                }
            }
        }
    }

    async fn build_package(
        &self,
        request: &AssetDownloadRequest,
        package: &Path,
        events: &mpsc::UnboundedSender<AssetEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (playlist_url, mut playlist) =
            self.load_media_playlist(&request.source, request.minimum_bitrate).await?;

        if playlist.segments.is_empty() {
            return Err(OfflineError::PlaylistParse(format!(
                "{} has no segments",
                playlist_url
            )));
        }

        let (files, expected) = plan_package(&playlist_url, &mut playlist)?;
        log::debug!(
            "Packaging '{}': {} files, {:.1}s",
            request.title,
            files.len(),
            expected.duration
        );

        let mut loaded = LoadedRanges::new();
        let _ = events.send(AssetEvent::TimeRangesLoaded {
            loaded: Vec::new(),
            expected,
        });

        let mut downloads = stream::iter(files)
            .map(|file| async move {
                let body = self.fetch(&file.url).await?;
                let path = package.join(&file.local_name);
                tokio::fs::write(&path, &body)
                    .await
                    .map_err(|e| OfflineError::file_io("write", &path, e))?;
                Ok::<_, OfflineError>(file.spans)
            })
            .buffer_unordered(self.segment_concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OfflineError::Cancelled),
                next = downloads.next() => next,
            };
            let Some(result) = next else {
                break;
            };

            let spans = result?;
            if spans.is_empty() {
                continue;
            }
            for span in spans {
                loaded.insert(span);
            }
            let _ = events.send(AssetEvent::TimeRangesLoaded {
                loaded: loaded.ranges().to_vec(),
                expected,
            });
        }

        let mut index = Vec::new();
        playlist
            .write_to(&mut index)
            .map_err(|e| OfflineError::internal(format!("Failed to encode playlist: {}", e)))?;
        let index_path = package.join(PACKAGE_ENTRY_POINT);
        tokio::fs::write(&index_path, index)
            .await
            .map_err(|e| OfflineError::file_io("write", &index_path, e))?;

        Ok(())
    }
}

#[async_trait]
impl AssetDownloader for HlsAssetDownloader {
    async fn download_asset(
        &self,
        request: &AssetDownloadRequest,
        events: mpsc::UnboundedSender<AssetEvent>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let package = request
            .work_directory
            .join(format!(".asset-{}", uuid::Uuid::new_v4()));
        ensure_directory_exists(&package).await?;

        match self.build_package(request, &package, &events, cancel).await {
            Ok(()) => Ok(package),
            Err(e) => {
                if let Err(cleanup) = safe_delete(&package).await {
                    log::warn!("Could not remove {}: {}", package.display(), cleanup);
                }
                Err(e)
            }
        }
    }
}

fn parse_playlist(body: &[u8]) -> Result<Playlist> {
    m3u8_rs::parse_playlist_res(body)
        .map_err(|e| OfflineError::PlaylistParse(format!("{:?}", e)))
}

/// Assign local names to every remote file the playlist references and
/// rewrite the playlist to use them.
///
/// Returns the files to fetch (deduplicated by URL) and the expected
/// timeline.
fn plan_package(base: &Url, playlist: &mut MediaPlaylist) -> Result<(Vec<PackageFile>, TimeRange)> {
    let mut files: Vec<PackageFile> = Vec::new();
    let mut by_url: HashMap<Url, usize> = HashMap::new();
    let mut cursor = 0.0_f64;

    for segment in playlist.segments.iter_mut() {
        if let Some(map) = segment.map.as_mut() {
            let index = claim(&mut files, &mut by_url, base.join(&map.uri)?, "init", "mp4");
            map.uri = files[index].local_name.clone();
        }

        if let Some(key) = segment.key.as_mut() {
            if key.method != KeyMethod::None {
                if let Some(uri) = key.uri.as_mut() {
                    let url = base.join(uri)?;
                    // Key server schemes like skd:// are resolved by the player
                    if matches!(url.scheme(), "http" | "https") {
                        let index = claim(&mut files, &mut by_url, url, "key", "key");
                        *uri = files[index].local_name.clone();
                    }
                }
            }
        }

        let index = claim(&mut files, &mut by_url, base.join(&segment.uri)?, "segment", "ts");
        let duration = f64::from(segment.duration.max(0.0));
        files[index].spans.push(TimeRange::new(cursor, duration));
        segment.uri = files[index].local_name.clone();
        cursor += duration;
    }

    Ok((files, TimeRange::new(0.0, cursor)))
}

/// Index of the package file for `url`, adding it on first sight
fn claim(
    files: &mut Vec<PackageFile>,
    by_url: &mut HashMap<Url, usize>,
    url: Url,
    prefix: &str,
    default_ext: &str,
) -> usize {
    if let Some(index) = by_url.get(&url) {
        return *index;
    }
    let count = files
        .iter()
        .filter(|f| f.local_name.starts_with(&format!("{}-", prefix)))
        .count();
    let ext = url_extension(&url).unwrap_or_else(|| default_ext.to_string());
    files.push(PackageFile {
        url: url.clone(),
        local_name: format!("{}-{}.{}", prefix, count, ext),
        spans: Vec::new(),
    });
    by_url.insert(url, files.len() - 1);
    files.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=150000,RESOLUTION=416x234
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=640000,RESOLUTION=640x360
mid/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
high/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXTINF:2.0,
seg2.ts
#EXT-X-ENDLIST
";

    fn variants() -> Vec<VariantStream> {
        match m3u8_rs::parse_playlist_res(MASTER.as_bytes()).unwrap() {
            Playlist::MasterPlaylist(master) => master.variants,
            Playlist::MediaPlaylist(_) => panic!("expected master playlist"),
        }
    }

    #[test]
    fn test_select_variant() {
        let variants = variants();
        let pick = |min| select_variant(&variants, min).map(|v| v.bandwidth);

        assert_eq!(pick(None), Some(1_280_000));
        assert_eq!(pick(Some(265_000)), Some(640_000));
        assert_eq!(pick(Some(150_000)), Some(150_000));
        assert_eq!(pick(Some(5_000_000)), Some(1_280_000));
        assert_eq!(select_variant(&[], None).map(|v| v.bandwidth), None);
    }

    #[test]
    fn test_loaded_ranges_merge() {
        let mut loaded = LoadedRanges::new();
        loaded.insert(TimeRange::new(8.0, 2.0));
        loaded.insert(TimeRange::new(0.0, 4.0));
        assert_eq!(loaded.ranges().len(), 2);

        loaded.insert(TimeRange::new(4.0, 4.0));
        assert_eq!(loaded.ranges(), &[TimeRange::new(0.0, 10.0)]);

        loaded.insert(TimeRange::new(2.0, 0.0));
        assert_eq!(loaded.ranges().len(), 1);
    }

    #[test]
    fn test_plan_rewrites_and_dedupes() {
        let media = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k1\"
#EXTINF:4.0,
#EXT-X-BYTERANGE:1000@0
media.mp4
#EXTINF:4.0,
#EXT-X-BYTERANGE:1000@1000
media.mp4
#EXT-X-ENDLIST
";
        let mut playlist = match m3u8_rs::parse_playlist_res(media.as_bytes()).unwrap() {
            Playlist::MediaPlaylist(playlist) => playlist,
            Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
        };
        let base = Url::parse("https://cdn.example.com/v/index.m3u8").unwrap();

        let (files, expected) = plan_package(&base, &mut playlist).unwrap();

        assert_eq!(expected, TimeRange::new(0.0, 8.0));
        let names: Vec<_> = files.iter().map(|f| f.local_name.as_str()).collect();
        assert_eq!(names, vec!["init-0.mp4", "key-0.key", "segment-0.mp4"]);
        assert_eq!(files[2].spans.len(), 2);
        assert_eq!(files[0].url.as_str(), "https://cdn.example.com/v/init.mp4");

        assert_eq!(playlist.segments[0].uri, "segment-0.mp4");
        assert_eq!(playlist.segments[0].map.as_ref().unwrap().uri, "init-0.mp4");
        assert_eq!(
            playlist.segments[0].key.as_ref().unwrap().uri.as_deref(),
            Some("key-0.key")
        );
    }

    async fn mount(server: &MockServer, at: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    fn request(server: &MockServer, work: &Path, minimum_bitrate: Option<u64>) -> AssetDownloadRequest {
        AssetDownloadRequest {
            source: Url::parse(&format!("{}/hls/master.m3u8", server.uri())).unwrap(),
            title: "Stream".to_string(),
            minimum_bitrate,
            work_directory: work.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_downloads_selected_variant() {
        let server = MockServer::start().await;
        mount(&server, "/hls/master.m3u8", MASTER.as_bytes()).await;
        mount(&server, "/hls/mid/index.m3u8", MEDIA.as_bytes()).await;
        for name in ["seg0.ts", "seg1.ts", "seg2.ts"] {
            mount(&server, &format!("/hls/mid/{}", name), name.as_bytes()).await;
        }

        let work = TempDir::new().unwrap();
        let downloader = HlsAssetDownloader::new(Client::new(), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let package = downloader
            .download_asset(&request(&server, work.path(), Some(265_000)), tx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(package.starts_with(work.path()));
        let index = tokio::fs::read_to_string(package.join(PACKAGE_ENTRY_POINT)).await.unwrap();
        assert!(index.contains("segment-0.ts"));
        assert!(!index.contains("seg0.ts"));
        assert_eq!(tokio::fs::read(package.join("segment-2.ts")).await.unwrap(), b"seg2.ts");

        let mut last = None;
        while let Ok(AssetEvent::TimeRangesLoaded { loaded, expected }) = rx.try_recv() {
            last = Some((loaded, expected));
        }
        let (loaded, expected) = last.unwrap();
        assert_eq!(expected, TimeRange::new(0.0, 10.0));
        assert_eq!(loaded, vec![TimeRange::new(0.0, 10.0)]);
    }

    #[tokio::test]
    async fn test_missing_segment_removes_package() {
        let server = MockServer::start().await;
        mount(&server, "/hls/master.m3u8", MEDIA.as_bytes()).await;
        mount(&server, "/hls/seg0.ts", b"seg0").await;
        mount(&server, "/hls/seg1.ts", b"seg1").await;
        // seg2.ts is not mounted and answers 404

        let work = TempDir::new().unwrap();
        let downloader = HlsAssetDownloader::new(Client::new(), 4);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = downloader
            .download_asset(&request(&server, work.path(), None), tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OfflineError::UnexpectedStatusCode { status_code: 404, .. }));
        let mut entries = tokio::fs::read_dir(work.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_playlist() {
        let server = MockServer::start().await;
        mount(&server, "/hls/master.m3u8", b"<html>not a playlist</html>").await;

        let work = TempDir::new().unwrap();
        let downloader = HlsAssetDownloader::new(Client::new(), 4);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = downloader
            .download_asset(&request(&server, work.path(), None), tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::PlaylistParse(_)));
    }
}
