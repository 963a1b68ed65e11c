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


//! Playable item description
//!
//! The player SDK hands us items as JSON objects. Field names follow the
//! SDK (`mediaid`, `sources[].file`, `image`, `tracks[].file`), and any
//! field we do not model is carried through untouched in `extra` so a
//! reconstructed item is as complete as the original.

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// One encoding of the item's video or audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    /// Remote URL, or an absolute local path once downloaded
    pub file: String,

    /// Format hint from the SDK (e.g. "mp4", "hls")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

impl MediaSource {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            media_type: None,
            label: None,
            default: None,
        }
    }
}

/// Auxiliary track (captions, chapters, thumbnails)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub file: String,

    /// Track kind tag (e.g. "captions", "thumbnails")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

impl MediaTrack {
    pub fn new(file: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            kind: Some(kind.into()),
            label: None,
            default: None,
        }
    }
}

/// A video/audio asset and its auxiliary resources
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayableItem {
    #[serde(rename = "mediaid", default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub sources: Vec<MediaSource>,

    /// Poster image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub tracks: Vec<MediaTrack>,

    /// Fields we do not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PlayableItem {
    pub fn new(media_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            media_id: Some(media_id.into()),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, file: impl Into<String>) -> Self {
        self.sources.push(MediaSource::new(file));
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_track(mut self, file: impl Into<String>, kind: impl Into<String>) -> Self {
        self.tracks.push(MediaTrack::new(file, kind));
        self
    }

    /// The media id, if present and non-empty
    pub fn id(&self) -> Option<&str> {
        self.media_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// The source that gets downloaded for offline playback
    pub fn primary_source(&self) -> Option<&MediaSource> {
        self.sources.first()
    }

    /// Title used where a platform API requires one
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("untitled")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How the primary media has to be transferred
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    /// Flat container, downloaded as a single file
    Progressive { extension: String },
    /// Segmented playlist, downloaded as an asset package
    Streaming,
}

impl MediaKind {
    /// Classify a media URL by its path extension
    pub fn classify(url: &Url) -> Result<Self> {
        let extension = url_extension(url).unwrap_or_default();
        match extension.as_str() {
            "mp4" | "m4a" | "m4v" | "mov" | "mp3" => Ok(MediaKind::Progressive { extension }),
            "m3u8" => Ok(MediaKind::Streaming),
            _ => Err(OfflineError::UnsupportedMediaFormat {
                url: url.to_string(),
                extension,
            }),
        }
    }
}

/// Lowercased extension of the last path segment
pub fn url_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.last()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Interpret a resource reference as a local path, if it is one
pub fn local_path(file: &str) -> Option<PathBuf> {
    if let Ok(url) = Url::parse(file) {
        return match url.scheme() {
            "file" => url.to_file_path().ok(),
            // Single letter schemes are Windows drive prefixes
            scheme if scheme.len() == 1 => Some(PathBuf::from(file)),
            _ => None,
        };
    }
    Some(PathBuf::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_field_names() {
        let json = r#"{
            "mediaid": "abc123",
            "title": "Big Buck Bunny",
            "sources": [{"file": "https://x/video.mp4", "type": "mp4"}],
            "image": "https://x/poster.jpg",
            "tracks": [{"file": "https://x/en.vtt", "kind": "captions", "label": "English"}],
            "feedid": "xyz"
        }"#;

        let item = PlayableItem::from_json(json).unwrap();
        assert_eq!(item.id(), Some("abc123"));
        assert_eq!(item.primary_source().unwrap().media_type.as_deref(), Some("mp4"));
        assert_eq!(item.tracks[0].kind.as_deref(), Some("captions"));
        assert_eq!(item.extra.get("feedid").and_then(|v| v.as_str()), Some("xyz"));

        let value: serde_json::Value = serde_json::from_str(&item.to_json().unwrap()).unwrap();
        assert_eq!(value["mediaid"], "abc123");
        assert_eq!(value["sources"][0]["type"], "mp4");
        assert_eq!(value["feedid"], "xyz");
    }

    #[test]
    fn test_blank_id_is_missing() {
        let item = PlayableItem::new("  ", "Untitled");
        assert_eq!(item.id(), None);
        assert_eq!(PlayableItem::default().display_title(), "untitled");
    }

    #[test]
    fn test_classify() {
        let mp4 = Url::parse("https://x/path/Video.MP4?token=1").unwrap();
        assert_eq!(
            MediaKind::classify(&mp4).unwrap(),
            MediaKind::Progressive { extension: "mp4".to_string() }
        );

        let hls = Url::parse("https://x/stream/master.m3u8").unwrap();
        assert_eq!(MediaKind::classify(&hls).unwrap(), MediaKind::Streaming);

        let avi = Url::parse("https://x/video.avi").unwrap();
        assert!(matches!(
            MediaKind::classify(&avi),
            Err(OfflineError::UnsupportedMediaFormat { extension, .. }) if extension == "avi"
        ));

        let bare = Url::parse("https://x/video").unwrap();
        assert!(MediaKind::classify(&bare).is_err());
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("/data/item-1/videoSource.mp4"), Some(PathBuf::from("/data/item-1/videoSource.mp4")));
        assert_eq!(local_path("https://x/video.mp4"), None);
        assert_eq!(local_path("file:///data/video.mp4"), Some(PathBuf::from("/data/video.mp4")));
    }
}
