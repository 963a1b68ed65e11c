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


//! Item downloads
//!
//! An item download fans out into one operation per remote resource (the
//! primary media, the poster image, each text track), waits for all of them
//! and writes a manifest that points at the local copies.
//!
//! - [`operation`]: lifecycle shared by every download operation
//! - [`file`] / [`asset`]: single-resource downloads
//! - [`item`]: the per-item orchestrator
//! - [`manager`]: the public entry point

pub mod asset;
pub mod file;
pub mod hls;
pub mod item;
pub mod manager;
pub mod manifest;
pub mod observer;
pub mod operation;
pub mod progress;
pub mod transport;

// Re-export commonly used types
pub use asset::{AssetDownloader, AssetEvent, DownloadAssetOperation, TimeRange};
pub use file::DownloadFileOperation;
pub use hls::HlsAssetDownloader;
pub use item::{DownloadDescriptor, DownloadPlayerItemOperation, ResourceRole};
pub use manager::{ItemState, PlayerItemDownloadManager};
pub use manifest::Manifest;
pub use observer::PlayerItemDownloadObserver;
pub use operation::{AsyncOperation, OperationQueue, OperationState, OperationStatus};
pub use progress::{ProgressThrottle, ProgressTracker, SharedProgressTracker};
pub use transport::Transport;
