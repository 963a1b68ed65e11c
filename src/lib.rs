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


//! Offline downloads of playable media items
//!
//! Hand a [`PlayableItem`] to a [`PlayerItemDownloadManager`] and it downloads
//! the item's media, poster and text tracks into a per-item directory,
//! together with a manifest that describes the item in terms of the local
//! files. Downloaded items survive restarts and can be removed again.

pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod media;

// C bridge for the iOS host app
pub mod ios_bridge;

pub use config::DownloadConfig;
pub use download::{
    ItemState, PlayerItemDownloadManager, PlayerItemDownloadObserver, ProgressTracker,
};
pub use error::{OfflineError, Result};
pub use media::{MediaKind, PlayableItem};
