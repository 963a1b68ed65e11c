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


//! Media descriptions and poster images
//!
//! This module holds the playable item model shared with the player SDK and
//! the bounded image loader used for poster artwork.

pub mod image;
pub mod item;

// Re-export commonly used types
pub use image::{ImageCache, ImageLoader};
pub use item::{MediaKind, MediaSource, MediaTrack, PlayableItem};
