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


//! Download progress reporting
//!
//! Progress is a single fraction in `[0, 1]` pushed to a write-only
//! [`ProgressTracker`]. Byte-counting operations run their updates through a
//! [`ProgressThrottle`] so observers see at most one report per percent.

use std::sync::Arc;

/// Write-only progress sink. Values are expected in `[0, 1]`.
pub trait ProgressTracker: Send + Sync {
    fn set_progress(&self, progress: f64);
}

/// Closures are trackers too
impl<F> ProgressTracker for F
where
    F: Fn(f64) + Send + Sync,
{
    fn set_progress(&self, progress: f64) {
        self(progress)
    }
}

/// Shared tracker handle
pub type SharedProgressTracker = Arc<dyn ProgressTracker>;

/// Default minimum step between two reports
pub const DEFAULT_PROGRESS_STEP: f64 = 0.01;

/// Turns byte counts into a throttled, non-decreasing fraction
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    /// Expected total, `None` if the server did not say
    total_bytes: Option<u64>,

    /// Last value that was let through
    last_reported: Option<f64>,

    min_step: f64,
}

impl ProgressThrottle {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self::with_step(total_bytes, DEFAULT_PROGRESS_STEP)
    }

    pub fn with_step(total_bytes: Option<u64>, min_step: f64) -> Self {
        Self {
            total_bytes: total_bytes.filter(|total| *total > 0),
            last_reported: None,
            min_step,
        }
    }

    /// Feed the running byte count.
    ///
    /// Returns the fraction to report, or `None` if the change is too small
    /// to be worth reporting. Without a known total nothing is reported until
    /// [`finish`](Self::finish).
    pub fn update(&mut self, bytes_received: u64) -> Option<f64> {
        let total = self.total_bytes?;
        // Never claim completion before the stream actually ended
        let fraction = (bytes_received as f64 / total as f64).clamp(0.0, 0.999);
        self.accept(fraction)
    }

    /// The final report, always exactly `1.0` unless already reported
    pub fn finish(&mut self) -> Option<f64> {
        if self.last_reported == Some(1.0) {
            return None;
        }
        self.last_reported = Some(1.0);
        Some(1.0)
    }

    pub fn last_reported(&self) -> Option<f64> {
        self.last_reported
    }

    fn accept(&mut self, fraction: f64) -> Option<f64> {
        match self.last_reported {
            None => {}
            Some(last) if fraction - last >= self.min_step => {}
            Some(_) => return None,
        }
        self.last_reported = Some(fraction);
        Some(fraction)
    }
}
