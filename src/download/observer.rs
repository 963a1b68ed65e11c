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


//! Client-facing handle for one item download
//!
//! Everything the host registers on an observer (a progress tracker,
//! completion callbacks) and everything the download reports (progress,
//! completion) goes through one channel to a single dispatcher task. That
//! task is the only place callbacks run, so for one download they never run
//! concurrently, and progress is always delivered before completion.

use crate::download::progress::{ProgressTracker, SharedProgressTracker};
use crate::error::OfflineError;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

type CompletionCallback = Box<dyn FnOnce(Option<Arc<OfflineError>>) + Send>;

enum ObserverEvent {
    Progress(f64),
    Complete(Option<Arc<OfflineError>>),
    AttachTracker(SharedProgressTracker),
    OnComplete(CompletionCallback),
}

/// Published state, readable without going through the dispatcher
#[derive(Debug, Clone, Default)]
struct Snapshot {
    progress: f64,
    finished: bool,
    error: Option<Arc<OfflineError>>,
}

/// Observes progress and completion of one item download
#[derive(Clone)]
pub struct PlayerItemDownloadObserver {
    media_id: Arc<str>,
    events: mpsc::UnboundedSender<ObserverEvent>,
    snapshot: watch::Receiver<Snapshot>,
}

impl std::fmt::Debug for PlayerItemDownloadObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("PlayerItemDownloadObserver")
            .field("media_id", &self.media_id)
            .field("progress", &snapshot.progress)
            .field("finished", &snapshot.finished)
            .finish()
    }
}

impl PlayerItemDownloadObserver {
    /// Create an observer and start its dispatcher on the current runtime
    pub fn new(media_id: impl Into<String>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (publish, snapshot) = watch::channel(Snapshot::default());

        tokio::spawn(dispatch(rx, publish));

        Self {
            media_id: Arc::from(media_id.into()),
            events,
            snapshot,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    /// Latest reported progress in `[0, 1]`
    pub fn progress(&self) -> f64 {
        self.snapshot.borrow().progress
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot.borrow().finished
    }

    /// The error the download failed with, once complete
    pub fn error(&self) -> Option<Arc<OfflineError>> {
        self.snapshot.borrow().error.clone()
    }

    /// Receive progress updates. The latest known value is replayed.
    pub fn set_progress_tracker(&self, tracker: SharedProgressTracker) {
        self.send(ObserverEvent::AttachTracker(tracker));
    }

    /// Register a completion callback. If the download already completed it
    /// is invoked right away.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Option<Arc<OfflineError>>) + Send + 'static,
    {
        self.send(ObserverEvent::OnComplete(Box::new(callback)));
    }

    /// Wait until the download completes and every completion callback ran
    pub async fn wait(&self) -> Option<Arc<OfflineError>> {
        let mut snapshot = self.snapshot.clone();
        let result = match snapshot.wait_for(|s| s.finished).await {
            Ok(s) => s.error.clone(),
            Err(_) => Some(Arc::new(OfflineError::internal("observer dispatcher stopped"))),
        };
        result
    }

    /// Tracker that forwards into this observer
    pub(crate) fn relay(&self) -> ProgressRelay {
        ProgressRelay {
            events: self.events.clone(),
        }
    }

    pub(crate) fn complete(&self, error: Option<Arc<OfflineError>>) {
        self.send(ObserverEvent::Complete(error));
    }

    fn send(&self, event: ObserverEvent) {
        // The dispatcher outlives every sender, so this only fails at shutdown
        if self.events.send(event).is_err() {
            log::debug!("Observer for {} is gone", self.media_id);
        }
    }
}

/// Progress sink handed to the operation that drives the observer
pub(crate) struct ProgressRelay {
    events: mpsc::UnboundedSender<ObserverEvent>,
}

impl ProgressTracker for ProgressRelay {
    fn set_progress(&self, progress: f64) {
        let _ = self.events.send(ObserverEvent::Progress(progress));
    }
}

async fn dispatch(mut events: mpsc::UnboundedReceiver<ObserverEvent>, publish: watch::Sender<Snapshot>) {
    let mut tracker: Option<SharedProgressTracker> = None;
    let mut waiting: Vec<CompletionCallback> = Vec::new();
    let mut latest: Option<f64> = None;
    let mut outcome: Option<Option<Arc<OfflineError>>> = None;

    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::Progress(progress) => {
                if outcome.is_some() {
                    continue;
                }
                let progress = progress.clamp(0.0, 1.0);
                latest = Some(progress);
                publish.send_modify(|s| s.progress = progress);
                if let Some(tracker) = tracker.as_ref() {
                    tracker.set_progress(progress);
                }
            }
            ObserverEvent::AttachTracker(new_tracker) => {
                if let Some(progress) = latest {
                    new_tracker.set_progress(progress);
                }
                tracker = Some(new_tracker);
            }
            ObserverEvent::OnComplete(callback) => match outcome.as_ref() {
                Some(error) => callback(error.clone()),
                None => waiting.push(callback),
            },
            ObserverEvent::Complete(error) => {
                if outcome.is_some() {
                    continue;
                }
                for callback in waiting.drain(..) {
                    callback(error.clone());
                }
                publish.send_modify(|s| {
                    s.finished = true;
                    s.error = error.clone();
                });
                outcome = Some(error);
            }
        }
    }
}
