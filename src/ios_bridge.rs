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


//! C bridge for the iOS host app
//!
//! Every function takes C strings and returns a heap-allocated JSON string:
//!
//! ```json
//! { "success": true, "data": { ... } }
//! { "success": false, "error": "..." }
//! ```
//!
//! Returned strings MUST be released with [`offline_free_string`]. Panics are
//! caught here and reported as error responses; they never unwind into the
//! host.
//!
//! Async work runs on one process-wide tokio runtime. The manager is created
//! once by [`offline_manager_init`] and shared by all later calls.

use crate::config::DownloadConfig;
use crate::download::manager::PlayerItemDownloadManager;
use crate::error::{OfflineError, Result};
use crate::media::item::PlayableItem;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::Serialize;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::panic;
use std::sync::Arc;
use tokio::runtime::Runtime;

lazy_static! {
    /// Runtime for all async work started from the host. `None` if it could
    /// not be built.
    static ref RUNTIME: Option<Runtime> = match Runtime::new() {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            log::error!("Failed to create tokio runtime: {}", e);
            None
        }
    };

    static ref MANAGER: RwLock<Option<Arc<PlayerItemDownloadManager>>> = RwLock::new(None);
}

/// Progress callback: `(context, progress in [0, 1])`
pub type ProgressCallback = extern "C" fn(*mut c_void, f64);

/// Completion callback: `(context, JSON envelope)`. The string is only valid
/// for the duration of the call.
pub type CompletionCallback = extern "C" fn(*mut c_void, *const c_char);

/// Opaque host pointer handed back on every callback
#[derive(Clone, Copy)]
struct HostContext(*mut c_void);

// The host guarantees the context stays valid and may be used from any
// thread until the completion callback ran.
unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

impl HostContext {
    fn get(self) -> *mut c_void {
        self.0
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .as_ref()
        .ok_or_else(|| OfflineError::internal("tokio runtime is unavailable"))
}

fn manager() -> Result<Arc<PlayerItemDownloadManager>> {
    MANAGER.read().clone().ok_or_else(|| {
        OfflineError::ConfigurationError(
            "offline_manager_init must be called first".to_string(),
        )
    })
}

/// Convert a C string pointer to a Rust String
///
/// # Safety
/// Caller must ensure ptr is a valid null-terminated C string
fn c_str_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(OfflineError::invalid_input("Null pointer received"));
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| OfflineError::invalid_input(format!("Invalid UTF-8: {}", e)))
    }
}

/// Convert a Rust string to a C string pointer
///
/// # Safety
/// Caller MUST free the returned pointer using `offline_free_string()`
fn string_to_c_str(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => CString::new(error_response("String contains null bytes"))
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut()),
    }
}

/// Convert a result to a JSON response string
fn result_to_json<T: Serialize>(result: Result<T>) -> String {
    match result {
        Ok(data) => success_response(data),
        Err(e) => error_response(&e.to_string()),
    }
}

fn success_response<T: Serialize>(data: T) -> String {
    serde_json::json!({
        "success": true,
        "data": data
    })
    .to_string()
}

fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Run `f`, turning a panic into an error response
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> Result<String> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => error_response(&e.to_string()),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Create the download manager
///
/// # Arguments
/// * `config_json` - `DownloadConfig` as JSON; only `storage_root` is required
///
/// # Returns
/// ```json
/// { "success": true, "data": { "storage_root": "..." } }
/// ```
///
/// Calling it again replaces the manager and cancels the downloads of the
/// previous one.
#[no_mangle]
pub extern "C" fn offline_manager_init(config_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let config: DownloadConfig = serde_json::from_str(&c_str_to_string(config_json)?)?;
        let runtime = runtime()?;

        let _guard = runtime.enter();
        let manager = PlayerItemDownloadManager::new(config)?;
        let root = manager.storage().root().to_path_buf();

        *MANAGER.write() = Some(Arc::new(manager));
        log::info!("Offline manager ready at {}", root.display());

        Ok(success_response(serde_json::json!({ "storage_root": root })))
    });

    string_to_c_str(response)
}

// ============================================================================
// DOWNLOADS
// ============================================================================

/// Start downloading an item
///
/// # Arguments
/// * `item_json` - `PlayableItem` as JSON
/// * `progress_cb` - optional, receives item progress
/// * `complete_cb` - optional, receives the outcome as a JSON envelope
/// * `context` - passed back unchanged to both callbacks
///
/// # Returns
/// ```json
/// { "success": true, "data": { "media_id": "abc123", "started": true } }
/// ```
///
/// `started` is false (and no callback is invoked) when the item is already
/// downloaded or downloading.
///
/// # Safety
/// `context` must stay valid until `complete_cb` was invoked.
#[no_mangle]
pub extern "C" fn offline_download(
    item_json: *const c_char,
    progress_cb: Option<ProgressCallback>,
    complete_cb: Option<CompletionCallback>,
    context: *mut c_void,
) -> *mut c_char {
    let context = HostContext(context);

    let response = catch_panic(panic::AssertUnwindSafe(|| {
        let item = PlayableItem::from_json(&c_str_to_string(item_json)?)?;
        let media_id = item
            .id()
            .map(str::to_string)
            .ok_or_else(|| OfflineError::invalid_input("Item has no media id"))?;
        let manager = manager()?;

        let Some(observer) = runtime()?.block_on(manager.download(&item)) else {
            return Ok(success_response(serde_json::json!({
                "media_id": media_id,
                "started": false,
            })));
        };

        if let Some(callback) = progress_cb {
            observer.set_progress_tracker(Arc::new(move |progress: f64| {
                callback(context.get(), progress)
            }));
        }
        if let Some(callback) = complete_cb {
            let id = media_id.clone();
            observer.on_complete(move |error| {
                let envelope = match error {
                    None => success_response(serde_json::json!({ "media_id": id })),
                    Some(e) => error_response(&e.to_string()),
                };
                match CString::new(envelope) {
                    Ok(envelope) => callback(context.get(), envelope.as_ptr()),
                    Err(e) => log::error!("Cannot report completion of {}: {}", id, e),
                }
            });
        }

        Ok(success_response(serde_json::json!({
            "media_id": media_id,
            "started": true,
        })))
    }));

    string_to_c_str(response)
}

/// Cancel an in-flight download
///
/// The completion callback of that download reports the cancellation.
#[no_mangle]
pub extern "C" fn offline_cancel(media_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let media_id = c_str_to_string(media_id)?;
        let manager = manager()?;
        let result = runtime()?
            .block_on(manager.cancel(&media_id))
            .map(|_| serde_json::json!({ "media_id": media_id, "cancelled": true }));
        Ok(result_to_json(result))
    });

    string_to_c_str(response)
}

// ============================================================================
// STORED ITEMS
// ============================================================================

/// Delete a downloaded item. Fails unless the item is `local`.
#[no_mangle]
pub extern "C" fn offline_remove(media_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let media_id = c_str_to_string(media_id)?;
        let manager = manager()?;
        let result = runtime()?
            .block_on(manager.remove(&media_id))
            .map(|_| serde_json::json!({ "media_id": media_id, "removed": true }));
        Ok(result_to_json(result))
    });

    string_to_c_str(response)
}

/// Lifecycle state of an item
///
/// # Returns
/// ```json
/// { "success": true, "data": { "media_id": "abc123", "state": "local" } }
/// ```
#[no_mangle]
pub extern "C" fn offline_item_state(media_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let media_id = c_str_to_string(media_id)?;
        let manager = manager()?;
        let state = runtime()?.block_on(manager.state(&media_id));
        Ok(success_response(serde_json::json!({
            "media_id": media_id,
            "state": state,
        })))
    });

    string_to_c_str(response)
}

/// The downloaded item with local file references, `data: null` if the item
/// is not stored
#[no_mangle]
pub extern "C" fn offline_downloaded_item(media_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let media_id = c_str_to_string(media_id)?;
        let manager = manager()?;
        let item = runtime()?.block_on(manager.downloaded_item(&media_id));
        Ok(success_response(item))
    });

    string_to_c_str(response)
}

/// Media ids of every downloaded item
#[no_mangle]
pub extern "C" fn offline_downloaded_ids() -> *mut c_char {
    let response = catch_panic(|| {
        let manager = manager()?;
        let ids = runtime()?.block_on(manager.downloaded_ids());
        Ok(success_response(ids))
    });

    string_to_c_str(response)
}

// ============================================================================
// MEMORY MANAGEMENT
// ============================================================================

/// Free a string returned by any function in this module
///
/// # Safety
/// `ptr` must come from this module and must not be used afterwards.
/// Null is accepted.
#[no_mangle]
pub extern "C" fn offline_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            drop(CString::from_raw(ptr));
        }
    }
}
