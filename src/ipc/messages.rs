//! IPC message types for client ↔ daemon communication

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::SettingsUpdate;
use crate::manager::DisplayStatus;
use crate::types::{DisplayId, DisplaySelector};

/// Requests sent from a client to the daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WallpaperRequest {
    /// Show an image or video; the kind is picked from the extension
    Show {
        display: DisplaySelector,
        path: PathBuf,
        stretch: bool,
        volume: Option<f32>,
    },

    /// Remove content from a display and forget its bookmark
    Clear(DisplaySelector),

    SetStretch {
        display: DisplaySelector,
        stretch: bool,
    },

    /// Change a video's volume; `debounce` coalesces rapid slider input
    SetVolume {
        display: DisplaySelector,
        volume: f32,
        debounce: bool,
    },

    /// Copy the source display's content onto the destination
    Sync {
        source: DisplaySelector,
        destination: DisplaySelector,
    },

    /// Copy the source display's content onto every other display
    SyncAll(DisplaySelector),

    MuteAll,
    RestoreAll,

    /// Rebuild a display's session from its content entry
    RestoreContent(DisplaySelector),

    /// Rebuild every connected display from the bookmark store
    RestoreBookmarks,

    /// System is about to sleep
    Sleep,

    /// System woke up
    Wake,

    /// Change global settings; omitted fields are kept
    SetSettings(SettingsUpdate),

    /// Query per-display state
    Status,

    /// Keep this connection open and receive `ContentChanged` pushes
    Subscribe,

    /// Health check
    Ping,

    /// Request graceful shutdown
    Shutdown,
}

/// Responses sent from the daemon to a client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WallpaperResponse {
    /// Request processed; `changed` is false when nothing was done
    Done {
        changed: bool,
        warnings: Vec<String>,
    },

    /// Per-display state (response to Status)
    Status(Vec<DisplayStatus>),

    /// Health check response
    Pong,

    /// Subscription accepted; `ContentChanged` pushes follow
    Subscribed,

    /// A display's content entry changed (pushed to subscribers)
    ContentChanged { display: DisplayId },

    /// Something the user should know about (pushed to subscribers)
    Warning(String),

    /// Error occurred
    Error(String),
}

impl WallpaperResponse {
    pub fn done(changed: bool) -> Self {
        WallpaperResponse::Done {
            changed,
            warnings: Vec::new(),
        }
    }
}
