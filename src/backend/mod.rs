//! Platform boundary
//!
//! The manager only talks to the window system and the media framework
//! through these traits:
//! - **x11**: RandR monitors, desktop-layer windows, visibility-based occlusion
//! - **mpv**: embedded mpv processes driven over their JSON IPC socket
//! - **fake**: in-memory implementations for tests

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::types::{Display, DisplayId, Rect, WindowHandle};

pub mod mpv;
pub mod x11;

#[cfg(test)]
pub mod fake;

/// Something the window system reports to the control thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Monitors were added, removed or reconfigured
    TopologyChanged,
    /// A sentinel window became fully covered (`true`) or visible again
    Occlusion { sentinel: WindowHandle, covered: bool },
}

pub trait WindowSystem {
    /// Currently connected displays
    fn displays(&mut self) -> Result<Vec<Display>>;

    /// Borderless window covering `display` at the lowest desktop layer
    fn create_content_window(&mut self, display: &Display) -> Result<WindowHandle>;

    /// Transparent window of `rect` stacked directly above `above`
    fn create_sentinel_window(&mut self, rect: Rect, above: WindowHandle) -> Result<WindowHandle>;

    /// Start delivering [`PlatformEvent::Occlusion`] for `sentinel`
    fn watch_occlusion(&mut self, sentinel: WindowHandle, display: DisplayId) -> Result<()>;

    fn unwatch_occlusion(&mut self, sentinel: WindowHandle) -> Result<()>;

    fn destroy_window(&mut self, window: WindowHandle) -> Result<()>;
}

/// Identifies one view attached to a [`Player`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u32);

/// A looping video player that may render into several windows at once
pub trait Player {
    fn attach(&mut self, window: WindowHandle, stretch: bool) -> Result<ViewId>;
    fn detach(&mut self, view: ViewId) -> Result<()>;
    fn view_count(&self) -> usize;

    fn set_stretch(&mut self, view: ViewId, stretch: bool) -> Result<()>;
    fn set_volume(&mut self, volume: f32) -> Result<()>;
    fn volume(&self) -> f32;

    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn is_playing(&self) -> bool;

    fn position(&mut self) -> Option<Duration>;
    fn seek(&mut self, position: Duration) -> Result<()>;

    /// Stop playback and release every view
    fn stop(&mut self);
}

/// A static image installed as a window's content
pub trait ImageView {
    fn set_stretch(&mut self, stretch: bool) -> Result<()>;
    fn close(&mut self);
}

pub trait MediaBackend {
    /// Decode `path` and show it in `window`; fails on undecodable images
    fn load_image(&mut self, path: &Path, window: WindowHandle, stretch: bool)
    -> Result<Box<dyn ImageView>>;

    /// Open a looping player on `path`; views are attached separately
    fn open_player(&mut self, path: &Path, volume: f32) -> Result<Box<dyn Player>>;
}
