//! Window Pair Factory
//!
//! Each display with content gets a desktop-layer content window and a small
//! transparent sentinel centered on it. The sentinel's visibility tells the manager
//! when the desktop is covered so playback can pause.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::backend::WindowSystem;
use crate::constants::sentinel;
use crate::types::{Display, DisplayId, Rect, WindowHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPair {
    pub content: WindowHandle,
    pub sentinel: WindowHandle,
}

/// Sentinel rectangle for a display frame: higher sensitivity, smaller sentinel
pub fn sentinel_rect(frame: Rect, sensitivity: u8) -> Rect {
    let sensitivity = sensitivity.min(sentinel::MAX_SENSITIVITY) as f64;
    let portion = 1.0 - sensitivity / sentinel::SENSITIVITY_SCALE;

    let width = ((frame.width as f64) * portion).round().max(1.0) as u32;
    let height = ((frame.height as f64) * portion).round().max(1.0) as u32;
    let (cx, cy) = frame.center();

    Rect::new(cx - (width / 2) as i32, cy - (height / 2) as i32, width, height)
}

#[derive(Debug, Default)]
pub struct WindowFactory {
    pairs: HashMap<DisplayId, WindowPair>,
    sentinels: HashMap<WindowHandle, DisplayId>,
}

impl WindowFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DisplayId) -> Option<WindowPair> {
        self.pairs.get(&id).copied()
    }

    #[cfg(test)]
    pub fn contains(&self, id: DisplayId) -> bool {
        self.pairs.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<DisplayId> {
        let mut ids: Vec<DisplayId> = self.pairs.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn display_for_sentinel(&self, sentinel: WindowHandle) -> Option<DisplayId> {
        self.sentinels.get(&sentinel).copied()
    }

    /// Return the display's pair, building and wiring it on first use
    ///
    /// The flag is `true` when the pair was created by this call, so a caller
    /// whose show fails can tear it down again.
    pub fn ensure(
        &mut self,
        ws: &mut dyn WindowSystem,
        display: &Display,
        sensitivity: u8,
    ) -> Result<(WindowPair, bool)> {
        if let Some(pair) = self.get(display.id) {
            return Ok((pair, false));
        }

        let content = ws
            .create_content_window(display)
            .with_context(|| format!("Failed to create content window for display {}", display.id))?;

        let rect = sentinel_rect(display.frame, sensitivity);
        let sentinel = match ws.create_sentinel_window(rect, content) {
            Ok(sentinel) => sentinel,
            Err(e) => {
                destroy_or_log(ws, content);
                return Err(e.context(format!("Failed to create sentinel window for display {}", display.id)));
            }
        };

        if let Err(e) = ws.watch_occlusion(sentinel, display.id) {
            destroy_or_log(ws, sentinel);
            destroy_or_log(ws, content);
            return Err(e.context("Failed to watch sentinel occlusion"));
        }

        let pair = WindowPair { content, sentinel };
        self.pairs.insert(display.id, pair);
        self.sentinels.insert(sentinel, display.id);

        let id = display.id;
        info!(
            display = %id,
            content = content.0,
            sentinel = sentinel.0,
            sentinel_width = rect.width,
            sentinel_height = rect.height,
            "Created window pair"
        );
        Ok((pair, true))
    }

    /// Unwire the sentinel, then destroy both windows
    pub fn teardown(&mut self, ws: &mut dyn WindowSystem, id: DisplayId) -> bool {
        let Some(pair) = self.pairs.remove(&id) else {
            return false;
        };
        self.sentinels.remove(&pair.sentinel);

        if let Err(e) = ws.unwatch_occlusion(pair.sentinel) {
            warn!(display = %id, error = ?e, "Failed to unwatch sentinel");
        }
        destroy_or_log(ws, pair.sentinel);
        destroy_or_log(ws, pair.content);

        debug!(display = %id, "Destroyed window pair");
        true
    }
}

fn destroy_or_log(ws: &mut dyn WindowSystem, window: WindowHandle) {
    if let Err(e) = ws.destroy_window(window) {
        warn!(window = window.0, error = ?e, "Failed to destroy window");
    }
}
