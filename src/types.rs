//! Core value types shared by the manager, the adapters and the IPC layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::constants::media;

/// Stable platform identifier of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a platform window (an X11 window id on Linux)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }
}

/// A connected monitor as reported by the window system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Display {
    pub id: DisplayId,
    pub frame: Rect,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a file by extension; `None` for anything unsupported
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if media::VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else if media::IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else {
            None
        }
    }
}

/// What a display is currently showing; the authoritative record the
/// rendering layer is derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub kind: MediaKind,
    pub location: PathBuf,
    pub stretch: bool,
    /// Only set for video
    pub volume: Option<f32>,
}

impl ContentEntry {
    pub fn image(location: PathBuf, stretch: bool) -> Self {
        Self {
            kind: MediaKind::Image,
            location,
            stretch,
            volume: None,
        }
    }

    pub fn video(location: PathBuf, stretch: bool, volume: f32) -> Self {
        Self {
            kind: MediaKind::Video,
            location,
            stretch,
            volume: Some(volume),
        }
    }
}

/// How a caller names a display: numeric id or connector name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplaySelector {
    Id(DisplayId),
    Name(String),
}

impl FromStr for DisplaySelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u32>() {
            Ok(id) => DisplaySelector::Id(DisplayId(id)),
            Err(_) => DisplaySelector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for DisplaySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplaySelector::Id(id) => write!(f, "{id}"),
            DisplaySelector::Name(name) => f.write_str(name),
        }
    }
}

/// Clamp a user-supplied volume into the player's 0.0..=1.0 range
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("/a/clip.MP4")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("/a/loop.webm")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("photo.jpeg")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("no_extension")), None);
    }

    #[test]
    fn test_display_selector_parse() {
        assert_eq!(
            "42".parse::<DisplaySelector>().unwrap(),
            DisplaySelector::Id(DisplayId(42))
        );
        assert_eq!(
            " DP-1 ".parse::<DisplaySelector>().unwrap(),
            DisplaySelector::Name("DP-1".to_string())
        );
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(1.5), 1.0);
        assert_eq!(clamp_volume(-0.2), 0.0);
        assert_eq!(clamp_volume(f32::NAN), 0.0);
        assert_eq!(clamp_volume(0.8), 0.8);
    }

    #[test]
    fn test_rect_center() {
        let rect = Rect::new(1920, 0, 2560, 1440);
        assert_eq!(rect.center(), (3200, 720));
    }
}
