//! Global settings
//!
//! A typed, validated snapshot of the global keys in the persistent store.
//! The manager keeps one copy and writes it back whenever it changes.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use super::store::KeyValueStore;
use crate::constants::sentinel;

pub const KEY_AUTO_SYNC: &str = "autoSyncNewScreens";
pub const KEY_SENSITIVITY: &str = "idlePauseSensitivity";
pub const KEY_MEMORY_CACHE: &str = "useMemoryCache";
pub const KEY_MAX_VIDEO_GB: &str = "maxVideoFileSizeGB";
pub const KEY_GLOBAL_MUTE: &str = "globalMute";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Clone an existing display's content onto newly connected displays
    pub auto_sync_new_screens: bool,
    /// 0-100; higher means a smaller occlusion sentinel
    pub idle_pause_sensitivity: u8,
    /// Play videos from an in-memory copy instead of streaming from disk
    pub use_memory_cache: bool,
    /// Videos larger than this always stream from disk
    pub max_video_file_size_gb: f64,
    pub global_mute: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_sync_new_screens: false,
            idle_pause_sensitivity: sentinel::DEFAULT_SENSITIVITY,
            use_memory_cache: true,
            max_video_file_size_gb: 1.0,
            global_mute: false,
        }
    }
}

/// Partial update received over IPC; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub auto_sync_new_screens: Option<bool>,
    pub idle_pause_sensitivity: Option<u8>,
    pub use_memory_cache: Option<bool>,
    pub max_video_file_size_gb: Option<f64>,
    pub global_mute: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Settings {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let defaults = Self::default();
        let sensitivity = store
            .get_f64(KEY_SENSITIVITY)
            .map(|v| v.round().clamp(0.0, u8::MAX as f64) as u8)
            .unwrap_or(defaults.idle_pause_sensitivity);

        let mut settings = Self {
            auto_sync_new_screens: store
                .get_bool(KEY_AUTO_SYNC)
                .unwrap_or(defaults.auto_sync_new_screens),
            idle_pause_sensitivity: sensitivity,
            use_memory_cache: store
                .get_bool(KEY_MEMORY_CACHE)
                .unwrap_or(defaults.use_memory_cache),
            max_video_file_size_gb: store
                .get_f64(KEY_MAX_VIDEO_GB)
                .unwrap_or(defaults.max_video_file_size_gb),
            global_mute: store.get_bool(KEY_GLOBAL_MUTE).unwrap_or(defaults.global_mute),
        };
        settings.validate_and_clamp();
        settings
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) {
        store.set(KEY_AUTO_SYNC, json!(self.auto_sync_new_screens));
        store.set(KEY_SENSITIVITY, json!(self.idle_pause_sensitivity));
        store.set(KEY_MEMORY_CACHE, json!(self.use_memory_cache));
        store.set(KEY_MAX_VIDEO_GB, json!(self.max_video_file_size_gb));
        store.set(KEY_GLOBAL_MUTE, json!(self.global_mute));
    }

    pub fn apply(&mut self, update: &SettingsUpdate) {
        if let Some(v) = update.auto_sync_new_screens {
            self.auto_sync_new_screens = v;
        }
        if let Some(v) = update.idle_pause_sensitivity {
            self.idle_pause_sensitivity = v;
        }
        if let Some(v) = update.use_memory_cache {
            self.use_memory_cache = v;
        }
        if let Some(v) = update.max_video_file_size_gb {
            self.max_video_file_size_gb = v;
        }
        if let Some(v) = update.global_mute {
            self.global_mute = v;
        }
        self.validate_and_clamp();
    }

    /// Clamp values read from disk or IPC into their valid ranges
    fn validate_and_clamp(&mut self) {
        if self.idle_pause_sensitivity > sentinel::MAX_SENSITIVITY {
            warn!(
                sensitivity = self.idle_pause_sensitivity,
                max = sentinel::MAX_SENSITIVITY,
                "idlePauseSensitivity exceeds maximum, clamping"
            );
            self.idle_pause_sensitivity = sentinel::MAX_SENSITIVITY;
        }

        if !self.max_video_file_size_gb.is_finite() || self.max_video_file_size_gb <= 0.0 {
            let fallback = Self::default().max_video_file_size_gb;
            warn!(
                value = self.max_video_file_size_gb,
                using = fallback,
                "maxVideoFileSizeGB must be positive, using default"
            );
            self.max_video_file_size_gb = fallback;
        }
    }

    pub fn max_video_bytes(&self) -> u64 {
        (self.max_video_file_size_gb * crate::constants::media::BYTES_PER_GB) as u64
    }
}
