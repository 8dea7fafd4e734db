//! Content Cache and scratch files
//!
//! Video bytes are kept in memory keyed by source location. Eviction is by
//! scan: a location is only dropped once no content entry refers to it.
//! The media player can only open content by path, so cached bytes are written
//! to private per-display scratch files before playback.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::paths;
use crate::types::DisplayId;

pub type Bytes = Arc<[u8]>;

#[derive(Debug, Default)]
pub struct ContentCache {
    entries: HashMap<PathBuf, Bytes>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, location: &Path) -> Option<Bytes> {
        self.entries.get(location).cloned()
    }

    pub fn insert(&mut self, location: PathBuf, bytes: Bytes) {
        debug!(path = %location.display(), size = bytes.len(), "Caching video bytes");
        self.entries.insert(location, bytes);
    }

    #[cfg(test)]
    pub fn contains(&self, location: &Path) -> bool {
        self.entries.contains_key(location)
    }

    /// Evict `location` unless one of `in_use` still refers to it
    pub fn release<'a>(
        &mut self,
        location: &Path,
        mut in_use: impl Iterator<Item = &'a Path>,
    ) -> bool {
        if in_use.any(|used| used == location) {
            debug!(path = %location.display(), "Cached bytes still referenced, keeping");
            return false;
        }
        let evicted = self.entries.remove(location).is_some();
        if evicted {
            debug!(path = %location.display(), "Evicted cached bytes");
        }
        evicted
    }
}

/// Read a whole source file; runs off the control thread in the daemon
pub fn read_source(location: &Path) -> Result<Bytes> {
    let bytes = fs::read(location)
        .with_context(|| format!("Failed to read {}", location.display()))?;
    Ok(Bytes::from(bytes))
}

/// Write `bytes` to a scratch path, creating its directory on first use
pub fn write_scratch(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create scratch dir {}", dir.display()))?;
    }
    fs::write(path, bytes)
        .with_context(|| format!("Failed to write scratch file {}", path.display()))?;
    debug!(path = %path.display(), size = bytes.len(), "Wrote scratch file");
    Ok(())
}

pub fn file_size(location: &Path) -> Result<u64> {
    let metadata = fs::metadata(location)
        .with_context(|| format!("Failed to stat {}", location.display()))?;
    Ok(metadata.len())
}

/// Directory of `cached-<displayId>-<uuid>.<ext>` files
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> PathBuf {
        std::env::temp_dir()
            .join(paths::APP_DIR)
            .join(paths::SCRATCH_DIR)
    }

    fn display_prefix(display: DisplayId) -> String {
        format!("{}-{}-", paths::SCRATCH_PREFIX, display)
    }

    /// Name for a new scratch file of `display`; nothing is created yet
    pub fn fresh_path(&self, display: DisplayId, extension: &str) -> PathBuf {
        self.root.join(format!(
            "{}{}.{}",
            Self::display_prefix(display),
            Uuid::new_v4(),
            extension
        ))
    }

    /// Scratch files currently on disk for `display`
    pub fn files_for(&self, display: DisplayId) -> Vec<PathBuf> {
        self.matching(&Self::display_prefix(display))
    }

    /// Delete every scratch file of `display`; returns how many were removed
    #[cfg(test)]
    pub fn purge(&self, display: DisplayId) -> usize {
        self.remove_all(self.files_for(display))
    }

    /// Delete the display's scratch files except those in `in_use`
    pub fn purge_unused(&self, display: DisplayId, in_use: &HashSet<PathBuf>) -> usize {
        let files = self
            .files_for(display)
            .into_iter()
            .filter(|path| !in_use.contains(path))
            .collect();
        self.remove_all(files)
    }

    /// Delete every scratch file regardless of display
    pub fn purge_all(&self) -> usize {
        let removed = self.remove_all(self.matching(&format!("{}-", paths::SCRATCH_PREFIX)));
        if removed > 0 {
            info!(count = removed, dir = %self.root.display(), "Removed leftover scratch files");
        }
        removed
    }

    fn matching(&self, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .map(|entry| entry.path())
            .collect()
    }

    fn remove_all(&self, files: Vec<PathBuf>) -> usize {
        let mut removed = 0;
        for path in files {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
            }
        }
        removed
    }
}
