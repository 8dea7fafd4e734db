//! Bookmark Store
//!
//! Persists, per display, a durable reference to the last shown source plus its
//! stretch and volume. Records older than the horizon are purged on read.
//!
//! A [`Bookmark`] remembers the canonical path together with the file's device
//! and inode, so a file that was renamed in place or whose volume was remounted
//! can still be found after a restart.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::KeyValueStore;
use crate::constants::bookmark::HORIZON_SECS;
use crate::types::DisplayId;

/// Read access to a file for the duration of a scope
///
/// The file stays open until the grant is dropped, so a bookmark taken inside
/// the grant observes the same inode the caller is about to show.
#[derive(Debug)]
pub struct AccessGrant {
    path: PathBuf,
    file: File,
}

impl AccessGrant {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("No read access to {}", path.display()))?;
        debug!(path = %path.display(), "Acquired access grant");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn metadata(&self) -> Result<fs::Metadata> {
        self.file
            .metadata()
            .with_context(|| format!("Failed to stat {}", self.path.display()))
    }
}

impl Drop for AccessGrant {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released access grant");
    }
}

/// Durable reference to a file that survives renames and remounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub path: PathBuf,
    pub dev: u64,
    pub ino: u64,
}

/// Outcome of resolving a [`Bookmark`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub location: PathBuf,
    /// The reference still works but no longer matches the file exactly and
    /// should be recreated
    pub stale: bool,
}

impl Bookmark {
    /// Create a bookmark for the file held open by `grant`
    pub fn create(grant: &AccessGrant) -> Result<Self> {
        let metadata = grant.metadata()?;
        let path = fs::canonicalize(grant.path())
            .with_context(|| format!("Failed to canonicalize {}", grant.path().display()))?;
        Ok(Self {
            path,
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    pub fn resolve(&self) -> Result<Resolved> {
        if let Ok(metadata) = fs::metadata(&self.path) {
            let stale = metadata.ino() != self.ino || metadata.dev() != self.dev;
            return Ok(Resolved {
                location: self.path.clone(),
                stale,
            });
        }

        // Path is gone; look for the same inode beside it (rename in place)
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow!("Bookmark path {} has no parent", self.path.display()))?;
        let entries = fs::read_dir(parent)
            .with_context(|| format!("Bookmarked directory {} is unreachable", parent.display()))?;

        for entry in entries.flatten() {
            if let Ok(metadata) = entry.metadata()
                && metadata.is_file()
                && metadata.ino() == self.ino
                && metadata.dev() == self.dev
            {
                return Ok(Resolved {
                    location: entry.path(),
                    stale: true,
                });
            }
        }

        bail!("Bookmarked file {} no longer exists", self.path.display())
    }
}

/// A persisted per-display record
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkRecord {
    pub display: DisplayId,
    pub bookmark: Bookmark,
    pub stretch: bool,
    pub volume: Option<f32>,
    pub saved_at: i64,
}

fn bookmark_key(id: DisplayId) -> String {
    format!("bookmark-{id}")
}

fn stretch_key(id: DisplayId) -> String {
    format!("stretch-{id}")
}

fn volume_key(id: DisplayId) -> String {
    format!("volume-{id}")
}

fn saved_at_key(id: DisplayId) -> String {
    format!("savedAt-{id}")
}

pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Bookmark records on top of the persistent key-value store
///
/// Also hands out the underlying store so global settings can share it.
pub struct BookmarkStore {
    store: Box<dyn KeyValueStore>,
}

impl BookmarkStore {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store_mut(&mut self) -> &mut dyn KeyValueStore {
        self.store.as_mut()
    }

    /// Persist a fresh record for `location`
    ///
    /// The bookmark is taken inside an access grant that is released on every
    /// exit path.
    pub fn save(
        &mut self,
        id: DisplayId,
        location: &Path,
        stretch: bool,
        volume: Option<f32>,
        now: i64,
    ) -> Result<()> {
        let bookmark = {
            let grant = AccessGrant::acquire(location)?;
            Bookmark::create(&grant)?
        };

        let value = serde_json::to_value(&bookmark).context("Failed to serialize bookmark")?;
        self.store.set(&bookmark_key(id), value);
        self.store.set(&stretch_key(id), json!(stretch));
        match volume {
            Some(volume) => self.store.set(&volume_key(id), json!(volume)),
            None => self.store.remove(&volume_key(id)),
        }
        self.store.set(&saved_at_key(id), json!(now));

        debug!(display = %id, path = %bookmark.path.display(), "Saved bookmark");
        Ok(())
    }

    pub fn load(&mut self, id: DisplayId) -> Option<BookmarkRecord> {
        self.load_at(id, now_epoch_secs())
    }

    /// Load a record, deleting it instead when it is expired or malformed
    pub fn load_at(&mut self, id: DisplayId, now: i64) -> Option<BookmarkRecord> {
        let raw = self.store.get(&bookmark_key(id))?;

        let Some(saved_at) = self.store.get_i64(&saved_at_key(id)) else {
            info!(display = %id, "Bookmark has no timestamp, purging");
            self.delete(id);
            return None;
        };

        if now - saved_at > HORIZON_SECS {
            info!(display = %id, age_secs = now - saved_at, "Bookmark expired, purging");
            self.delete(id);
            return None;
        }

        let bookmark = match serde_json::from_value::<Bookmark>(raw) {
            Ok(bookmark) => bookmark,
            Err(e) => {
                warn!(display = %id, error = %e, "Malformed bookmark, purging");
                self.delete(id);
                return None;
            }
        };

        Some(BookmarkRecord {
            display: id,
            bookmark,
            stretch: self.store.get_bool(&stretch_key(id)).unwrap_or(false),
            volume: self.store.get_f64(&volume_key(id)).map(|v| v as f32),
            saved_at,
        })
    }

    pub fn contains(&self, id: DisplayId) -> bool {
        self.store.get(&bookmark_key(id)).is_some()
    }

    pub fn delete(&mut self, id: DisplayId) {
        self.store.remove(&bookmark_key(id));
        self.store.remove(&stretch_key(id));
        self.store.remove(&volume_key(id));
        self.store.remove(&saved_at_key(id));
    }

    /// Delete the record only if it is past the horizon; returns whether it was purged
    pub fn purge_if_expired(&mut self, id: DisplayId, now: i64) -> bool {
        if !self.contains(id) {
            return false;
        }
        match self.store.get_i64(&saved_at_key(id)) {
            Some(saved_at) if now - saved_at <= HORIZON_SECS => false,
            _ => {
                info!(display = %id, "Purging expired bookmark of disconnected display");
                self.delete(id);
                true
            }
        }
    }

    /// Rewrite stretch and volume of an existing record without touching its reference
    pub fn update_settings(&mut self, id: DisplayId, stretch: bool, volume: Option<f32>) {
        if !self.contains(id) {
            return;
        }
        self.store.set(&stretch_key(id), json!(stretch));
        if let Some(volume) = volume {
            self.store.set(&volume_key(id), json!(volume));
        }
    }
}
