//! Wallpaper Manager
//!
//! Owns the per-display mapping from a display to its window pair, content
//! entry and playback session, and keeps the three in step. Every operation
//! runs on the control thread and either completes or leaves the previous
//! state in place; failures are logged and reported as "nothing changed".
//!
//! - **mod.rs**: show, update and clear
//! - **sync.rs**: cloning content between displays, mute and restore
//! - **events.rs**: hot-plug, sleep/wake, occlusion and timers
//! - **loading.rs**: source reads and scratch writes off the control thread

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::{MediaBackend, WindowSystem};
use crate::bookmark::{now_epoch_secs, BookmarkStore};
use crate::cache::{self, Bytes, ContentCache, ScratchDir};
use crate::config::{KeyValueStore, Settings, SettingsUpdate};
use crate::constants::media::BYTES_PER_GB;
use crate::observers::{ContentChanged, ContentObservers, SubscriptionId};
use crate::playback::{self, PlaybackSession, SharedPlayer};
use crate::registry::DisplayRegistry;
use crate::types::{clamp_volume, ContentEntry, Display, DisplayId, DisplaySelector, MediaKind, Rect};
use crate::window::{WindowFactory, WindowPair};

mod events;
mod loading;
mod sync;

pub use loading::{LoadId, ShowTicket, VideoLoad};
use loading::Loads;
use sync::Alignment;

#[cfg(test)]
pub(crate) mod test_support;

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The video exceeded the memory-cache ceiling and streams from disk
    OversizedVideo {
        path: PathBuf,
        size_gb: f64,
        limit_gb: f64,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::OversizedVideo {
                path,
                size_gb,
                limit_gb,
            } => write!(
                f,
                "{} is {:.2} GB, larger than the {:.2} GB cache limit; playing directly from disk",
                path.display(),
                size_gb,
                limit_gb
            ),
        }
    }
}

/// Snapshot of one connected display for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayStatus {
    pub id: DisplayId,
    pub name: String,
    pub frame: Rect,
    pub entry: Option<ContentEntry>,
    pub playing: bool,
    pub position_secs: Option<f64>,
    pub player_volume: Option<f32>,
    /// Renders a player shared with another display
    pub shared: bool,
    /// Plays from an in-memory copy (scratch file) rather than the source
    pub memory_backed: bool,
    pub occluded: bool,
}

pub struct WallpaperManager<W: WindowSystem, M: MediaBackend> {
    ws: W,
    media: M,
    registry: DisplayRegistry,
    windows: WindowFactory,
    entries: BTreeMap<DisplayId, ContentEntry>,
    sessions: HashMap<DisplayId, PlaybackSession>,
    cache: ContentCache,
    scratch: ScratchDir,
    bookmarks: BookmarkStore,
    settings: Settings,
    /// Pre-mute volumes, filled by mute-all and consumed by restore-all
    saved_volumes: BTreeMap<DisplayId, f32>,
    occluded: HashSet<DisplayId>,
    asleep: bool,
    pending_volume: HashMap<DisplayId, f32>,
    /// Displays that appeared outside a reconciliation pass
    unreconciled: BTreeSet<DisplayId>,
    observers: ContentObservers,
    notices: Vec<Notice>,
    loads: Loads,
}

impl<W: WindowSystem, M: MediaBackend> WallpaperManager<W, M> {
    pub fn new(ws: W, media: M, store: Box<dyn KeyValueStore>, scratch: ScratchDir) -> Self {
        let settings = Settings::load(store.as_ref());
        info!(
            auto_sync = settings.auto_sync_new_screens,
            sensitivity = settings.idle_pause_sensitivity,
            memory_cache = settings.use_memory_cache,
            max_video_gb = settings.max_video_file_size_gb,
            global_mute = settings.global_mute,
            "Loaded settings"
        );
        Self {
            ws,
            media,
            registry: DisplayRegistry::new(),
            windows: WindowFactory::new(),
            entries: BTreeMap::new(),
            sessions: HashMap::new(),
            cache: ContentCache::new(),
            scratch,
            bookmarks: BookmarkStore::new(store),
            settings,
            saved_volumes: BTreeMap::new(),
            occluded: HashSet::new(),
            asleep: false,
            pending_volume: HashMap::new(),
            unreconciled: BTreeSet::new(),
            observers: ContentObservers::new(),
            notices: Vec::new(),
            loads: Loads::default(),
        }
    }

    /// Sweep leftovers of a previous run, learn the displays and restore bookmarks
    pub fn start(&mut self) -> usize {
        self.scratch.purge_all();
        self.refresh_displays();
        self.unreconciled.clear();
        let restored = self.restore_from_bookmark();
        info!(
            displays = self.registry.len(),
            restored, "Wallpaper manager started"
        );
        restored
    }

    // ---- accessors ----

    #[cfg(test)]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn entry(&self, id: DisplayId) -> Option<&ContentEntry> {
        self.entries.get(&id)
    }

    #[cfg(test)]
    pub fn window_pair(&self, id: DisplayId) -> Option<WindowPair> {
        self.windows.get(id)
    }

    #[cfg(test)]
    pub fn has_session(&self, id: DisplayId) -> bool {
        self.sessions.contains_key(&id)
    }

    #[cfg(test)]
    pub fn is_playing(&self, id: DisplayId) -> bool {
        self.sessions.get(&id).is_some_and(PlaybackSession::is_playing)
    }

    #[cfg(test)]
    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.registry.ids()
    }

    pub fn resolve(&self, selector: &DisplaySelector) -> Option<DisplayId> {
        self.registry.find(selector)
    }

    #[cfg(test)]
    pub fn is_cached(&self, location: &Path) -> bool {
        self.cache.contains(location)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn subscribe(&mut self, callback: impl FnMut(ContentChanged) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn status(&self) -> Vec<DisplayStatus> {
        self.registry
            .displays()
            .map(|display| {
                let session = self.sessions.get(&display.id);
                DisplayStatus {
                    id: display.id,
                    name: display.name.clone(),
                    frame: display.frame,
                    entry: self.entries.get(&display.id).cloned(),
                    playing: session.is_some_and(PlaybackSession::is_playing),
                    position_secs: session
                        .and_then(PlaybackSession::position)
                        .map(|p| p.as_secs_f64()),
                    player_volume: session.and_then(PlaybackSession::volume),
                    shared: session.is_some_and(PlaybackSession::is_shared),
                    memory_backed: session.is_some_and(|s| s.scratch().is_some()),
                    occluded: self.occluded.contains(&display.id),
                }
            })
            .collect()
    }

    pub fn apply_settings(&mut self, update: &SettingsUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        match update.global_mute {
            Some(true) if !self.settings.global_mute => {
                self.mute_all();
            }
            Some(false) if self.settings.global_mute => {
                self.restore_all();
            }
            _ => {}
        }
        let update = SettingsUpdate {
            global_mute: None,
            ..update.clone()
        };
        self.settings.apply(&update);
        self.persist_settings();
        info!(settings = ?self.settings, "Settings updated");
        true
    }

    // ---- show ----

    /// Show any supported media, picking image or video by extension
    pub fn show(&mut self, id: DisplayId, location: &Path, stretch: bool, volume: Option<f32>) -> bool {
        match MediaKind::from_path(location) {
            Some(MediaKind::Image) => self.show_image(id, location, stretch),
            Some(MediaKind::Video) => {
                let volume = volume
                    .or_else(|| self.entries.get(&id).and_then(|e| e.volume))
                    .unwrap_or(crate::constants::bookmark::DEFAULT_VOLUME);
                self.show_video(id, location, stretch, volume)
            }
            None => {
                warn!(display = %id, path = %location.display(), "Unsupported media type");
                false
            }
        }
    }

    pub fn show_image(&mut self, id: DisplayId, location: &Path, stretch: bool) -> bool {
        let Some(display) = self.present(id) else {
            return false;
        };
        if MediaKind::from_path(location) != Some(MediaKind::Image) {
            warn!(display = %id, path = %location.display(), "Not a supported image type");
            return false;
        }

        let Some((pair, created)) = self.ensure_pair(&display) else {
            return false;
        };
        let view = match self.media.load_image(location, pair.content, stretch) {
            Ok(view) => view,
            Err(e) => {
                warn!(display = %id, path = %location.display(), error = ?e, "Failed to load image");
                self.rollback_pair(id, created);
                return false;
            }
        };

        info!(display = %id, path = %location.display(), stretch, "Showing image");
        self.install(
            id,
            PlaybackSession::image(view),
            ContentEntry::image(location.to_path_buf(), stretch),
        );
        true
    }

    pub fn show_video(&mut self, id: DisplayId, location: &Path, stretch: bool, volume: f32) -> bool {
        self.show_video_aligned(id, location, stretch, volume, None)
    }

    /// [`Self::show_video`], bringing the new player to `align` once it is ready
    fn show_video_aligned(
        &mut self,
        id: DisplayId,
        location: &Path,
        stretch: bool,
        volume: f32,
        align: Option<Alignment>,
    ) -> bool {
        let Some(display) = self.present(id) else {
            return false;
        };
        if MediaKind::from_path(location) != Some(MediaKind::Video) {
            warn!(display = %id, path = %location.display(), "Not a supported video type");
            return false;
        }
        let volume = clamp_volume(volume);

        let size = match cache::file_size(location) {
            Ok(size) => size,
            Err(e) => {
                warn!(display = %id, error = ?e, "Cannot read video");
                return false;
            }
        };

        let limit = self.settings.max_video_bytes();
        let streaming = if size > limit {
            let notice = Notice::OversizedVideo {
                path: location.to_path_buf(),
                size_gb: size as f64 / BYTES_PER_GB,
                limit_gb: self.settings.max_video_file_size_gb,
            };
            warn!(display = %id, size, limit, "{notice}");
            self.notices.push(notice);
            true
        } else {
            !self.settings.use_memory_cache
        };
        if streaming {
            let shown = self.show_video_streaming(&display, location, stretch, volume);
            if shown && let Some(align) = align {
                self.align_playback(id, align);
            }
            return shown;
        }

        if let Some(shown) = self.share_existing(&display, location, stretch, volume, align) {
            return shown;
        }
        let cached = self.cache.get(location);
        self.begin_load(id, location, cached, stretch, volume, align)
    }

    /// Play `bytes` (the contents of `original`) through a private scratch
    /// file, or join another display's player already showing `original`
    ///
    /// The scratch file is written by a [`VideoLoad`], so with deferred loads
    /// the display changes only once [`Self::complete_load`] runs.
    pub fn show_video_from_memory(
        &mut self,
        id: DisplayId,
        bytes: Bytes,
        stretch: bool,
        volume: f32,
        original: &Path,
    ) -> bool {
        let Some(display) = self.present(id) else {
            return false;
        };
        let volume = clamp_volume(volume);

        if let Some(shown) = self.share_existing(&display, original, stretch, volume, None) {
            return shown;
        }
        self.begin_load(id, original, Some(bytes), stretch, volume, None)
    }

    /// Join another display's player for `location`; `None` when there is none
    fn share_existing(
        &mut self,
        display: &Display,
        location: &Path,
        stretch: bool,
        volume: f32,
        align: Option<Alignment>,
    ) -> Option<bool> {
        let (source, player, scratch) = self.find_shared_player(display.id, location)?;
        let shown = self.join_player(display, source, player, scratch, stretch, volume, location);
        if shown && let Some(align) = align {
            self.align_playback(display.id, align);
        }
        Some(shown)
    }

    /// Play straight from the source file, bypassing the content cache
    fn show_video_streaming(&mut self, display: &Display, location: &Path, stretch: bool, volume: f32) -> bool {
        let id = display.id;
        let Some((pair, created)) = self.ensure_pair(display) else {
            return false;
        };
        let session = match self.open_video(location, pair, stretch, volume, None) {
            Ok(session) => session,
            Err(e) => {
                warn!(display = %id, path = %location.display(), error = ?e, "Failed to open video");
                self.rollback_pair(id, created);
                return false;
            }
        };

        info!(display = %id, path = %location.display(), stretch, volume, "Streaming video from disk");
        self.install(
            id,
            session,
            ContentEntry::video(location.to_path_buf(), stretch, volume),
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn join_player(
        &mut self,
        display: &Display,
        source: DisplayId,
        player: SharedPlayer,
        scratch: Option<PathBuf>,
        stretch: bool,
        volume: f32,
        original: &Path,
    ) -> bool {
        let id = display.id;
        let Some((pair, created)) = self.ensure_pair(display) else {
            return false;
        };
        let view = match player.borrow_mut().attach(pair.content, stretch) {
            Ok(view) => view,
            Err(e) => {
                warn!(display = %id, source = %source, error = ?e, "Failed to attach shared player");
                self.rollback_pair(id, created);
                return false;
            }
        };
        if let Err(e) = player.borrow_mut().set_volume(self.effective_volume(volume)) {
            warn!(display = %id, error = ?e, "Failed to set volume");
        }

        info!(display = %id, source = %source, path = %original.display(), "Sharing player with another display");
        self.install(
            id,
            PlaybackSession::video(player, view, scratch),
            ContentEntry::video(original.to_path_buf(), stretch, volume),
        );
        true
    }

    // ---- update ----

    /// Change stretch and volume of the running video without reloading it
    pub fn update_video_settings(&mut self, id: DisplayId, stretch: bool, volume: f32) -> bool {
        if self.present(id).is_none() {
            return false;
        }
        let volume = clamp_volume(volume);
        let effective = self.effective_volume(volume);

        let (Some(entry), Some(session)) = (self.entries.get_mut(&id), self.sessions.get_mut(&id)) else {
            debug!(display = %id, "No video to update");
            return false;
        };
        if entry.kind != MediaKind::Video {
            debug!(display = %id, "Display shows an image, not a video");
            return false;
        }

        if let Err(e) = session.set_stretch(stretch) {
            warn!(display = %id, error = ?e, "Failed to apply stretch");
        }
        if let Err(e) = session.set_volume(effective) {
            warn!(display = %id, error = ?e, "Failed to apply volume");
        }
        entry.stretch = stretch;
        entry.volume = Some(volume);

        self.bookmarks.update_settings(id, stretch, Some(volume));
        self.occluded.remove(&id);
        self.apply_play_state(id);
        debug!(display = %id, stretch, volume, "Updated video settings");
        self.emit(id);
        true
    }

    pub fn update_image_stretch(&mut self, id: DisplayId, stretch: bool) -> bool {
        if self.present(id).is_none() {
            return false;
        }
        let (Some(entry), Some(session)) = (self.entries.get_mut(&id), self.sessions.get_mut(&id)) else {
            debug!(display = %id, "No image to update");
            return false;
        };
        if entry.kind != MediaKind::Image {
            debug!(display = %id, "Display shows a video, not an image");
            return false;
        }

        if let Err(e) = session.set_stretch(stretch) {
            warn!(display = %id, error = ?e, "Failed to apply stretch");
        }
        entry.stretch = stretch;

        self.bookmarks.update_settings(id, stretch, None);
        debug!(display = %id, stretch, "Updated image stretch");
        self.emit(id);
        true
    }

    /// Stretch update for whatever the display shows
    pub fn set_stretch(&mut self, id: DisplayId, stretch: bool) -> bool {
        match self.entries.get(&id).map(|e| (e.kind, e.volume)) {
            Some((MediaKind::Image, _)) => self.update_image_stretch(id, stretch),
            Some((MediaKind::Video, volume)) => self.update_video_settings(
                id,
                stretch,
                volume.unwrap_or(crate::constants::bookmark::DEFAULT_VOLUME),
            ),
            None => {
                debug!(display = %id, "Nothing shown, stretch ignored");
                false
            }
        }
    }

    // ---- clear ----

    /// Remove the display's content, windows and bookmark; no-op when empty
    pub fn clear(&mut self, id: DisplayId) -> bool {
        if !self.teardown_display(id) {
            debug!(display = %id, "Nothing to clear");
            return false;
        }
        self.bookmarks.delete(id);
        info!(display = %id, "Cleared wallpaper");
        self.emit(id);
        true
    }

    // ---- internals ----

    /// The display if it is connected; absent displays make operations no-ops
    fn present(&self, id: DisplayId) -> Option<Display> {
        let display = self.registry.get(id).cloned();
        if display.is_none() {
            debug!(display = %id, "Display not connected, ignoring");
        }
        display
    }

    fn ensure_pair(&mut self, display: &Display) -> Option<(WindowPair, bool)> {
        match self
            .windows
            .ensure(&mut self.ws, display, self.settings.idle_pause_sensitivity)
        {
            Ok(result) => Some(result),
            Err(e) => {
                let id = display.id;
                warn!(display = %id, error = ?e, "Failed to create windows");
                None
            }
        }
    }

    /// Undo a pair created for a show that then failed
    fn rollback_pair(&mut self, id: DisplayId, created: bool) {
        if created && !self.sessions.contains_key(&id) {
            self.windows.teardown(&mut self.ws, id);
        }
    }

    fn open_video(
        &mut self,
        path: &Path,
        pair: WindowPair,
        stretch: bool,
        volume: f32,
        scratch: Option<PathBuf>,
    ) -> anyhow::Result<PlaybackSession> {
        let effective = self.effective_volume(volume);
        let player = playback::share(self.media.open_player(path, effective)?);
        let attached = player.borrow_mut().attach(pair.content, stretch);
        match attached {
            Ok(view) => Ok(PlaybackSession::video(player, view, scratch)),
            Err(e) => {
                player.borrow_mut().stop();
                Err(e)
            }
        }
    }

    /// Another display playing `location` whose player can be shared
    fn find_shared_player(
        &self,
        id: DisplayId,
        location: &Path,
    ) -> Option<(DisplayId, SharedPlayer, Option<PathBuf>)> {
        self.entries
            .iter()
            .filter(|(other, entry)| {
                **other != id && entry.kind == MediaKind::Video && entry.location == location
            })
            .find_map(|(other, _)| {
                let session = self.sessions.get(other)?;
                let player = session.player()?.clone();
                Some((*other, player, session.scratch().map(Path::to_path_buf)))
            })
    }

    /// Swap in a freshly built session and entry, then release what they replaced
    fn install(&mut self, id: DisplayId, session: PlaybackSession, entry: ContentEntry) {
        self.loads.forget(id);
        let uses_scratch = session.scratch().is_some();
        let previous_session = self.sessions.insert(id, session);
        let previous_entry = self.entries.insert(id, entry.clone());

        if let Some(previous) = previous_session {
            let old_scratch = previous.scratch().map(Path::to_path_buf);
            previous.teardown();
            if let Some(path) = old_scratch {
                self.remove_scratch_if_unused(&path);
            }
        }
        if !uses_scratch {
            self.purge_scratch(id);
        }
        if let Some(previous) = previous_entry
            && previous.location != entry.location
        {
            self.release_cached(&previous.location);
        }

        self.occluded.remove(&id);
        self.apply_play_state(id);

        if let Err(e) = self.bookmarks.save(id, &entry.location, entry.stretch, entry.volume, now_epoch_secs()) {
            warn!(display = %id, error = ?e, "Failed to save bookmark");
        }
        self.emit(id);
    }

    /// Tear down session, windows and entry without touching the bookmark
    fn teardown_display(&mut self, id: DisplayId) -> bool {
        let mut had_anything = false;
        self.loads.forget(id);

        if let Some(session) = self.sessions.remove(&id) {
            let scratch = session.scratch().map(Path::to_path_buf);
            session.teardown();
            if let Some(path) = scratch {
                self.remove_scratch_if_unused(&path);
            }
            had_anything = true;
        }
        had_anything |= self.windows.teardown(&mut self.ws, id);
        if let Some(entry) = self.entries.remove(&id) {
            self.release_cached(&entry.location);
            had_anything = true;
        }

        self.purge_scratch(id);
        self.occluded.remove(&id);
        self.pending_volume.remove(&id);
        let timers = self.registry.timers_mut();
        timers.cancel(crate::registry::TimerClass::Volume(id));
        timers.cancel(crate::registry::TimerClass::ResumeGrace(id));
        had_anything
    }

    fn release_cached(&mut self, location: &Path) {
        self.cache
            .release(location, self.entries.values().map(|e| e.location.as_path()));
    }

    /// Scratch files played by a live session or still being written
    fn scratch_in_use(&self) -> HashSet<PathBuf> {
        self.sessions
            .values()
            .filter_map(|s| s.scratch())
            .chain(self.loads.scratch_paths())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Delete the display's scratch files that no live session still plays
    fn purge_scratch(&mut self, id: DisplayId) {
        let in_use = self.scratch_in_use();
        self.scratch.purge_unused(id, &in_use);
    }

    fn remove_scratch_if_unused(&mut self, path: &Path) {
        if !self.scratch_in_use().contains(path) {
            remove_file_or_log(path);
        }
    }

    fn effective_volume(&self, volume: f32) -> f32 {
        if self.settings.global_mute { 0.0 } else { volume }
    }

    /// Play, or stay paused while the system sleeps
    fn apply_play_state(&self, id: DisplayId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let result = if self.asleep { session.pause() } else { session.play() };
        if let Err(e) = result {
            warn!(display = %id, error = ?e, "Failed to set play state");
        }
    }

    fn persist_settings(&mut self) {
        self.settings.save(self.bookmarks.store_mut());
    }

    fn emit(&mut self, id: DisplayId) {
        self.observers.emit(ContentChanged { display: id });
    }
}

fn video_extension(path: &Path) -> Option<String> {
    if MediaKind::from_path(path) != Some(MediaKind::Video) {
        return None;
    }
    Some(path.extension()?.to_str()?.to_ascii_lowercase())
}

fn remove_file_or_log(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
    }
}
