//! Cloning content between displays, volume, mute and restore

use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::WallpaperManager;
use crate::backend::{MediaBackend, WindowSystem};
use crate::bookmark::AccessGrant;
use crate::constants::{bookmark::DEFAULT_VOLUME, timing};
use crate::registry::TimerClass;
use crate::types::{clamp_volume, DisplayId, MediaKind};

/// Where a synced video should pick up once its player is ready
#[derive(Debug, Clone, Copy)]
pub(super) struct Alignment {
    pub source: DisplayId,
    /// Source position when the sync was requested
    pub position: Option<Duration>,
    pub playing: bool,
}

impl<W: WindowSystem, M: MediaBackend> WallpaperManager<W, M> {
    /// Make `destination` show what `source` shows, at the same playback position
    ///
    /// Never touches the source display.
    pub fn sync_window(&mut self, destination: DisplayId, source: DisplayId) -> bool {
        if destination == source {
            return false;
        }
        if self.present(destination).is_none() || self.present(source).is_none() {
            return false;
        }
        let Some(entry) = self.entries.get(&source).cloned() else {
            debug!(source = %source, "Source display has no content, nothing to sync");
            return false;
        };
        let (position, playing) = self
            .sessions
            .get(&source)
            .map(|s| (s.position(), s.is_playing()))
            .unwrap_or((None, false));
        let align = Alignment {
            source,
            position,
            playing,
        };

        self.clear(destination);

        let shown = match entry.kind {
            MediaKind::Image => self.show_image(destination, &entry.location, entry.stretch),
            MediaKind::Video => self.show_video_aligned(
                destination,
                &entry.location,
                entry.stretch,
                entry.volume.unwrap_or(DEFAULT_VOLUME),
                Some(align),
            ),
        };
        if !shown {
            warn!(destination = %destination, source = %source, "Sync failed");
            return false;
        }
        info!(destination = %destination, source = %source, "Synced display");
        true
    }

    /// Bring a separately decoded destination to the source's position and state
    ///
    /// A destination whose player became ready later follows the source's
    /// current position, as long as the source still plays the same file.
    pub(super) fn align_playback(&mut self, destination: DisplayId, align: Alignment) {
        let source = align.source;
        let (Some(dst), Some(src)) = (self.sessions.get(&destination), self.sessions.get(&source)) else {
            return;
        };
        if dst.shares_player_with(src) {
            return;
        }
        let same_content = match (self.entries.get(&destination), self.entries.get(&source)) {
            (Some(dst_entry), Some(src_entry)) => dst_entry.location == src_entry.location,
            _ => false,
        };
        let position = same_content
            .then(|| src.position())
            .flatten()
            .or(align.position);

        if let Err(e) = dst.pause() {
            warn!(display = %destination, error = ?e, "Failed to pause for sync");
        }
        if let Some(position) = position
            && let Err(e) = dst.seek(position)
        {
            warn!(display = %destination, error = ?e, "Failed to seek for sync");
        }
        if align.playing
            && !self.asleep
            && let Err(e) = dst.play()
        {
            warn!(display = %destination, error = ?e, "Failed to resume after sync");
        }
    }

    /// Sync every other connected display from `source`
    pub fn sync_all(&mut self, source: DisplayId, now: Instant) -> usize {
        self.cleanup_disconnected(now);
        if self.present(source).is_none() {
            return 0;
        }
        let synced = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| *id != source)
            .filter(|id| self.sync_window(*id, source))
            .count();
        info!(source = %source, synced, "Synced all displays");
        synced
    }

    /// Silence every video, remembering the volumes that were audible
    pub fn mute_all(&mut self) -> usize {
        let mut muted = 0;
        for (id, session) in &mut self.sessions {
            let Some(volume) = session.volume() else {
                continue;
            };
            if volume > 0.0 {
                self.saved_volumes.insert(*id, volume);
            }
            if let Err(e) = session.set_volume(0.0) {
                warn!(display = %id, error = ?e, "Failed to mute");
                continue;
            }
            muted += 1;
        }
        self.settings.global_mute = true;
        self.persist_settings();
        info!(muted, "Muted all displays");
        muted
    }

    /// Undo [`Self::mute_all`]; displays that were silent before stay silent
    pub fn restore_all(&mut self) -> usize {
        let saved = std::mem::take(&mut self.saved_volumes);
        let mut restored = 0;
        for (id, session) in &mut self.sessions {
            if !session.is_video() {
                continue;
            }
            let volume = saved
                .get(id)
                .copied()
                .or_else(|| self.entries.get(id).and_then(|e| e.volume))
                .unwrap_or(0.0);
            if let Err(e) = session.set_volume(volume) {
                warn!(display = %id, error = ?e, "Failed to restore volume");
                continue;
            }
            restored += 1;
        }
        self.settings.global_mute = false;
        self.persist_settings();
        info!(restored, "Restored volumes");
        restored
    }

    /// Manual volume change; an audible volume lifts the global mute
    pub fn set_volume(&mut self, id: DisplayId, volume: f32) -> bool {
        let volume = clamp_volume(volume);
        self.pending_volume.remove(&id);
        self.registry.timers_mut().cancel(TimerClass::Volume(id));

        let Some(entry) = self.entries.get(&id) else {
            debug!(display = %id, "Nothing shown, volume ignored");
            return false;
        };
        if entry.kind != MediaKind::Video {
            debug!(display = %id, "Images have no volume");
            return false;
        }
        let stretch = entry.stretch;

        if volume > 0.0 && self.settings.global_mute {
            info!(display = %id, "Manual volume change lifts global mute");
            self.settings.global_mute = false;
            self.persist_settings();
        }
        self.update_video_settings(id, stretch, volume)
    }

    /// Debounced volume change for continuous slider input
    pub fn request_volume(&mut self, id: DisplayId, volume: f32, now: Instant) {
        self.pending_volume.insert(id, clamp_volume(volume));
        self.registry
            .timers_mut()
            .arm(TimerClass::Volume(id), now + timing::VOLUME_DEBOUNCE);
    }

    /// Apply the settled slider value if it actually differs from the player
    pub(super) fn apply_pending_volume(&mut self, id: DisplayId) {
        let Some(volume) = self.pending_volume.remove(&id) else {
            return;
        };
        let current = self.sessions.get(&id).and_then(|s| s.volume());
        match current {
            Some(current) if (current - volume).abs() <= timing::VOLUME_EPSILON => {
                debug!(display = %id, volume, "Volume unchanged, skipping");
            }
            Some(_) => {
                self.set_volume(id, volume);
            }
            None => debug!(display = %id, "No video for pending volume"),
        }
    }

    /// Re-show a display's own content entry
    pub fn restore_content(&mut self, id: DisplayId) -> bool {
        let Some(entry) = self.entries.get(&id).cloned() else {
            debug!(display = %id, "No content to restore");
            return false;
        };
        match entry.kind {
            MediaKind::Image => self.show_image(id, &entry.location, entry.stretch),
            MediaKind::Video => self.show_video(
                id,
                &entry.location,
                entry.stretch,
                entry.volume.unwrap_or(DEFAULT_VOLUME),
            ),
        }
    }

    /// Restore every connected display from its bookmark
    pub fn restore_from_bookmark(&mut self) -> usize {
        let restored = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| self.restore_display_from_bookmark(*id))
            .count();
        info!(restored, "Restored displays from bookmarks");
        restored
    }

    /// Show the bookmarked content of one display, purging records that cannot be used
    pub(super) fn restore_display_from_bookmark(&mut self, id: DisplayId) -> bool {
        let Some(record) = self.bookmarks.load(id) else {
            return false;
        };
        let resolved = match record.bookmark.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                info!(display = %id, error = %e, "Bookmark no longer resolves, purging");
                self.bookmarks.delete(id);
                return false;
            }
        };
        let Some(kind) = MediaKind::from_path(&resolved.location) else {
            info!(display = %id, path = %resolved.location.display(), "Bookmarked file is not media, purging");
            self.bookmarks.delete(id);
            return false;
        };
        if resolved.stale {
            info!(display = %id, path = %resolved.location.display(), "Bookmark is stale, recreating");
        }

        let grant = match AccessGrant::acquire(&resolved.location) {
            Ok(grant) => grant,
            Err(e) => {
                info!(display = %id, error = ?e, "Bookmarked file is unreadable, purging");
                self.bookmarks.delete(id);
                return false;
            }
        };
        let location: &Path = grant.path();
        match kind {
            MediaKind::Image => self.show_image(id, location, record.stretch),
            MediaKind::Video => self.show_video(
                id,
                location,
                record.stretch,
                record.volume.unwrap_or(DEFAULT_VOLUME),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use crate::types::{ContentEntry, DisplayId};
    use std::time::{Duration, Instant};

    const A: DisplayId = DisplayId(1);
    const B: DisplayId = DisplayId(2);
    const C: DisplayId = DisplayId(3);

    #[test]
    fn test_sync_all_clones_video_onto_other_displays() {
        let mut fx = Fixture::new(2);
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 0.8));
        fx.set_position(A, Duration::from_secs(42));

        assert_eq!(fx.manager.sync_all(A, Instant::now()), 1);

        assert_eq!(
            fx.manager.entry(B),
            Some(&ContentEntry::video(clip.clone(), false, 0.8))
        );
        assert_eq!(fx.position(B), Some(Duration::from_secs(42)));
        assert!(fx.manager.is_playing(B));
    }

    #[test]
    fn test_sync_never_mutates_source() {
        let mut fx = Fixture::new(2);
        let clip = fx.media_file("clip.mp4");
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_video(A, &clip, true, 0.25));
        assert!(fx.manager.show_image(B, &photo, false));
        let before = fx.manager.entry(A).cloned();
        let pair = fx.manager.window_pair(A);

        assert!(fx.manager.sync_window(B, A));

        assert_eq!(fx.manager.entry(A).cloned(), before);
        assert_eq!(fx.manager.window_pair(A), pair);
        let dst = fx.manager.entry(B).unwrap();
        let src = before.unwrap();
        assert_eq!((dst.kind, dst.stretch, dst.volume), (src.kind, src.stretch, src.volume));
    }

    #[test]
    fn test_sync_separate_player_matches_position_and_pause() {
        let mut fx = Fixture::new(2);
        fx.disable_memory_cache();
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        fx.set_position(A, Duration::from_millis(7_500));
        fx.set_playing(A, false);

        assert!(fx.manager.sync_window(B, A));

        assert_eq!(fx.media.borrow().live_players().len(), 2);
        assert_eq!(fx.position(B), Some(Duration::from_millis(7_500)));
        assert!(!fx.manager.is_playing(B));
        assert!(!fx.manager.is_playing(A));
    }

    #[test]
    fn test_sync_image() {
        let mut fx = Fixture::new(3);
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_image(A, &photo, true));

        assert_eq!(fx.manager.sync_all(A, Instant::now()), 2);
        for id in [B, C] {
            assert_eq!(
                fx.manager.entry(id),
                Some(&ContentEntry::image(photo.clone(), true))
            );
        }
    }

    #[test]
    fn test_sync_from_empty_source_changes_nothing() {
        let mut fx = Fixture::new(2);
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_image(B, &photo, false));

        assert!(!fx.manager.sync_window(B, A));
        assert!(!fx.manager.sync_window(A, A));
        assert!(fx.manager.entry(B).is_some());
    }

    #[test]
    fn test_mute_then_restore_round_trips_volumes() {
        let mut fx = Fixture::new(3);
        fx.disable_memory_cache();
        let clip = fx.media_file("clip.mp4");
        let other = fx.media_file("other.mp4");
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_video(A, &clip, false, 0.7));
        assert!(fx.manager.show_video(B, &other, false, 0.0));
        assert!(fx.manager.show_image(C, &photo, false));

        assert_eq!(fx.manager.mute_all(), 2);
        assert_eq!(fx.player_volume(A), Some(0.0));
        assert!(fx.manager.settings().global_mute);

        fx.manager.restore_all();
        assert_eq!(fx.player_volume(A), Some(0.7));
        assert_eq!(fx.player_volume(B), Some(0.0));
        assert!(!fx.manager.settings().global_mute);
        assert!(fx.manager.saved_volumes.is_empty());
    }

    #[test]
    fn test_audible_manual_volume_lifts_global_mute() {
        let mut fx = Fixture::new(1);
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 0.5));
        fx.manager.mute_all();

        assert!(fx.manager.set_volume(A, 0.0));
        assert!(fx.manager.settings().global_mute);

        assert!(fx.manager.set_volume(A, 0.9));
        assert!(!fx.manager.settings().global_mute);
        assert_eq!(fx.player_volume(A), Some(0.9));
    }

    #[test]
    fn test_requested_volume_applies_last_value_after_quiet_period() {
        let mut fx = Fixture::new(1);
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        let start = Instant::now();

        fx.manager.request_volume(A, 0.9, start);
        fx.manager.request_volume(A, 0.6, start + Duration::from_millis(50));
        fx.manager.request_volume(A, 0.4, start + Duration::from_millis(90));

        fx.manager.poll_timers(start + Duration::from_millis(150));
        assert_eq!(fx.player_volume(A), Some(1.0));

        fx.manager.poll_timers(start + Duration::from_millis(190));
        assert_eq!(fx.player_volume(A), Some(0.4));
        assert_eq!(fx.manager.entry(A).unwrap().volume, Some(0.4));
    }

    #[test]
    fn test_requested_volume_within_epsilon_is_skipped() {
        let mut fx = Fixture::new(1);
        let events = fx.record_events();
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 0.5));
        let start = Instant::now();

        fx.manager.request_volume(A, 0.505, start);
        fx.manager.poll_timers(start + Duration::from_millis(200));

        assert_eq!(fx.manager.entry(A).unwrap().volume, Some(0.5));
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn test_restore_content_reshows_own_entry() {
        let mut fx = Fixture::new(1);
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, true, 0.3));

        assert!(fx.manager.restore_content(A));
        assert_eq!(
            fx.manager.entry(A),
            Some(&ContentEntry::video(clip.clone(), true, 0.3))
        );
        assert_eq!(fx.media.borrow().live_players().len(), 1);
        assert!(!fx.manager.restore_content(B));
    }

    #[test]
    fn test_restart_restores_from_bookmarks() {
        let mut fx = Fixture::new(2);
        let clip = fx.media_file("clip.mp4");
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_video(A, &clip, true, 0.6));
        assert!(fx.manager.show_image(B, &photo, false));

        let mut restarted = fx.restart();
        assert_eq!(restarted.manager.start(), 2);

        let a = restarted.manager.entry(A).unwrap();
        assert_eq!(a.location, std::fs::canonicalize(&clip).unwrap());
        assert!(a.stretch);
        assert_eq!(a.volume, Some(0.6));
        assert_eq!(
            restarted.manager.entry(B).unwrap().location,
            std::fs::canonicalize(&photo).unwrap()
        );
    }

    #[test]
    fn test_unresolvable_bookmark_is_purged() {
        let mut fx = Fixture::new(1);
        let clip = fx.media_file("clip.mp4");
        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        std::fs::remove_file(&clip).unwrap();

        let mut restarted = fx.restart();
        assert_eq!(restarted.manager.start(), 0);
        assert!(!restarted.bookmarks_contain(A));
        assert!(restarted.manager.entry(A).is_none());
    }

    #[test]
    fn test_expired_bookmark_is_not_restored() {
        let mut fx = Fixture::new(1);
        let photo = fx.media_file("photo.png");
        assert!(fx.manager.show_image(A, &photo, false));
        fx.age_bookmark(A, crate::constants::bookmark::HORIZON_SECS + 60);

        let mut restarted = fx.restart();
        assert_eq!(restarted.manager.start(), 0);
        assert!(!restarted.bookmarks_contain(A));
    }
}
