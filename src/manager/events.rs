//! Reactions to the outside world: hot-plug, sleep/wake, occlusion and timers

use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::WallpaperManager;
use crate::backend::{MediaBackend, PlatformEvent, WindowSystem};
use crate::bookmark::now_epoch_secs;
use crate::constants::timing;
use crate::registry::{TimerClass, TopologyDiff};
use crate::types::{DisplayId, WindowHandle};

impl<W: WindowSystem, M: MediaBackend> WallpaperManager<W, M> {
    pub fn handle_platform_event(&mut self, event: PlatformEvent, now: Instant) {
        match event {
            PlatformEvent::TopologyChanged => self.on_topology_changed(now),
            PlatformEvent::Occlusion { sentinel, covered } => self.on_occlusion(sentinel, covered),
        }
    }

    /// Start or extend the quiet period before reconciling
    pub fn on_topology_changed(&mut self, now: Instant) {
        debug!("Display configuration changed");
        self.registry
            .debounce(TimerClass::Topology, now + timing::TOPOLOGY_DEBOUNCE);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.timers().next_deadline()
    }

    /// Run every timer whose deadline has passed
    pub fn poll_timers(&mut self, now: Instant) {
        for timer in self.registry.timers_mut().take_due(now) {
            match timer {
                TimerClass::Topology => self.reconcile(now),
                TimerClass::Wake => self.finish_wake(now),
                TimerClass::ResumeGrace(id) => self.resume_display(id),
                TimerClass::Volume(id) => self.apply_pending_volume(id),
            }
        }
    }

    /// Ask the window system for the current displays; keeps the old set on failure
    pub(super) fn refresh_displays(&mut self) -> TopologyDiff {
        match self.ws.displays() {
            Ok(displays) => {
                let diff = self.registry.refresh(displays);
                self.unreconciled.extend(diff.added.iter().copied());
                diff
            }
            Err(e) => {
                warn!(error = ?e, "Failed to enumerate displays");
                TopologyDiff::default()
            }
        }
    }

    /// Tear down every display that holds resources but is no longer connected
    ///
    /// Bookmarks are kept unless they are past the horizon, so a display that
    /// comes back can pick up where it left off.
    pub fn cleanup_disconnected(&mut self, now: Instant) -> Vec<DisplayId> {
        let diff = self.refresh_displays();
        if !diff.added.is_empty() {
            // New displays still need their reconciliation pass
            self.on_topology_changed(now);
        }
        self.release_absent()
    }

    fn release_absent(&mut self) -> Vec<DisplayId> {
        let mut gone: BTreeSet<DisplayId> = self
            .entries
            .keys()
            .chain(self.sessions.keys())
            .copied()
            .collect();
        gone.extend(self.windows.ids());
        gone.retain(|id| !self.registry.contains(*id));

        let now = now_epoch_secs();
        for id in &gone {
            self.teardown_display(*id);
            self.bookmarks.purge_if_expired(*id, now);
            info!(display = %id, "Released resources of disconnected display");
        }
        gone.into_iter().collect()
    }

    /// Converge on the current display set after topology settles
    pub fn reconcile(&mut self, now: Instant) {
        self.refresh_displays();
        self.release_absent();

        let added: Vec<DisplayId> = std::mem::take(&mut self.unreconciled)
            .into_iter()
            .filter(|id| self.registry.contains(*id))
            .collect();

        for id in added {
            if self.entries.contains_key(&id) && self.sessions.contains_key(&id) {
                continue;
            }

            let source = self
                .settings
                .auto_sync_new_screens
                .then(|| self.sync_source_for(id))
                .flatten();

            let restored = match source {
                Some(source) => {
                    info!(display = %id, source = %source, "Syncing new display");
                    self.sync_window(id, source)
                }
                None if self.entries.contains_key(&id) => self.restore_content(id),
                None => self.restore_display_from_bookmark(id),
            };

            if restored {
                self.registry
                    .timers_mut()
                    .arm(TimerClass::ResumeGrace(id), now + timing::RESUME_GRACE);
            } else {
                debug!(display = %id, "New display has nothing to restore");
            }
        }
    }

    /// Lowest-numbered other display that is showing something
    fn sync_source_for(&self, id: DisplayId) -> Option<DisplayId> {
        self.entries
            .keys()
            .copied()
            .find(|other| *other != id && self.registry.contains(*other) && self.sessions.contains_key(other))
    }

    fn resume_display(&mut self, id: DisplayId) {
        if self.asleep || self.occluded.contains(&id) {
            return;
        }
        if let Some(session) = self.sessions.get(&id)
            && let Err(e) = session.play()
        {
            warn!(display = %id, error = ?e, "Failed to resume");
        }
    }

    /// Pause everything and drop displays that went away
    pub fn on_sleep(&mut self, now: Instant) {
        info!("System going to sleep, pausing playback");
        self.asleep = true;
        self.registry.timers_mut().cancel(TimerClass::Wake);
        for (id, session) in &self.sessions {
            if let Err(e) = session.pause() {
                warn!(display = %id, error = ?e, "Failed to pause");
            }
        }
        self.cleanup_disconnected(now);
    }

    /// Resume after the settle delay
    pub fn on_wake(&mut self, now: Instant) {
        info!("System woke up");
        self.registry
            .debounce(TimerClass::Wake, now + timing::WAKE_SETTLE);
    }

    fn finish_wake(&mut self, now: Instant) {
        self.asleep = false;
        let mut resumed = 0;
        for (id, session) in &self.sessions {
            if self.occluded.contains(id) || !session.is_video() {
                continue;
            }
            if let Some(position) = session.position()
                && let Err(e) = session.seek(position)
            {
                warn!(display = %id, error = ?e, "Failed to seek on wake");
            }
            match session.play() {
                Ok(()) => resumed += 1,
                Err(e) => warn!(display = %id, error = ?e, "Failed to resume on wake"),
            }
        }
        info!(resumed, "Resumed playback after wake");
        self.reconcile(now);
    }

    /// Pause when the desktop under a sentinel is covered, resume when it shows again
    pub fn on_occlusion(&mut self, sentinel: WindowHandle, covered: bool) {
        let Some(id) = self.windows.display_for_sentinel(sentinel) else {
            debug!(sentinel = sentinel.0, "Occlusion for unknown sentinel");
            return;
        };
        let Some(session) = self.sessions.get(&id) else {
            return;
        };

        if covered {
            self.occluded.insert(id);
            // A shared player keeps running while any of its displays is visible
            let all_covered = self
                .sessions
                .iter()
                .filter(|(_, other)| other.shares_player_with(session))
                .all(|(other, _)| self.occluded.contains(other));
            if all_covered {
                debug!(display = %id, "Desktop covered, pausing");
                if let Err(e) = session.pause() {
                    warn!(display = %id, error = ?e, "Failed to pause");
                }
            }
        } else {
            self.occluded.remove(&id);
            if !self.asleep {
                debug!(display = %id, "Desktop visible, resuming");
                if let Err(e) = session.play() {
                    warn!(display = %id, error = ?e, "Failed to resume");
                }
            }
        }
    }

    /// Release every window, player and scratch file; bookmarks survive
    pub fn shutdown(&mut self) {
        let mut ids: BTreeSet<DisplayId> = self.entries.keys().copied().collect();
        ids.extend(self.sessions.keys().copied());
        ids.extend(self.windows.ids());
        for id in ids {
            self.teardown_display(id);
        }
        self.scratch.purge_all();
        info!("Wallpaper manager shut down");
    }
}
