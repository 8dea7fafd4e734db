//! Video file work that must not run on the control thread
//!
//! A memory-backed video show needs the source read into memory on a cache
//! miss and a scratch file written before a player can open it. Both happen in
//! one [`VideoLoad`]. The daemon runs loads on the blocking pool and posts the
//! result back to [`WallpaperManager::complete_load`]; when loads are not
//! deferred the manager runs them inline.
//!
//! Every show waiting on a load holds a ticket. A later show, clear or
//! disconnect of the same display makes the ticket stale, and a stale show is
//! dropped when its load completes.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::sync::Alignment;
use super::{remove_file_or_log, video_extension, WallpaperManager};
use crate::backend::{MediaBackend, WindowSystem};
use crate::cache::{self, Bytes};
use crate::types::{Display, DisplayId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadId(u64);

/// Identifies one show request waiting on a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShowTicket(u64);

/// Blocking file work for one source
#[derive(Debug, Clone)]
pub struct VideoLoad {
    pub id: LoadId,
    pub source: PathBuf,
    pub scratch: PathBuf,
    /// Bytes already in the content cache; `None` reads the source
    cached: Option<Bytes>,
}

impl VideoLoad {
    /// Read the source on a cache miss, then write the scratch file
    pub fn run(&self) -> Result<Bytes> {
        let bytes = match &self.cached {
            Some(bytes) => bytes.clone(),
            None => cache::read_source(&self.source)?,
        };
        cache::write_scratch(&self.scratch, &bytes)?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ticket: ShowTicket,
    display: DisplayId,
    stretch: bool,
    volume: f32,
    align: Option<Alignment>,
}

#[derive(Debug)]
struct InFlight {
    source: PathBuf,
    scratch: PathBuf,
    waiting: Vec<Waiter>,
}

#[derive(Debug, Default)]
pub(super) struct Loads {
    defer: bool,
    next: u64,
    queued: Vec<VideoLoad>,
    in_flight: HashMap<LoadId, InFlight>,
    /// Latest show per display; anything older is stale
    current: HashMap<DisplayId, ShowTicket>,
}

impl Loads {
    fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    /// Make any show still waiting for `display` stale
    pub(super) fn forget(&mut self, display: DisplayId) {
        self.current.remove(&display);
    }

    /// Scratch files that loads in flight are writing
    pub(super) fn scratch_paths(&self) -> impl Iterator<Item = &Path> {
        self.in_flight.values().map(|flight| flight.scratch.as_path())
    }

    fn is_current(&self, waiter: &Waiter) -> bool {
        self.current.get(&waiter.display) == Some(&waiter.ticket)
    }
}

impl<W: WindowSystem, M: MediaBackend> WallpaperManager<W, M> {
    /// Hand loads to the caller through [`Self::take_loads`] instead of running them inline
    pub fn defer_loads(&mut self) {
        self.loads.defer = true;
    }

    pub fn take_loads(&mut self) -> Vec<VideoLoad> {
        std::mem::take(&mut self.loads.queued)
    }

    /// The show still waiting for a load on `display`, if any
    pub fn pending_show(&self, display: DisplayId) -> Option<ShowTicket> {
        self.loads.current.get(&display).copied()
    }

    /// Finish every show waiting on load `id`; returns whether each was shown
    pub fn complete_load(&mut self, id: LoadId, result: Result<Bytes>) -> Vec<(ShowTicket, bool)> {
        let Some(InFlight {
            source,
            scratch,
            waiting,
        }) = self.loads.in_flight.remove(&id)
        else {
            debug!(load = id.0, "Completion for unknown load");
            return Vec::new();
        };

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %source.display(), error = ?e, "Failed to prepare video");
                remove_file_or_log(&scratch);
                return waiting
                    .into_iter()
                    .map(|waiter| {
                        if self.loads.is_current(&waiter) {
                            self.loads.forget(waiter.display);
                        }
                        (waiter.ticket, false)
                    })
                    .collect();
            }
        };
        if self.settings.use_memory_cache {
            self.cache.insert(source.clone(), bytes);
        }

        let mut claimed = false;
        let mut outcomes = Vec::with_capacity(waiting.len());
        for waiter in waiting {
            let shown = self.show_loaded(&waiter, &source, &scratch, &mut claimed);
            outcomes.push((waiter.ticket, shown));
        }

        if !claimed {
            remove_file_or_log(&scratch);
        }
        // Nothing may be left cached for a show that did not happen
        self.release_cached(&source);
        outcomes
    }

    /// Prepare `source` for display `id`; joins a load of the same source already in flight
    pub(super) fn begin_load(
        &mut self,
        id: DisplayId,
        source: &Path,
        cached: Option<Bytes>,
        stretch: bool,
        volume: f32,
        align: Option<Alignment>,
    ) -> bool {
        let Some(extension) = video_extension(source) else {
            warn!(display = %id, path = %source.display(), "Not a supported video type");
            return false;
        };
        let ticket = ShowTicket(self.loads.next_id());
        self.loads.current.insert(id, ticket);
        let waiter = Waiter {
            ticket,
            display: id,
            stretch,
            volume,
            align,
        };

        if let Some(flight) = self
            .loads
            .in_flight
            .values_mut()
            .find(|flight| flight.source == source)
        {
            debug!(display = %id, path = %source.display(), "Joining load already in flight");
            flight.waiting.push(waiter);
            return true;
        }

        self.purge_scratch(id);
        let load = VideoLoad {
            id: LoadId(self.loads.next_id()),
            source: source.to_path_buf(),
            scratch: self.scratch.fresh_path(id, &extension),
            cached,
        };
        self.loads.in_flight.insert(
            load.id,
            InFlight {
                source: load.source.clone(),
                scratch: load.scratch.clone(),
                waiting: vec![waiter],
            },
        );

        if self.loads.defer {
            debug!(
                display = %id,
                path = %source.display(),
                cached = load.cached.is_some(),
                "Queued video load"
            );
            self.loads.queued.push(load);
            return true;
        }

        let result = load.run();
        self.complete_load(load.id, result)
            .into_iter()
            .any(|(done, shown)| done == ticket && shown)
    }

    fn show_loaded(&mut self, waiter: &Waiter, source: &Path, scratch: &Path, claimed: &mut bool) -> bool {
        let id = waiter.display;
        if !self.loads.is_current(waiter) {
            debug!(display = %id, path = %source.display(), "Show was superseded while loading");
            return false;
        }
        self.loads.forget(id);
        let Some(display) = self.present(id) else {
            return false;
        };

        let shown = if let Some((other, player, shared_scratch)) = self.find_shared_player(id, source) {
            self.join_player(&display, other, player, shared_scratch, waiter.stretch, waiter.volume, source)
        } else if !*claimed {
            *claimed = self.open_scratch(&display, scratch, waiter.stretch, waiter.volume, source);
            *claimed
        } else {
            false
        };

        if shown && let Some(align) = waiter.align {
            self.align_playback(id, align);
        }
        shown
    }

    fn open_scratch(&mut self, display: &Display, scratch: &Path, stretch: bool, volume: f32, original: &Path) -> bool {
        let id = display.id;
        let Some((pair, created)) = self.ensure_pair(display) else {
            return false;
        };
        let session = match self.open_video(scratch, pair, stretch, volume, Some(scratch.to_path_buf())) {
            Ok(session) => session,
            Err(e) => {
                warn!(display = %id, path = %original.display(), error = ?e, "Failed to open video");
                self.rollback_pair(id, created);
                return false;
            }
        };

        info!(display = %id, path = %original.display(), stretch, volume, "Showing cached video");
        self.install(
            id,
            session,
            crate::types::ContentEntry::video(original.to_path_buf(), stretch, volume),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use crate::types::{ContentEntry, DisplayId};
    use std::time::Instant;

    const A: DisplayId = DisplayId(1);
    const B: DisplayId = DisplayId(2);

    #[test]
    fn test_deferred_show_installs_on_completion() {
        let mut fx = Fixture::new(1);
        fx.manager.defer_loads();
        let events = fx.record_events();
        let clip = fx.media_file("clip.mp4");

        assert!(fx.manager.show_video(A, &clip, true, 0.4));
        assert!(fx.manager.entry(A).is_none());
        assert!(fx.media.borrow().live_players().is_empty());
        let ticket = fx.manager.pending_show(A).unwrap();

        let loads = fx.manager.take_loads();
        assert_eq!(loads.len(), 1);
        assert!(fx.manager.take_loads().is_empty());
        let result = loads[0].run();
        assert_eq!(fx.manager.complete_load(loads[0].id, result), vec![(ticket, true)]);

        assert_eq!(
            fx.manager.entry(A),
            Some(&ContentEntry::video(clip.clone(), true, 0.4))
        );
        assert!(fx.manager.is_cached(&clip));
        assert_eq!(fx.scratch_files(A), vec![loads[0].scratch.clone()]);
        assert_eq!(fx.manager.pending_show(A), None);
        assert_eq!(*events.borrow(), vec![A]);
    }

    #[test]
    fn test_same_source_is_read_once_and_shared() {
        let mut fx = Fixture::new(2);
        fx.manager.defer_loads();
        let clip = fx.media_file("clip.mp4");

        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        assert!(fx.manager.show_video(B, &clip, false, 1.0));
        let loads = fx.manager.take_loads();
        assert_eq!(loads.len(), 1);

        let outcomes = fx.manager.complete_load(loads[0].id, loads[0].run());
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, shown)| *shown));

        let media = fx.media.borrow();
        let players = media.live_players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].views.len(), 2);
    }

    #[test]
    fn test_superseded_load_is_dropped() {
        let mut fx = Fixture::new(1);
        fx.manager.defer_loads();
        let clip = fx.media_file("clip.mp4");
        let photo = fx.media_file("photo.png");

        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        assert!(fx.manager.show_image(A, &photo, false));
        assert_eq!(fx.manager.pending_show(A), None);

        let load = fx.manager.take_loads().remove(0);
        let outcomes = fx.manager.complete_load(load.id, load.run());
        assert!(outcomes.iter().all(|(_, shown)| !shown));

        assert_eq!(fx.manager.entry(A).unwrap().location, photo);
        assert!(!fx.manager.is_cached(&clip));
        assert!(!load.scratch.exists());
        assert!(fx.media.borrow().live_players().is_empty());
    }

    #[test]
    fn test_load_for_vanished_display_leaves_nothing_cached() {
        let mut fx = Fixture::new(2);
        fx.manager.defer_loads();
        let clip = fx.media_file("clip.mp4");

        assert!(fx.manager.show_video(B, &clip, false, 1.0));
        fx.connect(&[1]);
        fx.manager.reconcile(Instant::now());

        let load = fx.manager.take_loads().remove(0);
        let outcomes = fx.manager.complete_load(load.id, load.run());
        assert!(outcomes.iter().all(|(_, shown)| !shown));
        assert!(!fx.manager.is_cached(&clip));
        assert!(fx.scratch_files(B).is_empty());
    }

    #[test]
    fn test_failed_read_rejects_every_waiter() {
        let mut fx = Fixture::new(2);
        fx.manager.defer_loads();
        let clip = fx.media_file("clip.mp4");

        assert!(fx.manager.show_video(A, &clip, false, 1.0));
        assert!(fx.manager.show_video(B, &clip, false, 1.0));
        std::fs::remove_file(&clip).unwrap();

        let load = fx.manager.take_loads().remove(0);
        let outcomes = fx.manager.complete_load(load.id, load.run());
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, shown)| !shown));
        assert!(fx.manager.entry(A).is_none());
        assert!(!fx.manager.is_cached(&clip));
        assert_eq!(fx.manager.pending_show(A), None);
    }
}
