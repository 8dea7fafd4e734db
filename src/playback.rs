//! Playback Session
//!
//! A session is what renders into one display's content window: a static image
//! view or one view of a looping player. Video players are reference counted so
//! two displays showing the same source share a single decoder; the player is
//! stopped when the last session referencing it goes away.

use anyhow::Result;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{ImageView, Player, ViewId};

pub type SharedPlayer = Rc<RefCell<Box<dyn Player>>>;

pub fn share(player: Box<dyn Player>) -> SharedPlayer {
    Rc::new(RefCell::new(player))
}

enum SessionKind {
    Image(Box<dyn ImageView>),
    Video {
        player: SharedPlayer,
        view: ViewId,
        /// Scratch file backing a memory-cached source; `None` when streaming
        /// straight from the source file
        scratch: Option<PathBuf>,
    },
}

pub struct PlaybackSession {
    kind: SessionKind,
}

impl PlaybackSession {
    pub fn image(view: Box<dyn ImageView>) -> Self {
        Self {
            kind: SessionKind::Image(view),
        }
    }

    pub fn video(player: SharedPlayer, view: ViewId, scratch: Option<PathBuf>) -> Self {
        Self {
            kind: SessionKind::Video {
                player,
                view,
                scratch,
            },
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self.kind, SessionKind::Video { .. })
    }

    pub fn player(&self) -> Option<&SharedPlayer> {
        match &self.kind {
            SessionKind::Video { player, .. } => Some(player),
            SessionKind::Image(_) => None,
        }
    }

    pub fn scratch(&self) -> Option<&Path> {
        match &self.kind {
            SessionKind::Video { scratch, .. } => scratch.as_deref(),
            SessionKind::Image(_) => None,
        }
    }

    /// Whether this session renders the same player as `other`
    pub fn shares_player_with(&self, other: &PlaybackSession) -> bool {
        match (self.player(), other.player()) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether the player also renders into another display's window
    pub fn is_shared(&self) -> bool {
        self.player().is_some_and(|player| player.borrow().view_count() > 1)
    }

    pub fn set_stretch(&mut self, stretch: bool) -> Result<()> {
        match &mut self.kind {
            SessionKind::Image(view) => view.set_stretch(stretch),
            SessionKind::Video { player, view, .. } => player.borrow_mut().set_stretch(*view, stretch),
        }
    }

    /// No-op for images
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        match self.player() {
            Some(player) => player.borrow_mut().set_volume(volume),
            None => Ok(()),
        }
    }

    pub fn volume(&self) -> Option<f32> {
        self.player().map(|player| player.borrow().volume())
    }

    pub fn play(&self) -> Result<()> {
        match self.player() {
            Some(player) => player.borrow_mut().play(),
            None => Ok(()),
        }
    }

    pub fn pause(&self) -> Result<()> {
        match self.player() {
            Some(player) => player.borrow_mut().pause(),
            None => Ok(()),
        }
    }

    /// Images are never "playing"
    pub fn is_playing(&self) -> bool {
        self.player().is_some_and(|player| player.borrow().is_playing())
    }

    pub fn position(&self) -> Option<Duration> {
        self.player()?.borrow_mut().position()
    }

    pub fn seek(&self, position: Duration) -> Result<()> {
        match self.player() {
            Some(player) => player.borrow_mut().seek(position),
            None => Ok(()),
        }
    }

    /// Release this session's view; stops the player if nothing else uses it
    pub fn teardown(self) {
        match self.kind {
            SessionKind::Image(mut view) => view.close(),
            SessionKind::Video { player, view, .. } => {
                if let Err(e) = player.borrow_mut().detach(view) {
                    warn!(view = view.0, error = ?e, "Failed to detach player view");
                }
                if Rc::strong_count(&player) == 1 {
                    debug!("Last session of player gone, stopping it");
                    player.borrow_mut().stop();
                }
            }
        }
    }
}
