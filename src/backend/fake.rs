//! In-memory window system and media backend for tests
//!
//! Both fakes hand back a shared state handle so tests can inspect what the
//! manager did and inject failures.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use super::{ImageView, MediaBackend, Player, ViewId, WindowSystem};
use crate::types::{Display, DisplayId, Rect, WindowHandle};

#[derive(Debug, Default)]
pub struct WindowState {
    pub displays: Vec<Display>,
    next_window: u32,
    pub content_windows: HashMap<WindowHandle, DisplayId>,
    pub sentinel_rects: HashMap<WindowHandle, Rect>,
    pub sentinel_above: HashMap<WindowHandle, WindowHandle>,
    pub watched: HashMap<WindowHandle, DisplayId>,
    pub log: Vec<String>,
    pub fail_content: bool,
    pub fail_sentinel: bool,
}

impl WindowState {
    pub fn live_windows(&self) -> Vec<WindowHandle> {
        let mut windows: Vec<WindowHandle> = self
            .content_windows
            .keys()
            .chain(self.sentinel_rects.keys())
            .copied()
            .collect();
        windows.sort_by_key(|w| w.0);
        windows
    }

    pub fn content_window_for(&self, display: DisplayId) -> Option<WindowHandle> {
        self.content_windows
            .iter()
            .find(|(_, id)| **id == display)
            .map(|(window, _)| *window)
    }

    pub fn sentinel_for(&self, display: DisplayId) -> Option<WindowHandle> {
        self.watched
            .iter()
            .find(|(_, id)| **id == display)
            .map(|(window, _)| *window)
    }
}

pub struct FakeWindowSystem {
    state: Rc<RefCell<WindowState>>,
}

impl FakeWindowSystem {
    pub fn new(displays: Vec<Display>) -> (Self, Rc<RefCell<WindowState>>) {
        let state = Rc::new(RefCell::new(WindowState {
            displays,
            next_window: 100,
            ..Default::default()
        }));
        (Self { state: state.clone() }, state)
    }
}

impl WindowSystem for FakeWindowSystem {
    fn displays(&mut self) -> Result<Vec<Display>> {
        Ok(self.state.borrow().displays.clone())
    }

    fn create_content_window(&mut self, display: &Display) -> Result<WindowHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_content {
            bail!("content window refused");
        }
        state.next_window += 1;
        let window = WindowHandle(state.next_window);
        state.content_windows.insert(window, display.id);
        state.log.push(format!("content {}", window.0));
        Ok(window)
    }

    fn create_sentinel_window(&mut self, rect: Rect, above: WindowHandle) -> Result<WindowHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_sentinel {
            bail!("sentinel window refused");
        }
        state.next_window += 1;
        let window = WindowHandle(state.next_window);
        state.sentinel_rects.insert(window, rect);
        state.sentinel_above.insert(window, above);
        state.log.push(format!("sentinel {}", window.0));
        Ok(window)
    }

    fn watch_occlusion(&mut self, sentinel: WindowHandle, display: DisplayId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.watched.insert(sentinel, display);
        state.log.push(format!("watch {}", sentinel.0));
        Ok(())
    }

    fn unwatch_occlusion(&mut self, sentinel: WindowHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.watched.remove(&sentinel);
        state.log.push(format!("unwatch {}", sentinel.0));
        Ok(())
    }

    fn destroy_window(&mut self, window: WindowHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.content_windows.remove(&window);
        state.sentinel_rects.remove(&window);
        state.sentinel_above.remove(&window);
        state.log.push(format!("destroy {}", window.0));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub window: WindowHandle,
    pub stretch: bool,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub path: PathBuf,
    pub volume: f32,
    pub playing: bool,
    pub position: Duration,
    pub views: HashMap<ViewId, (WindowHandle, bool)>,
    pub stopped: bool,
}

#[derive(Debug, Default)]
pub struct MediaState {
    pub images: Vec<ImageRecord>,
    pub players: Vec<PlayerRecord>,
    next_view: u32,
    /// Images that fail to decode
    pub undecodable: HashSet<PathBuf>,
    /// Refuse to open any player
    pub refuse_players: bool,
}

impl MediaState {
    pub fn stopped_players(&self) -> usize {
        self.players.iter().filter(|p| p.stopped).count()
    }

    pub fn live_players(&self) -> Vec<&PlayerRecord> {
        self.players.iter().filter(|p| !p.stopped).collect()
    }

    pub fn open_images(&self) -> Vec<&ImageRecord> {
        self.images.iter().filter(|i| !i.closed).collect()
    }

    /// The live player rendering into `window`
    pub fn player_in(&self, window: WindowHandle) -> Option<&PlayerRecord> {
        self.players
            .iter()
            .filter(|p| !p.stopped)
            .find(|p| p.views.values().any(|(w, _)| *w == window))
    }

    pub fn player_in_mut(&mut self, window: WindowHandle) -> Option<&mut PlayerRecord> {
        self.players
            .iter_mut()
            .filter(|p| !p.stopped)
            .find(|p| p.views.values().any(|(w, _)| *w == window))
    }

    pub fn image_in(&self, window: WindowHandle) -> Option<&ImageRecord> {
        self.images.iter().find(|i| !i.closed && i.window == window)
    }
}

pub struct FakeMedia {
    state: Rc<RefCell<MediaState>>,
}

impl FakeMedia {
    pub fn new() -> (Self, Rc<RefCell<MediaState>>) {
        let state = Rc::new(RefCell::new(MediaState::default()));
        (Self { state: state.clone() }, state)
    }
}

impl MediaBackend for FakeMedia {
    fn load_image(
        &mut self,
        path: &Path,
        window: WindowHandle,
        stretch: bool,
    ) -> Result<Box<dyn ImageView>> {
        let mut state = self.state.borrow_mut();
        if state.undecodable.contains(path) {
            bail!("cannot decode {}", path.display());
        }
        state.images.push(ImageRecord {
            path: path.to_path_buf(),
            window,
            stretch,
            closed: false,
        });
        Ok(Box::new(FakeImageView {
            state: self.state.clone(),
            index: state.images.len() - 1,
        }))
    }

    fn open_player(&mut self, path: &Path, volume: f32) -> Result<Box<dyn Player>> {
        let mut state = self.state.borrow_mut();
        if state.refuse_players {
            bail!("cannot play {}", path.display());
        }
        state.players.push(PlayerRecord {
            path: path.to_path_buf(),
            volume,
            playing: true,
            position: Duration::ZERO,
            views: HashMap::new(),
            stopped: false,
        });
        Ok(Box::new(FakePlayer {
            state: self.state.clone(),
            index: state.players.len() - 1,
        }))
    }
}

struct FakeImageView {
    state: Rc<RefCell<MediaState>>,
    index: usize,
}

impl ImageView for FakeImageView {
    fn set_stretch(&mut self, stretch: bool) -> Result<()> {
        self.state.borrow_mut().images[self.index].stretch = stretch;
        Ok(())
    }

    fn close(&mut self) {
        self.state.borrow_mut().images[self.index].closed = true;
    }
}

struct FakePlayer {
    state: Rc<RefCell<MediaState>>,
    index: usize,
}

impl FakePlayer {
    fn with<T>(&self, f: impl FnOnce(&mut PlayerRecord) -> T) -> T {
        f(&mut self.state.borrow_mut().players[self.index])
    }
}

impl Player for FakePlayer {
    fn attach(&mut self, window: WindowHandle, stretch: bool) -> Result<ViewId> {
        let mut state = self.state.borrow_mut();
        state.next_view += 1;
        let view = ViewId(state.next_view);
        state.players[self.index].views.insert(view, (window, stretch));
        Ok(view)
    }

    fn detach(&mut self, view: ViewId) -> Result<()> {
        self.with(|p| p.views.remove(&view));
        Ok(())
    }

    fn view_count(&self) -> usize {
        self.with(|p| p.views.len())
    }

    fn set_stretch(&mut self, view: ViewId, stretch: bool) -> Result<()> {
        self.with(|p| {
            if let Some(entry) = p.views.get_mut(&view) {
                entry.1 = stretch;
            }
        });
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.with(|p| p.volume = volume);
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.with(|p| p.volume)
    }

    fn play(&mut self) -> Result<()> {
        self.with(|p| p.playing = true);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.with(|p| p.playing = false);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.with(|p| p.playing)
    }

    fn position(&mut self) -> Option<Duration> {
        Some(self.with(|p| p.position))
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.with(|p| p.position = position);
        Ok(())
    }

    fn stop(&mut self) {
        self.with(|p| {
            p.stopped = true;
            p.playing = false;
            p.views.clear();
        });
    }
}
