//! Shared fixture for manager tests: fake backends, a real JSON store and
//! real media files in a temporary directory

use serde_json::json;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

use super::WallpaperManager;
use crate::backend::fake::{FakeMedia, FakeWindowSystem, MediaState, WindowState};
use crate::bookmark::{now_epoch_secs, BookmarkRecord};
use crate::cache::ScratchDir;
use crate::config::{JsonFileStore, SettingsUpdate};
use crate::types::{Display, DisplayId, Rect};

pub struct Fixture {
    pub manager: WallpaperManager<FakeWindowSystem, FakeMedia>,
    pub windows: Rc<RefCell<WindowState>>,
    pub media: Rc<RefCell<MediaState>>,
    dir: Rc<TempDir>,
    scratch: ScratchDir,
}

pub fn display(id: u32) -> Display {
    Display {
        id: DisplayId(id),
        frame: Rect::new(((id - 1) * 1920) as i32, 0, 1920, 1080),
        name: format!("DP-{id}"),
    }
}

impl Fixture {
    /// Displays `1..=count`, started with an empty store
    pub fn new(count: u32) -> Self {
        let dir = Rc::new(tempfile::tempdir().unwrap());
        let mut fixture = Self::build(dir, (1..=count).map(display).collect());
        fixture.manager.start();
        fixture
    }

    fn build(dir: Rc<TempDir>, displays: Vec<Display>) -> Self {
        let (ws, windows) = FakeWindowSystem::new(displays);
        let (media, media_state) = FakeMedia::new();
        let store = JsonFileStore::open(dir.path().join("config").join("state.json"));
        let scratch = ScratchDir::new(dir.path().join("scratch"));
        let manager = WallpaperManager::new(ws, media, Box::new(store), scratch.clone());
        Self {
            manager,
            windows,
            media: media_state,
            dir,
            scratch,
        }
    }

    /// A fresh manager over the same store and media, as after a process
    /// restart; not started yet
    pub fn restart(&self) -> Self {
        let displays = self.windows.borrow().displays.clone();
        Self::build(self.dir.clone(), displays)
    }

    pub fn media_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("media").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not really media, but enough bytes").unwrap();
        path
    }

    /// Change what the window system reports as connected
    pub fn connect(&self, ids: &[u32]) {
        self.windows.borrow_mut().displays = ids.iter().copied().map(display).collect();
    }

    pub fn disable_memory_cache(&mut self) {
        self.manager.apply_settings(&SettingsUpdate {
            use_memory_cache: Some(false),
            ..Default::default()
        });
    }

    pub fn record_events(&mut self) -> Rc<RefCell<Vec<DisplayId>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        self.manager
            .subscribe(move |event| sink.borrow_mut().push(event.display));
        events
    }

    pub fn scratch_files(&self, id: DisplayId) -> Vec<PathBuf> {
        self.scratch.files_for(id)
    }

    pub fn bookmarks_contain(&self, id: DisplayId) -> bool {
        self.manager.bookmarks.contains(id)
    }

    pub fn load_bookmark(&mut self, id: DisplayId) -> Option<BookmarkRecord> {
        self.manager.bookmarks.load(id)
    }

    /// Pretend the display's bookmark was saved `secs` ago
    pub fn age_bookmark(&mut self, id: DisplayId, secs: i64) {
        self.manager
            .bookmarks
            .store_mut()
            .set(&format!("savedAt-{id}"), json!(now_epoch_secs() - secs));
    }

    fn content_window(&self, id: DisplayId) -> crate::types::WindowHandle {
        self.manager.window_pair(id).unwrap().content
    }

    pub fn set_position(&self, id: DisplayId, position: Duration) {
        let window = self.content_window(id);
        self.media
            .borrow_mut()
            .player_in_mut(window)
            .unwrap()
            .position = position;
    }

    pub fn set_playing(&self, id: DisplayId, playing: bool) {
        let window = self.content_window(id);
        self.media
            .borrow_mut()
            .player_in_mut(window)
            .unwrap()
            .playing = playing;
    }

    pub fn position(&self, id: DisplayId) -> Option<Duration> {
        let window = self.manager.window_pair(id)?.content;
        self.media.borrow().player_in(window).map(|p| p.position)
    }

    pub fn player_volume(&self, id: DisplayId) -> Option<f32> {
        let window = self.manager.window_pair(id)?.content;
        self.media.borrow().player_in(window).map(|p| p.volume)
    }
}
