//! Daemon control thread
//!
//! Owns the [`WallpaperManager`] and multiplexes everything that can change
//! it: IPC requests, X11 events, signals, debounce timers and the completion
//! of video loads run on the blocking pool. All manager calls happen here, one
//! at a time.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::mpv::MpvBackend;
use crate::backend::x11::{spawn_event_pump, X11WindowSystem};
use crate::backend::{MediaBackend, PlatformEvent, WindowSystem};
use crate::cache::{Bytes, ScratchDir};
use crate::config::JsonFileStore;
use crate::ipc::{self, Subscriber, WallpaperRequest, WallpaperResponse, WallpaperServer};
use crate::manager::{LoadId, ShowTicket, WallpaperManager};
use crate::observers::SubscriptionId;
use crate::types::{DisplayId, DisplaySelector};

/// Everything the control thread reacts to
pub enum DaemonEvent {
    Request {
        request: WallpaperRequest,
        reply: oneshot::Sender<WallpaperResponse>,
    },
    Subscribe(Subscriber),
    Platform(PlatformEvent),
    /// A video load finished on the blocking pool
    Loaded { id: LoadId, result: Result<Bytes> },
    ContentChanged(DisplayId),
    Shutdown,
}

pub struct Daemon<W: WindowSystem, M: MediaBackend> {
    manager: WallpaperManager<W, M>,
    events: mpsc::UnboundedSender<DaemonEvent>,
    observer: SubscriptionId,
    subscribers: Vec<Subscriber>,
    /// Show requests answered once their video load completes
    waiting: HashMap<ShowTicket, oneshot::Sender<WallpaperResponse>>,
}

impl<W: WindowSystem, M: MediaBackend> Daemon<W, M> {
    pub fn new(mut manager: WallpaperManager<W, M>, events: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        manager.defer_loads();
        let tx = events.clone();
        let observer = manager.subscribe(move |event| {
            let _ = tx.send(DaemonEvent::ContentChanged(event.display));
        });
        Self {
            manager,
            events,
            observer,
            subscribers: Vec::new(),
            waiting: HashMap::new(),
        }
    }

    /// Learn the displays and restore bookmarks; video loads start with [`Self::run`]
    pub fn start(&mut self) -> usize {
        self.manager.start()
    }

    /// Process events until shutdown, then release everything
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DaemonEvent>) {
        self.dispatch_loads();
        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.handle(event) {
                        break;
                    }
                }
                () = sleep_until(deadline) => {
                    self.manager.poll_timers(Instant::now());
                    self.broadcast_notices();
                    self.dispatch_loads();
                }
            }
        }
        self.manager.unsubscribe(self.observer);
        self.manager.shutdown();
    }

    /// Returns `false` once the daemon should stop
    fn handle(&mut self, event: DaemonEvent) -> bool {
        let running = self.handle_event(event);
        self.dispatch_loads();
        running
    }

    fn handle_event(&mut self, event: DaemonEvent) -> bool {
        match event {
            DaemonEvent::Request { request, reply } => return self.handle_request(request, reply),
            DaemonEvent::Subscribe(subscriber) => {
                debug!(subscribers = self.subscribers.len() + 1, "Client subscribed");
                self.subscribers.push(subscriber);
            }
            DaemonEvent::Platform(event) => {
                self.manager.handle_platform_event(event, Instant::now());
                self.broadcast_notices();
            }
            DaemonEvent::Loaded { id, result } => self.on_loaded(id, result),
            DaemonEvent::ContentChanged(display) => {
                self.broadcast(&WallpaperResponse::ContentChanged { display });
            }
            DaemonEvent::Shutdown => {
                info!("Shutdown signal received");
                return false;
            }
        }
        true
    }

    fn handle_request(&mut self, request: WallpaperRequest, reply: oneshot::Sender<WallpaperResponse>) -> bool {
        debug!(?request, "IPC request");
        let now = Instant::now();
        let response = match request {
            WallpaperRequest::Show {
                display,
                path,
                stretch,
                volume,
            } => {
                let id = match self.target(&display) {
                    Ok(id) => id,
                    Err(error) => {
                        let _ = reply.send(error);
                        return true;
                    }
                };
                let before = self.manager.pending_show(id);
                let shown = self.manager.show(id, &path, stretch, volume);
                match self.manager.pending_show(id) {
                    Some(ticket) if shown && Some(ticket) != before => {
                        debug!(display = %id, "Show waits for its video load");
                        self.waiting.insert(ticket, reply);
                        return true;
                    }
                    _ => WallpaperResponse::done(shown),
                }
            }
            WallpaperRequest::Clear(display) => {
                // Clearing is safe for displays that already went away
                let id = match display {
                    DisplaySelector::Id(id) => Ok(id),
                    other => self.target(&other),
                };
                match id {
                    Ok(id) => WallpaperResponse::done(self.manager.clear(id)),
                    Err(error) => error,
                }
            }
            WallpaperRequest::SetStretch { display, stretch } => {
                self.on_display(&display, |m, id| m.set_stretch(id, stretch))
            }
            WallpaperRequest::SetVolume {
                display,
                volume,
                debounce,
            } => self.on_display(&display, |m, id| {
                if debounce {
                    m.request_volume(id, volume, now);
                    true
                } else {
                    m.set_volume(id, volume)
                }
            }),
            WallpaperRequest::Sync {
                source,
                destination,
            } => match (self.target(&source), self.target(&destination)) {
                (Ok(source), Ok(destination)) => {
                    WallpaperResponse::done(self.manager.sync_window(destination, source))
                }
                (Err(error), _) | (_, Err(error)) => error,
            },
            WallpaperRequest::SyncAll(source) => {
                self.on_display(&source, |m, id| m.sync_all(id, now) > 0)
            }
            WallpaperRequest::MuteAll => {
                self.manager.mute_all();
                WallpaperResponse::done(true)
            }
            WallpaperRequest::RestoreAll => {
                self.manager.restore_all();
                WallpaperResponse::done(true)
            }
            WallpaperRequest::RestoreContent(display) => {
                self.on_display(&display, |m, id| m.restore_content(id))
            }
            WallpaperRequest::RestoreBookmarks => {
                WallpaperResponse::done(self.manager.restore_from_bookmark() > 0)
            }
            WallpaperRequest::Sleep => {
                self.manager.on_sleep(now);
                WallpaperResponse::done(true)
            }
            WallpaperRequest::Wake => {
                self.manager.on_wake(now);
                WallpaperResponse::done(true)
            }
            WallpaperRequest::SetSettings(update) => {
                WallpaperResponse::done(self.manager.apply_settings(&update))
            }
            WallpaperRequest::Status => WallpaperResponse::Status(self.manager.status()),
            WallpaperRequest::Subscribe => {
                WallpaperResponse::Error("Subscribe is handled by the connection".into())
            }
            WallpaperRequest::Ping => WallpaperResponse::Pong,
            WallpaperRequest::Shutdown => {
                info!("Received shutdown request via IPC");
                let _ = reply.send(WallpaperResponse::done(true));
                return false;
            }
        };
        let response = self.attach_notices(response);
        let _ = reply.send(response);
        true
    }

    fn target(&self, selector: &DisplaySelector) -> Result<DisplayId, WallpaperResponse> {
        self.manager
            .resolve(selector)
            .ok_or_else(|| WallpaperResponse::Error(format!("No connected display matches '{selector}'")))
    }

    fn on_display(
        &mut self,
        selector: &DisplaySelector,
        op: impl FnOnce(&mut WallpaperManager<W, M>, DisplayId) -> bool,
    ) -> WallpaperResponse {
        match self.target(selector) {
            Ok(id) => WallpaperResponse::done(op(&mut self.manager, id)),
            Err(error) => error,
        }
    }

    /// Run queued video loads on the blocking pool
    fn dispatch_loads(&mut self) {
        for load in self.manager.take_loads() {
            debug!(path = %load.source.display(), "Starting video load");
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || {
                let result = load.run();
                let _ = events.send(DaemonEvent::Loaded { id: load.id, result });
            });
        }
    }

    fn on_loaded(&mut self, id: LoadId, result: Result<Bytes>) {
        for (ticket, shown) in self.manager.complete_load(id, result) {
            let Some(reply) = self.waiting.remove(&ticket) else {
                continue;
            };
            let response = self.attach_notices(WallpaperResponse::done(shown));
            let _ = reply.send(response);
        }
        self.broadcast_notices();
    }

    /// Hand pending notices to the caller and to every subscriber
    fn attach_notices(&mut self, response: WallpaperResponse) -> WallpaperResponse {
        let notices = self.broadcast_notices();
        match response {
            WallpaperResponse::Done { changed, mut warnings } => {
                warnings.extend(notices);
                WallpaperResponse::Done { changed, warnings }
            }
            other => other,
        }
    }

    fn broadcast_notices(&mut self) -> Vec<String> {
        let notices: Vec<String> = self
            .manager
            .take_notices()
            .iter()
            .map(ToString::to_string)
            .collect();
        for notice in &notices {
            self.broadcast(&WallpaperResponse::Warning(notice.clone()));
        }
        notices
    }

    fn broadcast(&mut self, event: &WallpaperResponse) {
        self.subscribers.retain_mut(|subscriber| match subscriber.push(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = ?e, "Dropping subscriber");
                false
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn spawn_signal_listener(events: mpsc::UnboundedSender<DaemonEvent>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received termination signal");
            let _ = events.send(DaemonEvent::Shutdown);
        }
    });
    Ok(())
}

/// Run the daemon until a shutdown request or signal
pub fn run() -> Result<()> {
    // Bind first so a second daemon fails before touching any window
    let server = WallpaperServer::bind()?;

    let ws = X11WindowSystem::connect()?;
    let conn = ws.connection();
    let media = MpvBackend::new();
    let store = JsonFileStore::open(JsonFileStore::default_path());
    info!(path = %store.path().display(), "Using state file");
    let scratch = ScratchDir::new(ScratchDir::default_root());

    let manager = WallpaperManager::new(ws, media, Box::new(store), scratch);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut daemon = Daemon::new(manager, tx.clone());
    daemon.start();

    let _ipc = ipc::spawn_ipc_listener(server, tx.clone());
    let pump_tx = tx.clone();
    let _pump = spawn_event_pump(conn, move |event| pump_tx.send(DaemonEvent::Platform(event)).is_ok());
    #[cfg(unix)]
    spawn_signal_listener(tx.clone())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to build async runtime")?;

    info!("Daemon running");
    runtime.block_on(daemon.run(rx));
    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeMedia, FakeWindowSystem, MediaState, WindowState};
    use crate::config::store::MemoryStore;
    use crate::manager::test_support::display;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct Harness {
        daemon: Daemon<FakeWindowSystem, FakeMedia>,
        rx: mpsc::UnboundedReceiver<DaemonEvent>,
        windows: Rc<RefCell<WindowState>>,
        media: Rc<RefCell<MediaState>>,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (ws, windows) = FakeWindowSystem::new(vec![display(1), display(2)]);
        let (media, media_state) = FakeMedia::new();
        let scratch = ScratchDir::new(dir.path().join("scratch"));
        let manager = WallpaperManager::new(ws, media, Box::new(MemoryStore::new()), scratch);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut daemon = Daemon::new(manager, tx);
        daemon.start();
        Harness {
            daemon,
            rx,
            windows,
            media: media_state,
            dir,
        }
    }

    impl Harness {
        fn file(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, b"media bytes").unwrap();
            path
        }

        fn request(&mut self, request: WallpaperRequest) -> (bool, oneshot::Receiver<WallpaperResponse>) {
            let (reply, rx) = oneshot::channel();
            let running = self.daemon.handle(DaemonEvent::Request { request, reply });
            (running, rx)
        }

        fn ask(&mut self, request: WallpaperRequest) -> WallpaperResponse {
            let (_, mut rx) = self.request(request);
            rx.try_recv().unwrap()
        }

        /// Wait for the next finished video load and hand it to the daemon
        async fn finish_load(&mut self) {
            loop {
                let event = self.rx.recv().await.unwrap();
                let loaded = matches!(event, DaemonEvent::Loaded { .. });
                self.daemon.handle(event);
                if loaded {
                    return;
                }
            }
        }

        fn scratch_files(&self, display: u32) -> Vec<PathBuf> {
            ScratchDir::new(self.dir.path().join("scratch")).files_for(DisplayId(display))
        }
    }

    fn show(display: u32, path: PathBuf) -> WallpaperRequest {
        WallpaperRequest::Show {
            display: DisplaySelector::Id(DisplayId(display)),
            path,
            stretch: false,
            volume: None,
        }
    }

    #[test]
    fn test_image_show_answers_immediately() {
        let mut h = harness();
        let image = h.file("still.png");
        assert_eq!(h.ask(show(1, image)), WallpaperResponse::done(true));
        assert_eq!(h.media.borrow().open_images().len(), 1);
    }

    #[test]
    fn test_unknown_display_is_an_error() {
        let mut h = harness();
        let image = h.file("still.png");
        let response = h.ask(show(9, image));
        assert!(matches!(response, WallpaperResponse::Error(ref msg) if msg.contains("'9'")));
    }

    #[test]
    fn test_clear_accepts_absent_display_id() {
        let mut h = harness();
        let response = h.ask(WallpaperRequest::Clear(DisplaySelector::Id(DisplayId(42))));
        assert!(matches!(response, WallpaperResponse::Done { .. }));
    }

    #[tokio::test]
    async fn test_video_show_answers_after_load() {
        let mut h = harness();
        let video = h.file("loop.mp4");
        let (running, mut reply) = h.request(show(1, video.clone()));
        assert!(running);
        assert!(reply.try_recv().is_err());
        assert!(h.media.borrow().live_players().is_empty());

        h.finish_load().await;

        assert_eq!(reply.await.unwrap(), WallpaperResponse::done(true));
        assert!(h.daemon.manager.is_cached(&video));
        assert_eq!(h.scratch_files(1).len(), 1);
        assert_eq!(h.media.borrow().live_players().len(), 1);
        assert!(h.daemon.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_shows_share_one_load() {
        let mut h = harness();
        let video = h.file("loop.mp4");
        let (_, first) = h.request(show(1, video.clone()));
        let (_, second) = h.request(show(2, video.clone()));
        assert_eq!(h.daemon.waiting.len(), 2);

        h.finish_load().await;
        assert_eq!(first.await.unwrap(), WallpaperResponse::done(true));
        assert_eq!(second.await.unwrap(), WallpaperResponse::done(true));
        assert!(h.daemon.waiting.is_empty());

        let media = h.media.borrow();
        let players = media.live_players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].views.len(), 2);
    }

    #[tokio::test]
    async fn test_display_lost_during_load_keeps_nothing() {
        let mut h = harness();
        let video = h.file("loop.mp4");
        let (_, reply) = h.request(show(2, video.clone()));

        h.windows.borrow_mut().displays = vec![display(1)];
        h.daemon.manager.reconcile(Instant::now());
        h.finish_load().await;

        assert_eq!(reply.await.unwrap(), WallpaperResponse::done(false));
        assert!(!h.daemon.manager.is_cached(&video));
        assert!(h.scratch_files(2).is_empty());
        assert!(h.media.borrow().live_players().is_empty());
    }

    #[tokio::test]
    async fn test_newer_show_answers_stale_one_unchanged() {
        let mut h = harness();
        let video = h.file("loop.mp4");
        let image = h.file("still.png");
        let (_, stale) = h.request(show(1, video.clone()));
        assert_eq!(h.ask(show(1, image)), WallpaperResponse::done(true));

        h.finish_load().await;

        assert_eq!(stale.await.unwrap(), WallpaperResponse::done(false));
        assert!(!h.daemon.manager.is_cached(&video));
        assert_eq!(h.media.borrow().open_images().len(), 1);
    }

    #[test]
    fn test_content_changes_reach_subscribers() {
        let mut h = harness();
        let (daemon_end, mut client_end) = UnixStream::pair().unwrap();
        h.daemon.handle(DaemonEvent::Subscribe(Subscriber::new(daemon_end)));

        let image = h.file("still.png");
        h.ask(show(2, image));
        while let Ok(event) = h.rx.try_recv() {
            h.daemon.handle(event);
        }

        let pushed: WallpaperResponse = ipc::read_message(&mut client_end).unwrap();
        assert_eq!(pushed, WallpaperResponse::ContentChanged { display: DisplayId(2) });
    }

    #[test]
    fn test_dead_subscriber_is_dropped() {
        let mut h = harness();
        let (daemon_end, client_end) = UnixStream::pair().unwrap();
        h.daemon.handle(DaemonEvent::Subscribe(Subscriber::new(daemon_end)));
        drop(client_end);

        h.daemon.handle(DaemonEvent::ContentChanged(DisplayId(1)));
        assert!(h.daemon.subscribers.is_empty());
    }

    #[test]
    fn test_shutdown_stops_the_loop() {
        let mut h = harness();
        let (running, mut reply) = h.request(WallpaperRequest::Shutdown);
        assert!(!running);
        assert_eq!(reply.try_recv().unwrap(), WallpaperResponse::done(true));
        assert!(!h.daemon.handle(DaemonEvent::Shutdown));
    }

    #[test]
    fn test_status_lists_connected_displays() {
        let mut h = harness();
        let WallpaperResponse::Status(status) = h.ask(WallpaperRequest::Status) else {
            panic!("expected status");
        };
        let ids: Vec<_> = status.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![DisplayId(1), DisplayId(2)]);
    }
}
