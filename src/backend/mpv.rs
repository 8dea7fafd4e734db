//! mpv media backend
//!
//! Every view is one mpv process embedded into a window with `--wid`. Its
//! JSON IPC runs over a socket pair handed to mpv as stdin, so a view is usable
//! the moment it is spawned: commands wait in the socket until mpv reads them.
//! A [`Player`] shared by several displays fans its commands out to all of its
//! views; only the first view is audible and new views start at its position.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ImageView, MediaBackend, Player, ViewId};
use crate::constants::mpv;
use crate::types::WindowHandle;

/// mpv's 0..=100 volume scale
fn mpv_volume(volume: f32) -> f64 {
    (volume.clamp(0.0, 1.0) as f64 * 100.0).round()
}

/// One running mpv process and its IPC connection
struct MpvProcess {
    child: Child,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_request: u64,
}

impl MpvProcess {
    fn spawn(window: WindowHandle, path: &Path, flags: &[String]) -> Result<Self> {
        let (ours, theirs) = UnixStream::pair().context("Failed to create mpv IPC socket pair")?;
        let child = Command::new(mpv::BINARY)
            .args(mpv::COMMON_FLAGS)
            .arg(format!("--wid={}", window.0))
            .arg(mpv::IPC_CLIENT)
            .args(flags)
            .arg("--")
            .arg(path)
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context(format!("Failed to spawn {}", mpv::BINARY))?;

        ours.set_read_timeout(Some(mpv::REPLY_TIMEOUT))
            .context("Failed to set mpv socket timeout")?;
        let reader = BufReader::new(ours.try_clone().context("Failed to clone mpv socket")?);

        debug!(pid = child.id(), window = window.0, path = %path.display(), "Spawned mpv");
        let mut process = Self {
            child,
            writer: ours,
            reader,
            next_request: 1,
        };
        // Only replies are wanted on this connection
        process.send(json!(["disable_event", "all"]))?;
        Ok(process)
    }

    fn write_command(&mut self, args: &Value) -> Result<u64> {
        let request_id = self.next_request;
        self.next_request += 1;

        let mut line = serde_json::to_vec(&json!({ "command": args, "request_id": request_id }))
            .context("Failed to serialize mpv command")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .context("Failed to write mpv command")?;
        Ok(request_id)
    }

    /// Queue a command without waiting for mpv to answer it
    fn send(&mut self, args: Value) -> Result<()> {
        self.drain_replies()?;
        self.write_command(&args)?;
        Ok(())
    }

    /// Consume replies to earlier [`Self::send`]s so the socket never fills up
    fn drain_replies(&mut self) -> Result<()> {
        self.writer
            .set_nonblocking(true)
            .context("Failed to poll mpv socket")?;
        let drained = self.read_available();
        self.writer
            .set_nonblocking(false)
            .context("Failed to restore mpv socket")?;
        drained
    }

    fn read_available(&mut self) -> Result<()> {
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.reader.read_line(&mut buf) {
                Ok(0) => bail!("mpv closed its IPC socket"),
                Ok(_) => {
                    if let Ok(reply) = serde_json::from_str::<Value>(&buf)
                        && reply.get("error").and_then(Value::as_str) != Some("success")
                    {
                        debug!(reply = %buf.trim(), "mpv rejected a queued command");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("Failed to read mpv replies"),
            }
        }
    }

    /// Send one command and wait for the reply carrying its request id
    fn command(&mut self, args: Value) -> Result<Value> {
        let request_id = self.write_command(&args)?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self
                .reader
                .read_line(&mut buf)
                .context("Failed to read mpv reply")?;
            if read == 0 {
                bail!("mpv closed its IPC socket");
            }
            let Ok(reply) = serde_json::from_str::<Value>(&buf) else {
                continue;
            };
            // Skip replies to queued commands
            if reply.get("request_id").and_then(Value::as_u64) != Some(request_id) {
                continue;
            }
            return match reply.get("error").and_then(Value::as_str) {
                Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
                Some(error) => Err(anyhow!("mpv rejected {}: {}", args, error)),
                None => Err(anyhow!("Malformed mpv reply: {}", buf.trim())),
            };
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> Result<()> {
        self.send(json!(["set_property", name, value]))
    }

    fn get_property(&mut self, name: &str) -> Result<Value> {
        self.command(json!(["get_property", name]))
    }
}

impl Drop for MpvProcess {
    fn drop(&mut self) {
        if let Err(e) = self.write_command(&json!(["quit"])) {
            debug!(error = %e, "mpv did not take quit");
        }
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "mpv already gone");
        }
        let _ = self.child.wait();
    }
}

#[derive(Debug, Default)]
pub struct MpvBackend;

impl MpvBackend {
    pub fn new() -> Self {
        info!(binary = mpv::BINARY, "mpv backend ready");
        Self
    }
}

/// Fully decode formats the image crate understands so corrupt files fail
/// before anything is shown; others are left to mpv
fn check_decodes(path: &Path) -> Result<()> {
    match image::ImageFormat::from_path(path) {
        Ok(format) if format.reading_enabled() => {
            let image = image::open(path).context(format!("Failed to decode {}", path.display()))?;
            debug!(width = image.width(), height = image.height(), "Image decoded");
            Ok(())
        }
        _ => {
            if !path.is_file() {
                bail!("{} is not a readable file", path.display());
            }
            debug!(path = %path.display(), "Format not decodable locally, deferring to mpv");
            Ok(())
        }
    }
}

impl MediaBackend for MpvBackend {
    fn load_image(
        &mut self,
        path: &Path,
        window: WindowHandle,
        stretch: bool,
    ) -> Result<Box<dyn ImageView>> {
        check_decodes(path)?;
        let flags = vec![
            "--image-display-duration=inf".to_string(),
            format!("--keepaspect={}", if stretch { "no" } else { "yes" }),
            "--mute=yes".to_string(),
        ];
        let process = MpvProcess::spawn(window, path, &flags)?;
        Ok(Box::new(MpvImage {
            process: Some(process),
        }))
    }

    fn open_player(&mut self, path: &Path, volume: f32) -> Result<Box<dyn Player>> {
        if !path.is_file() {
            bail!("{} is not a readable file", path.display());
        }
        Ok(Box::new(MpvPlayer {
            path: path.to_path_buf(),
            volume,
            playing: true,
            next_view: 0,
            views: Vec::new(),
        }))
    }
}

struct MpvImage {
    process: Option<MpvProcess>,
}

impl ImageView for MpvImage {
    fn set_stretch(&mut self, stretch: bool) -> Result<()> {
        let process = self.process.as_mut().context("Image view already closed")?;
        process.set_property("keepaspect", json!(!stretch))
    }

    fn close(&mut self) {
        self.process = None;
    }
}

struct MpvView {
    id: ViewId,
    process: MpvProcess,
}

struct MpvPlayer {
    path: PathBuf,
    volume: f32,
    playing: bool,
    next_view: u32,
    /// The first view is the primary: audible, and the position reference
    views: Vec<MpvView>,
}

impl MpvPlayer {
    fn for_each_view(&mut self, what: &str, mut f: impl FnMut(&mut MpvProcess) -> Result<()>) -> Result<()> {
        let mut failures = 0;
        for view in &mut self.views {
            if let Err(e) = f(&mut view.process) {
                warn!(view = view.id.0, error = ?e, "mpv {what} failed");
                failures += 1;
            }
        }
        if failures > 0 && failures == self.views.len() {
            bail!("mpv {what} failed on every view");
        }
        Ok(())
    }
}

impl Player for MpvPlayer {
    fn attach(&mut self, window: WindowHandle, stretch: bool) -> Result<ViewId> {
        let primary = self.views.is_empty();
        let start = if primary { None } else { self.position() };

        let mut flags = vec![
            "--loop-file=inf".to_string(),
            format!("--panscan={}", if stretch { "1.0" } else { "0.0" }),
            format!("--volume={}", if primary { mpv_volume(self.volume) } else { 0.0 }),
        ];
        if !primary {
            flags.push("--mute=yes".to_string());
        }
        if !self.playing {
            flags.push("--pause".to_string());
        }
        if let Some(start) = start {
            flags.push(format!("--start={:.3}", start.as_secs_f64()));
        }

        let process = MpvProcess::spawn(window, &self.path, &flags)?;
        self.next_view += 1;
        let id = ViewId(self.next_view);
        self.views.push(MpvView { id, process });
        debug!(view = id.0, primary, path = %self.path.display(), "Attached mpv view");
        Ok(id)
    }

    fn detach(&mut self, view: ViewId) -> Result<()> {
        let Some(index) = self.views.iter().position(|v| v.id == view) else {
            bail!("Unknown mpv view {}", view.0);
        };
        self.views.remove(index);

        // Promote the next view so the player stays audible
        if index == 0
            && let Some(primary) = self.views.first_mut()
        {
            primary.process.set_property("mute", json!(false))?;
            primary
                .process
                .set_property("volume", json!(mpv_volume(self.volume)))?;
        }
        Ok(())
    }

    fn view_count(&self) -> usize {
        self.views.len()
    }

    fn set_stretch(&mut self, view: ViewId, stretch: bool) -> Result<()> {
        let view = self
            .views
            .iter_mut()
            .find(|v| v.id == view)
            .context(format!("Unknown mpv view {}", view.0))?;
        view.process
            .set_property("panscan", json!(if stretch { 1.0 } else { 0.0 }))
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume;
        match self.views.first_mut() {
            Some(primary) => primary.process.set_property("volume", json!(mpv_volume(volume))),
            None => Ok(()),
        }
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn play(&mut self) -> Result<()> {
        self.playing = true;
        self.for_each_view("play", |p| p.set_property("pause", json!(false)))
    }

    fn pause(&mut self) -> Result<()> {
        self.playing = false;
        self.for_each_view("pause", |p| p.set_property("pause", json!(true)))
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn position(&mut self) -> Option<Duration> {
        let primary = self.views.first_mut()?;
        match primary.process.get_property("time-pos") {
            Ok(value) => value
                .as_f64()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
            Err(e) => {
                debug!(error = %e, "No playback position");
                None
            }
        }
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let secs = position.as_secs_f64();
        self.for_each_view("seek", |p| p.send(json!(["seek", secs, "absolute"])))
    }

    fn stop(&mut self) {
        if !self.views.is_empty() {
            debug!(views = self.views.len(), path = %self.path.display(), "Stopping mpv player");
        }
        self.views.clear();
        self.playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpv_volume_scale() {
        assert_eq!(mpv_volume(0.0), 0.0);
        assert_eq!(mpv_volume(0.5), 50.0);
        assert_eq!(mpv_volume(1.0), 100.0);
        assert_eq!(mpv_volume(3.0), 100.0);
    }

    #[test]
    fn test_corrupt_png_fails_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(check_decodes(&path).is_err());
    }

    #[test]
    fn test_valid_png_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        image::RgbImage::new(2, 2).save(&path).unwrap();
        assert!(check_decodes(&path).is_ok());
    }

    #[test]
    fn test_missing_video_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MpvBackend::new();
        assert!(backend.open_player(&dir.path().join("nope.mp4"), 1.0).is_err());
    }
}
