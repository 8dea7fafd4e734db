//! IPC listener thread for the daemon
//!
//! Accepts client connections and forwards their requests to the control
//! thread as [`DaemonEvent`]s. Each connection gets its own thread so a
//! subscriber waiting for pushes never blocks other clients.

use anyhow::{Context, Result};
use std::os::unix::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::daemon::DaemonEvent;
use crate::ipc::{WallpaperRequest, WallpaperResponse, WallpaperServer};

/// Write half of a subscribed client connection
pub struct Subscriber {
    stream: UnixStream,
}

impl Subscriber {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Push an unsolicited event; an error means the client went away
    pub fn push(&mut self, resp: &WallpaperResponse) -> Result<()> {
        crate::ipc::write_message(&mut self.stream, resp)
    }
}

/// Spawn IPC listener thread to handle client requests
pub fn spawn_ipc_listener(
    server: WallpaperServer,
    events: mpsc::UnboundedSender<DaemonEvent>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = run_ipc_loop(&server, &events) {
            error!(error = ?e, "IPC listener thread crashed");
        }
    })
}

fn run_ipc_loop(server: &WallpaperServer, events: &mpsc::UnboundedSender<DaemonEvent>) -> Result<()> {
    info!(socket = ?server.path(), "IPC listener started");

    loop {
        let stream = match server.accept() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = ?e, "Failed to accept client");
                continue;
            }
        };
        if events.is_closed() {
            debug!("Control thread gone, IPC listener stopping");
            return Ok(());
        }

        let events = events.clone();
        std::thread::Builder::new()
            .name("ipc-client".into())
            .spawn(move || {
                if let Err(e) = serve_client(stream, &events) {
                    debug!(error = ?e, "Client connection ended");
                }
            })
            .context("Failed to spawn client thread")?;
    }
}

fn serve_client(mut stream: UnixStream, events: &mpsc::UnboundedSender<DaemonEvent>) -> Result<()> {
    debug!("Client connected");

    loop {
        // A read error is the normal end of a connection
        let request: WallpaperRequest = match crate::ipc::read_message(&mut stream) {
            Ok(request) => request,
            Err(_) => {
                debug!("Client disconnected");
                return Ok(());
            }
        };

        if request == WallpaperRequest::Subscribe {
            crate::ipc::write_message(&mut stream, &WallpaperResponse::Subscribed)?;
            let subscriber = Subscriber::new(stream.try_clone().context("Failed to clone client stream")?);
            if events.send(DaemonEvent::Subscribe(subscriber)).is_err() {
                return Ok(());
            }
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if events
            .send(DaemonEvent::Request {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            crate::ipc::write_message(
                &mut stream,
                &WallpaperResponse::Error("Daemon is shutting down".into()),
            )?;
            return Ok(());
        }

        let response = reply_rx
            .blocking_recv()
            .unwrap_or_else(|_| WallpaperResponse::Error("Request dropped".into()));
        crate::ipc::write_message(&mut stream, &response)?;
    }
}
