#![forbid(unsafe_code)]

mod backend;
mod bookmark;
mod cache;
mod config;
mod constants;
mod daemon;
mod ipc;
mod manager;
mod observers;
mod playback;
mod registry;
mod types;
mod window;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level as TraceLevel};
use tracing_subscriber::FmtSubscriber;

use config::SettingsUpdate;
use ipc::{WallpaperClient, WallpaperRequest, WallpaperResponse};
use types::DisplaySelector;

#[derive(Parser)]
#[command(name = "desktop-video", version, about = "Per-display image and video wallpapers for X11")]
struct Cli {
    /// trace, debug, info, warn or error (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the wallpaper daemon (default)
    Daemon,
    /// Show an image or looping video on a display
    Show {
        /// Display id or connector name (e.g. DP-1)
        display: DisplaySelector,
        path: PathBuf,
        /// Fill the display, ignoring aspect ratio
        #[arg(long)]
        stretch: bool,
        /// Video volume, 0.0 to 1.0
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Remove a display's wallpaper and forget it
    Clear { display: DisplaySelector },
    /// Change how the current wallpaper is scaled
    Stretch {
        display: DisplaySelector,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Change a video wallpaper's volume
    Volume {
        display: DisplaySelector,
        volume: f32,
        /// Coalesce rapid changes (for sliders)
        #[arg(long)]
        debounce: bool,
    },
    /// Copy one display's wallpaper onto another
    Sync {
        source: DisplaySelector,
        destination: DisplaySelector,
    },
    /// Copy one display's wallpaper onto every other display
    SyncAll { source: DisplaySelector },
    /// Mute every video wallpaper
    Mute,
    /// Undo `mute`
    Unmute,
    /// Rebuild a display's wallpaper from its current settings
    Restore { display: DisplaySelector },
    /// Rebuild every display from the saved bookmarks
    RestoreBookmarks,
    /// Pause playback before system sleep
    Sleep,
    /// Resume playback after system wake
    Wake,
    /// Change global settings
    Settings {
        #[arg(long)]
        auto_sync_new_screens: Option<bool>,
        /// 0 (largest sentinel) to 100 (smallest)
        #[arg(long)]
        idle_pause_sensitivity: Option<u8>,
        #[arg(long)]
        use_memory_cache: Option<bool>,
        #[arg(long)]
        max_video_file_size_gb: Option<f64>,
    },
    /// Print per-display state as JSON
    Status,
    /// Print content changes until interrupted
    Watch,
    /// Check that the daemon is running
    Ping,
    /// Stop the daemon
    Shutdown,
}

fn log_level(flag: Option<&str>) -> TraceLevel {
    let level = flag
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string())
        .to_lowercase();
    match level.as_str() {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    }
}

/// Turn a subcommand into the request the daemon understands
fn request_for(command: Cmd) -> Result<WallpaperRequest> {
    Ok(match command {
        Cmd::Daemon | Cmd::Watch => bail!("not a single request"),
        Cmd::Show {
            display,
            path,
            stretch,
            volume,
        } => WallpaperRequest::Show {
            display,
            // The daemon may run with a different working directory
            path: path
                .canonicalize()
                .context(format!("Cannot open {}", path.display()))?,
            stretch,
            volume,
        },
        Cmd::Clear { display } => WallpaperRequest::Clear(display),
        Cmd::Stretch { display, enabled } => WallpaperRequest::SetStretch {
            display,
            stretch: enabled,
        },
        Cmd::Volume {
            display,
            volume,
            debounce,
        } => WallpaperRequest::SetVolume {
            display,
            volume,
            debounce,
        },
        Cmd::Sync {
            source,
            destination,
        } => WallpaperRequest::Sync {
            source,
            destination,
        },
        Cmd::SyncAll { source } => WallpaperRequest::SyncAll(source),
        Cmd::Mute => WallpaperRequest::MuteAll,
        Cmd::Unmute => WallpaperRequest::RestoreAll,
        Cmd::Restore { display } => WallpaperRequest::RestoreContent(display),
        Cmd::RestoreBookmarks => WallpaperRequest::RestoreBookmarks,
        Cmd::Sleep => WallpaperRequest::Sleep,
        Cmd::Wake => WallpaperRequest::Wake,
        Cmd::Settings {
            auto_sync_new_screens,
            idle_pause_sensitivity,
            use_memory_cache,
            max_video_file_size_gb,
        } => {
            let update = SettingsUpdate {
                auto_sync_new_screens,
                idle_pause_sensitivity,
                use_memory_cache,
                max_video_file_size_gb,
                global_mute: None,
            };
            if update.is_empty() {
                bail!("No settings given");
            }
            WallpaperRequest::SetSettings(update)
        }
        Cmd::Status => WallpaperRequest::Status,
        Cmd::Ping => WallpaperRequest::Ping,
        Cmd::Shutdown => WallpaperRequest::Shutdown,
    })
}

fn print_response(response: WallpaperResponse) -> Result<()> {
    match response {
        WallpaperResponse::Done { changed, warnings } => {
            for warning in warnings {
                eprintln!("warning: {warning}");
            }
            if !changed {
                println!("nothing changed");
            }
        }
        WallpaperResponse::Status(displays) => {
            println!("{}", serde_json::to_string_pretty(&displays)?);
        }
        WallpaperResponse::Pong => println!("pong"),
        WallpaperResponse::Subscribed => {}
        WallpaperResponse::ContentChanged { display } => println!("changed {display}"),
        WallpaperResponse::Warning(warning) => eprintln!("warning: {warning}"),
        WallpaperResponse::Error(error) => bail!(error),
    }
    Ok(())
}

fn watch(client: &mut WallpaperClient) -> Result<()> {
    match client.request(WallpaperRequest::Subscribe)? {
        WallpaperResponse::Subscribed => {}
        other => bail!("Unexpected reply to subscribe: {other:?}"),
    }
    loop {
        print_response(client.recv_response()?)?;
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.log_level.as_deref()))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command.unwrap_or(Cmd::Daemon) {
        Cmd::Daemon => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting desktop-video daemon");
            daemon::run()?;
        }
        Cmd::Watch => {
            let mut client = WallpaperClient::connect()?;
            watch(&mut client)?;
        }
        command => {
            let request = request_for(command)?;
            let mut client = WallpaperClient::connect()?;
            print_response(client.request(request)?)?;
        }
    }
    Ok(())
}
