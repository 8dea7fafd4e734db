//! Application-wide constants
//!
//! Timing values, media tables and path names used across the daemon,
//! kept in one place so the manager and adapters agree on them.

/// Delays driving the control loop's timers
pub mod timing {
    use std::time::Duration;

    /// Coalescing window for display-configuration bursts
    pub const TOPOLOGY_DEBOUNCE: Duration = Duration::from_millis(300);

    /// Settle delay between a wake notification and resuming playback
    pub const WAKE_SETTLE: Duration = Duration::from_millis(500);

    /// Grace delay before auto-resuming a display restored by hot-plug
    pub const RESUME_GRACE: Duration = Duration::from_millis(100);

    /// Quiet period a volume value must hold before it is applied
    pub const VOLUME_DEBOUNCE: Duration = Duration::from_millis(100);

    /// Minimum volume difference worth pushing to a player
    pub const VOLUME_EPSILON: f32 = 0.01;
}

/// Bookmark persistence
pub mod bookmark {
    /// Records older than this are treated as absent and purged
    pub const HORIZON_SECS: i64 = 24 * 60 * 60;

    /// Volume assumed when a video bookmark carries none
    pub const DEFAULT_VOLUME: f32 = 1.0;
}

/// Recognised media file extensions (lowercase, without the dot)
pub mod media {
    pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "mkv", "webm", "avi"];

    pub const IMAGE_EXTENSIONS: &[&str] = &[
        "jpg", "jpeg", "png", "heic", "bmp", "gif", "webp", "tif", "tiff",
    ];

    /// Bytes per gigabyte used for the oversized-video ceiling
    pub const BYTES_PER_GB: f64 = 1_073_741_824.0;
}

/// Occlusion sentinel sizing
pub mod sentinel {
    /// Default idle-pause sensitivity (0-100)
    pub const DEFAULT_SENSITIVITY: u8 = 40;

    pub const MAX_SENSITIVITY: u8 = 100;

    /// Sensitivity divisor: 100 maps to a sentinel half the display's size
    pub const SENSITIVITY_SCALE: f64 = 200.0;
}

/// Config, socket and scratch locations
pub mod paths {
    /// Directory name under the XDG config/runtime/temp dirs
    pub const APP_DIR: &str = "desktop-video";

    /// Persistent key-value store file name
    pub const STORE_FILENAME: &str = "state.json";

    /// IPC socket file name
    pub const SOCKET_FILENAME: &str = "daemon.sock";

    /// Scratch subdirectory under the system temp dir
    pub const SCRATCH_DIR: &str = "scratch";

    /// Prefix of every scratch file (`cached-<displayId>-<uuid>.<ext>`)
    pub const SCRATCH_PREFIX: &str = "cached";
}

/// mpv subprocess control
pub mod mpv {
    use std::time::Duration;

    pub const BINARY: &str = "mpv";

    /// JSON IPC over the socket handed to mpv as stdin
    pub const IPC_CLIENT: &str = "--input-ipc-client=fd://0";

    /// Read timeout for a single IPC reply
    pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

    /// Flags shared by every embedded view
    pub const COMMON_FLAGS: &[&str] = &[
        "--no-config",
        "--no-terminal",
        "--really-quiet",
        "--no-osc",
        "--no-osd-bar",
        "--osd-level=0",
        "--no-input-default-bindings",
        "--input-cursor=no",
        "--cursor-autohide=no",
        "--hwdec=auto-safe",
        "--idle=no",
    ];
}

/// X11 protocol constants
pub mod x11 {
    /// ARGB color depth used for transparent sentinel windows
    pub const ARGB_DEPTH: u8 = 32;

    /// Override redirect flag for unmanaged windows
    pub const OVERRIDE_REDIRECT: u32 = 1;

    /// WM_CLASS value set on every window we create
    pub const WM_CLASS: &[u8] = b"desktop-video\0desktop-video\0";

    /// RandR version providing GetMonitors
    pub const RANDR_MAJOR: u32 = 1;
    pub const RANDR_MINOR: u32 = 5;
}
