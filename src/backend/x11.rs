//! X11 window system
//!
//! Displays are RandR 1.5 monitors. Content windows are override-redirect
//! desktop-type windows kept at the bottom of the stack; sentinel windows are
//! transparent windows just above them whose visibility tells us whether the
//! desktop area they cover is hidden by something else.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::randr::{ConnectionExt as RandrExt, NotifyMask};
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;

use super::{PlatformEvent, WindowSystem};
use crate::constants::x11;
use crate::types::{Display, DisplayId, Rect, WindowHandle};

/// Pre-cached X11 atoms to avoid repeated roundtrips
pub struct CachedAtoms {
    pub wm_class: Atom,
    pub net_wm_window_type: Atom,
    pub net_wm_window_type_desktop: Atom,
    pub net_wm_state: Atom,
    pub net_wm_state_below: Atom,
    pub net_wm_state_skip_taskbar: Atom,
    pub net_wm_state_skip_pager: Atom,
}

fn intern(conn: &RustConnection, name: &str) -> Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())
        .context(format!("Failed to intern {} atom", name))?
        .reply()
        .context(format!("Failed to get reply for {} atom", name))?
        .atom)
}

impl CachedAtoms {
    pub fn new(conn: &RustConnection) -> Result<Self> {
        Ok(Self {
            wm_class: intern(conn, "WM_CLASS")?,
            net_wm_window_type: intern(conn, "_NET_WM_WINDOW_TYPE")?,
            net_wm_window_type_desktop: intern(conn, "_NET_WM_WINDOW_TYPE_DESKTOP")?,
            net_wm_state: intern(conn, "_NET_WM_STATE")?,
            net_wm_state_below: intern(conn, "_NET_WM_STATE_BELOW")?,
            net_wm_state_skip_taskbar: intern(conn, "_NET_WM_STATE_SKIP_TASKBAR")?,
            net_wm_state_skip_pager: intern(conn, "_NET_WM_STATE_SKIP_PAGER")?,
        })
    }
}

/// 32-bit TrueColor visual for transparent sentinel windows
#[derive(Debug, Clone, Copy)]
struct ArgbVisual {
    visual: Visualid,
    colormap: Colormap,
}

/// Stable display id from a connector name (32-bit FNV-1a)
pub fn display_id_for(name: &str) -> DisplayId {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    DisplayId(hash)
}

pub struct X11WindowSystem {
    conn: Arc<RustConnection>,
    root: Window,
    root_depth: u8,
    root_visual: Visualid,
    black_pixel: u32,
    screen_size: (u16, u16),
    atoms: CachedAtoms,
    argb: Option<ArgbVisual>,
    randr: bool,
    watched: HashMap<Window, DisplayId>,
}

impl X11WindowSystem {
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X11 server")?;
        let conn = Arc::new(conn);
        let screen = conn.setup().roots[screen_num].clone();
        info!(
            screen = screen_num,
            width = screen.width_in_pixels,
            height = screen.height_in_pixels,
            "Connected to X11 server"
        );

        let atoms = CachedAtoms::new(&conn).context("Failed to cache X11 atoms")?;
        let randr = Self::init_randr(&conn, screen.root);
        let argb = Self::find_argb_visual(&conn, &screen);
        if argb.is_none() {
            warn!("No 32-bit visual available, sentinel windows will not be truly transparent");
        }

        Ok(Self {
            conn,
            root: screen.root,
            root_depth: screen.root_depth,
            root_visual: screen.root_visual,
            black_pixel: screen.black_pixel,
            screen_size: (screen.width_in_pixels, screen.height_in_pixels),
            atoms,
            argb,
            randr,
            watched: HashMap::new(),
        })
    }

    /// Shared connection for the event pump thread
    pub fn connection(&self) -> Arc<RustConnection> {
        self.conn.clone()
    }

    fn init_randr(conn: &RustConnection, root: Window) -> bool {
        let version = conn
            .randr_query_version(x11::RANDR_MAJOR, x11::RANDR_MINOR)
            .map_err(anyhow::Error::from)
            .and_then(|cookie| cookie.reply().map_err(anyhow::Error::from));
        match version {
            Ok(version) if (version.major_version, version.minor_version) >= (x11::RANDR_MAJOR, x11::RANDR_MINOR) => {
                let mask = NotifyMask::SCREEN_CHANGE | NotifyMask::OUTPUT_CHANGE | NotifyMask::CRTC_CHANGE;
                if let Err(e) = conn.randr_select_input(root, mask) {
                    warn!(error = %e, "Failed to subscribe to RandR notifications");
                }
                debug!(
                    major = version.major_version,
                    minor = version.minor_version,
                    "RandR available"
                );
                true
            }
            Ok(version) => {
                warn!(
                    major = version.major_version,
                    minor = version.minor_version,
                    "RandR too old for monitor queries, treating the screen as one display"
                );
                false
            }
            Err(e) => {
                warn!(error = ?e, "RandR unavailable, treating the screen as one display");
                false
            }
        }
    }

    fn find_argb_visual(conn: &RustConnection, screen: &Screen) -> Option<ArgbVisual> {
        let visual = screen
            .allowed_depths
            .iter()
            .filter(|depth| depth.depth == x11::ARGB_DEPTH)
            .flat_map(|depth| depth.visuals.iter())
            .find(|visual| visual.class == VisualClass::TRUE_COLOR)?
            .visual_id;

        let colormap = conn.generate_id().ok()?;
        conn.create_colormap(ColormapAlloc::NONE, colormap, screen.root, visual)
            .ok()?;
        Some(ArgbVisual { visual, colormap })
    }

    fn monitors(&self) -> Result<Vec<Display>> {
        let reply = self
            .conn
            .randr_get_monitors(self.root, true)
            .context("Failed to query RandR monitors")?
            .reply()
            .context("Failed to get reply for RandR monitors")?;

        reply
            .monitors
            .iter()
            .map(|monitor| {
                let name = self
                    .conn
                    .get_atom_name(monitor.name)
                    .context("Failed to query monitor name")?
                    .reply()
                    .context("Failed to get reply for monitor name")?
                    .name;
                let name = String::from_utf8_lossy(&name).into_owned();
                Ok(Display {
                    id: display_id_for(&name),
                    frame: Rect::new(
                        monitor.x as i32,
                        monitor.y as i32,
                        monitor.width as u32,
                        monitor.height as u32,
                    ),
                    name,
                })
            })
            .collect()
    }

    fn whole_screen(&self) -> Display {
        let name = "screen-0".to_string();
        Display {
            id: display_id_for(&name),
            frame: Rect::new(0, 0, self.screen_size.0 as u32, self.screen_size.1 as u32),
            name,
        }
    }

    fn set_wm_class(&self, window: Window) -> Result<()> {
        self.conn
            .change_property8(
                PropMode::REPLACE,
                window,
                self.atoms.wm_class,
                AtomEnum::STRING,
                x11::WM_CLASS,
            )
            .context(format!("Failed to set WM_CLASS on window {}", window))?;
        Ok(())
    }
}

impl WindowSystem for X11WindowSystem {
    fn displays(&mut self) -> Result<Vec<Display>> {
        if self.randr {
            let monitors = self.monitors()?;
            if !monitors.is_empty() {
                return Ok(monitors);
            }
            debug!("RandR reported no monitors, using the whole screen");
        }
        Ok(vec![self.whole_screen()])
    }

    fn create_content_window(&mut self, display: &Display) -> Result<WindowHandle> {
        let window = self.conn.generate_id().context("Failed to generate X11 window ID")?;
        let frame = display.frame;
        self.conn
            .create_window(
                self.root_depth,
                window,
                self.root,
                frame.x as i16,
                frame.y as i16,
                frame.width as u16,
                frame.height as u16,
                0,
                WindowClass::INPUT_OUTPUT,
                self.root_visual,
                &CreateWindowAux::new()
                    .override_redirect(x11::OVERRIDE_REDIRECT)
                    .background_pixel(self.black_pixel),
            )
            .context(format!("Failed to create content window for display {}", display.id))?;

        self.set_wm_class(window)?;
        self.conn
            .change_property32(
                PropMode::REPLACE,
                window,
                self.atoms.net_wm_window_type,
                AtomEnum::ATOM,
                &[self.atoms.net_wm_window_type_desktop],
            )
            .context("Failed to set _NET_WM_WINDOW_TYPE")?;
        self.conn
            .change_property32(
                PropMode::REPLACE,
                window,
                self.atoms.net_wm_state,
                AtomEnum::ATOM,
                &[
                    self.atoms.net_wm_state_below,
                    self.atoms.net_wm_state_skip_taskbar,
                    self.atoms.net_wm_state_skip_pager,
                ],
            )
            .context("Failed to set _NET_WM_STATE")?;

        self.conn
            .map_window(window)
            .context(format!("Failed to map content window {}", window))?;
        self.conn
            .configure_window(window, &ConfigureWindowAux::new().stack_mode(StackMode::BELOW))
            .context(format!("Failed to lower content window {}", window))?;
        self.conn.flush().context("Failed to flush X11 connection")?;

        let id = display.id;
        debug!(window, display = %id, "Created content window");
        Ok(WindowHandle(window))
    }

    fn create_sentinel_window(&mut self, rect: Rect, above: WindowHandle) -> Result<WindowHandle> {
        let window = self.conn.generate_id().context("Failed to generate X11 window ID")?;

        let aux = CreateWindowAux::new()
            .override_redirect(x11::OVERRIDE_REDIRECT)
            .border_pixel(0);
        let (depth, visual, aux) = match self.argb {
            Some(argb) => (
                x11::ARGB_DEPTH,
                argb.visual,
                aux.background_pixel(0).colormap(argb.colormap),
            ),
            // Without an alpha channel, leave the window undrawn
            None => (self.root_depth, self.root_visual, aux.background_pixmap(x11rb::NONE)),
        };

        self.conn
            .create_window(
                depth,
                window,
                self.root,
                rect.x as i16,
                rect.y as i16,
                rect.width as u16,
                rect.height as u16,
                0,
                WindowClass::INPUT_OUTPUT,
                visual,
                &aux,
            )
            .context("Failed to create sentinel window")?;
        self.set_wm_class(window)?;

        self.conn
            .map_window(window)
            .context(format!("Failed to map sentinel window {}", window))?;
        self.conn
            .configure_window(
                window,
                &ConfigureWindowAux::new()
                    .sibling(above.0)
                    .stack_mode(StackMode::ABOVE),
            )
            .context(format!("Failed to stack sentinel window {}", window))?;
        self.conn.flush().context("Failed to flush X11 connection")?;

        debug!(window, above = above.0, "Created sentinel window");
        Ok(WindowHandle(window))
    }

    fn watch_occlusion(&mut self, sentinel: WindowHandle, display: DisplayId) -> Result<()> {
        self.conn
            .change_window_attributes(
                sentinel.0,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::VISIBILITY_CHANGE),
            )
            .context(format!("Failed to select visibility events on {}", sentinel.0))?;
        self.conn.flush().context("Failed to flush X11 connection")?;
        self.watched.insert(sentinel.0, display);
        Ok(())
    }

    fn unwatch_occlusion(&mut self, sentinel: WindowHandle) -> Result<()> {
        if self.watched.remove(&sentinel.0).is_none() {
            return Ok(());
        }
        self.conn
            .change_window_attributes(
                sentinel.0,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::NO_EVENT),
            )
            .context(format!("Failed to clear event mask on {}", sentinel.0))?;
        self.conn.flush().context("Failed to flush X11 connection")?;
        Ok(())
    }

    fn destroy_window(&mut self, window: WindowHandle) -> Result<()> {
        self.conn
            .destroy_window(window.0)
            .context(format!("Failed to destroy window {}", window.0))?;
        self.conn.flush().context("Failed to flush X11 connection")?;
        Ok(())
    }
}

fn translate(event: Event) -> Option<PlatformEvent> {
    match event {
        Event::RandrScreenChangeNotify(_) | Event::RandrNotify(_) => Some(PlatformEvent::TopologyChanged),
        Event::VisibilityNotify(event) => Some(PlatformEvent::Occlusion {
            sentinel: WindowHandle(event.window),
            covered: event.state == Visibility::FULLY_OBSCURED,
        }),
        _ => None,
    }
}

/// Block on the X connection and forward translated events until `sink`
/// returns `false` or the connection breaks
pub fn spawn_event_pump(
    conn: Arc<RustConnection>,
    mut sink: impl FnMut(PlatformEvent) -> bool + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            let event = match conn.wait_for_event() {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "X11 connection lost, event pump stopping");
                    break;
                }
            };
            if let Some(event) = translate(event)
                && !sink(event)
            {
                debug!("Event receiver gone, event pump stopping");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_id_is_stable_fnv1a() {
        assert_eq!(display_id_for(""), DisplayId(0x811c_9dc5));
        assert_eq!(display_id_for("a"), DisplayId(0xe40c_292c));
        assert_eq!(display_id_for("DP-1"), display_id_for("DP-1"));
        assert_ne!(display_id_for("DP-1"), display_id_for("DP-2"));
    }

    #[test]
    fn test_translate_visibility() {
        let event = VisibilityNotifyEvent {
            response_type: VISIBILITY_NOTIFY_EVENT,
            sequence: 0,
            window: 42,
            state: Visibility::FULLY_OBSCURED,
        };
        assert_eq!(
            translate(Event::VisibilityNotify(event)),
            Some(PlatformEvent::Occlusion {
                sentinel: WindowHandle(42),
                covered: true
            })
        );

        let event = VisibilityNotifyEvent {
            response_type: VISIBILITY_NOTIFY_EVENT,
            sequence: 0,
            window: 42,
            state: Visibility::PARTIALLY_OBSCURED,
        };
        assert_eq!(
            translate(Event::VisibilityNotify(event)),
            Some(PlatformEvent::Occlusion {
                sentinel: WindowHandle(42),
                covered: false
            })
        );
    }
}
