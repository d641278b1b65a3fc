//! Input activity probe for Linux using the X11 XScreenSaver extension.

use anyhow::{Context, Result};
use std::time::Duration;
use x11rb::connection::Connection;
use x11rb::protocol::screensaver::ConnectionExt as ScreensaverConnectionExt;
use x11rb::protocol::xproto::Window;
use x11rb::rust_connection::RustConnection;

use super::{InputCapability, InputProbe};

/// Reads `ms_since_user_input` from the X server.
struct X11InputProbe {
    conn: RustConnection,
    root: Window,
}

impl X11InputProbe {
    fn connect() -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(None)
            .context("Failed to connect to X11 display. Is DISPLAY set?")?;

        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .context("X11 screen not found")?;

        // Test that XScreenSaver extension works
        conn.screensaver_query_info(root)
            .context("XScreenSaver extension not available")?
            .reply()
            .context("Failed to query XScreenSaver info")?;

        Ok(Self { conn, root })
    }
}

impl InputProbe for X11InputProbe {
    fn name(&self) -> &'static str {
        "X11 XScreenSaver"
    }

    fn idle_time(&mut self) -> Option<Duration> {
        let reply = self
            .conn
            .screensaver_query_info(self.root)
            .ok()?
            .reply()
            .ok()?;

        Some(Duration::from_millis(reply.ms_since_user_input as u64))
    }
}

pub(super) fn detect() -> InputCapability {
    match X11InputProbe::connect() {
        Ok(probe) => InputCapability::Available(Box::new(probe)),
        Err(e) => InputCapability::Unavailable(format!("{:#}", e)),
    }
}
