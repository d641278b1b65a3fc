//! Input activity probe for Windows using the GetLastInputInfo Win32 API.

use ::windows::Win32::System::SystemInformation::GetTickCount;
use ::windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};
use std::time::Duration;

use super::{InputCapability, InputProbe};

struct LastInputProbe;

impl InputProbe for LastInputProbe {
    fn name(&self) -> &'static str {
        "Windows GetLastInputInfo"
    }

    fn idle_time(&mut self) -> Option<Duration> {
        get_windows_idle_time()
    }
}

pub(super) fn detect() -> InputCapability {
    match get_windows_idle_time() {
        Some(_) => InputCapability::Available(Box::new(LastInputProbe)),
        None => InputCapability::Unavailable("GetLastInputInfo failed".to_string()),
    }
}

fn get_windows_idle_time() -> Option<Duration> {
    unsafe {
        let mut last_input = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };

        if GetLastInputInfo(&mut last_input).as_bool() {
            // Tick counts wrap every ~49.7 days.
            let idle_ms = GetTickCount().wrapping_sub(last_input.dwTime);
            Some(Duration::from_millis(idle_ms as u64))
        } else {
            None
        }
    }
}
