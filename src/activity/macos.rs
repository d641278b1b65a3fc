//! Input activity probe for macOS using IOKit HIDIdleTime.

use core_foundation::base::TCFType;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use std::time::Duration;

use super::{InputCapability, InputProbe};

struct HidIdleProbe;

impl InputProbe for HidIdleProbe {
    fn name(&self) -> &'static str {
        "IOKit HIDIdleTime"
    }

    fn idle_time(&mut self) -> Option<Duration> {
        get_system_idle_time()
    }
}

pub(super) fn detect() -> InputCapability {
    match get_system_idle_time() {
        Some(_) => InputCapability::Available(Box::new(HidIdleProbe)),
        None => InputCapability::Unavailable("IOHIDSystem HIDIdleTime is not readable".to_string()),
    }
}

/// Time since the last HID event, as reported by IOKit.
fn get_system_idle_time() -> Option<Duration> {
    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOServiceGetMatchingService(
            main_port: u32,
            matching: core_foundation::base::CFTypeRef,
        ) -> u32;
        fn IOServiceMatching(name: *const std::os::raw::c_char) -> core_foundation::base::CFTypeRef;
        fn IORegistryEntryCreateCFProperty(
            entry: u32,
            key: core_foundation::string::CFStringRef,
            allocator: core_foundation::base::CFAllocatorRef,
            options: u32,
        ) -> core_foundation::base::CFTypeRef;
        fn IOObjectRelease(object: u32) -> i32;
    }

    unsafe {
        let service_name = std::ffi::CString::new("IOHIDSystem").ok()?;
        let matching = IOServiceMatching(service_name.as_ptr());
        if matching.is_null() {
            return None;
        }

        // Consumes `matching`.
        let service = IOServiceGetMatchingService(0, matching);
        if service == 0 {
            return None;
        }

        let key = CFString::new("HIDIdleTime");
        let property = IORegistryEntryCreateCFProperty(
            service,
            key.as_concrete_TypeRef(),
            std::ptr::null(),
            0,
        );

        IOObjectRelease(service);

        if property.is_null() {
            return None;
        }

        // Nanoseconds since the last input event.
        let cf_number: CFNumber = CFNumber::wrap_under_create_rule(property as *mut _);
        let nanoseconds: i64 = cf_number.to_i64()?;

        Some(Duration::from_nanos(nanoseconds.max(0) as u64))
    }
}
