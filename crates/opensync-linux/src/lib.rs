//! Linux-specific implementation for opensync
//!
//! This crate provides access to the legacy sysfs GPIO interface
//! (`/sys/class/gpio`) used to talk to the UPS HAT on Raspberry Pi hosts.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod sysfs;

pub use sysfs::{PinDirection, SysfsGpio, DEFAULT_SYSFS_ROOT};

/// Initialize Linux-specific components
///
/// Verifies that the sysfs GPIO class directory is present. Hosts built
/// without `CONFIG_GPIO_SYSFS` cannot drive the UPS lines.
///
/// # Errors
///
/// Returns an error if the GPIO class directory is missing.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let gpio = SysfsGpio::default();
    if !gpio.is_available() {
        return Err(format!("{} is not available", gpio.root().display()).into());
    }
    tracing::info!(root = %gpio.root().display(), "sysfs GPIO available");
    Ok(())
}

/// Get platform name
#[must_use]
pub fn platform_name() -> &'static str {
    "Linux"
}
