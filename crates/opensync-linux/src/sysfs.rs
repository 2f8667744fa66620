//! Sysfs GPIO access.
//!
//! Every operation is a small read or write against the attribute files
//! below the GPIO class directory:
//!
//! ```text
//! /sys/class/gpio/export          write "<pin>" to create gpio<pin>/
//! /sys/class/gpio/unexport        write "<pin>" to remove it
//! /sys/class/gpio/gpio<pin>/direction   "in" | "out"
//! /sys/class/gpio/gpio<pin>/value       "0" | "1"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Default location of the GPIO class directory.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

/// How long to wait for the kernel (and udev) to publish `gpio<pin>/` after an export.
const DEFAULT_EXPORT_SETTLE: Duration = Duration::from_millis(500);

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Direction of a sysfs GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// Input (high impedance).
    In,
    /// Output.
    Out,
}

impl PinDirection {
    fn as_sysfs(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    fn parse(raw: &str) -> io::Result<Self> {
        match raw.trim() {
            "in" => Ok(Self::In),
            // "high" and "low" are write-only aliases, but some drivers echo them back.
            "out" | "high" | "low" => Ok(Self::Out),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected direction {other:?}"),
            )),
        }
    }
}

/// Handle to the sysfs GPIO class directory.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
    export_settle: Duration,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsGpio {
    /// Create a handle rooted at the given class directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            export_settle: DEFAULT_EXPORT_SETTLE,
        }
    }

    /// Override how long [`SysfsGpio::export`] waits for the pin directory to appear.
    #[must_use]
    pub fn with_export_settle(mut self, settle: Duration) -> Self {
        self.export_settle = settle;
        self
    }

    /// The class directory this handle operates on.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the class directory exists at all.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    /// Whether `gpio<pin>/` currently exists.
    #[must_use]
    pub fn is_exported(&self, pin: u32) -> bool {
        self.pin_dir(pin).is_dir()
    }

    /// Export a pin and wait for its attribute directory to appear.
    ///
    /// # Errors
    ///
    /// Returns an error if the export file cannot be written or the pin
    /// directory does not show up within the settle window.
    pub fn export(&self, pin: u32) -> io::Result<()> {
        if !self.is_available() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", self.root.display()),
            ));
        }
        debug!(pin, "exporting GPIO");
        fs::write(self.root.join("export"), pin.to_string())?;

        let deadline = Instant::now() + self.export_settle;
        while !self.is_exported(pin) {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("gpio{pin} did not appear after export"),
                ));
            }
            thread::sleep(SETTLE_POLL);
        }
        Ok(())
    }

    /// Unexport a pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the unexport file cannot be written.
    pub fn unexport(&self, pin: u32) -> io::Result<()> {
        debug!(pin, "unexporting GPIO");
        fs::write(self.root.join("unexport"), pin.to_string())
    }

    /// Read the configured direction of an exported pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the direction attribute cannot be read or parsed.
    pub fn direction(&self, pin: u32) -> io::Result<PinDirection> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("direction"))?;
        PinDirection::parse(&raw)
    }

    /// Set the direction of an exported pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the direction attribute cannot be written.
    pub fn set_direction(&self, pin: u32, direction: PinDirection) -> io::Result<()> {
        debug!(pin, direction = direction.as_sysfs(), "setting GPIO direction");
        fs::write(self.pin_dir(pin).join("direction"), direction.as_sysfs())
    }

    /// Read the current value of an exported pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the value attribute cannot be read or holds garbage.
    pub fn read_value(&self, pin: u32) -> io::Result<bool> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("value"))?;
        trace!(pin, value = raw.trim(), "read GPIO");
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected value {other:?} on gpio{pin}"),
            )),
        }
    }

    /// Drive an exported output pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the value attribute cannot be written.
    pub fn write_value(&self, pin: u32, high: bool) -> io::Result<()> {
        trace!(pin, high, "write GPIO");
        fs::write(self.pin_dir(pin).join("value"), if high { "1" } else { "0" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a fake class directory with the given pins already exported.
    fn fake_root(name: &str, pins: &[u32]) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "opensync-linux-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        for pin in pins {
            let dir = root.join(format!("gpio{pin}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("direction"), "in\n").unwrap();
            fs::write(dir.join("value"), "0\n").unwrap();
        }
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_is_exported() {
        let root = fake_root("exported", &[17]);
        let gpio = SysfsGpio::new(&root);

        assert!(gpio.is_available());
        assert!(gpio.is_exported(17));
        assert!(!gpio.is_exported(27));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_direction_roundtrip() {
        let root = fake_root("direction", &[18]);
        let gpio = SysfsGpio::new(&root);

        assert_eq!(gpio.direction(18).unwrap(), PinDirection::In);
        gpio.set_direction(18, PinDirection::Out).unwrap();
        assert_eq!(gpio.direction(18).unwrap(), PinDirection::Out);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_value_read_write() {
        let root = fake_root("value", &[18]);
        let gpio = SysfsGpio::new(&root);

        assert!(!gpio.read_value(18).unwrap());
        gpio.write_value(18, true).unwrap();
        assert!(gpio.read_value(18).unwrap());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_read_garbage_value() {
        let root = fake_root("garbage", &[17]);
        fs::write(root.join("gpio17").join("value"), "x").unwrap();
        let gpio = SysfsGpio::new(&root);

        let err = gpio.read_value(17).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_export_times_out_without_kernel() {
        let root = fake_root("export", &[]);
        let gpio = SysfsGpio::new(&root).with_export_settle(Duration::from_millis(20));

        let err = gpio.export(22).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(fs::read_to_string(root.join("export")).unwrap(), "22");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_export_missing_root() {
        let gpio = SysfsGpio::new("/nonexistent/gpio/root");
        assert!(!gpio.is_available());
        let err = gpio.export(17).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_parse_direction_aliases() {
        assert_eq!(PinDirection::parse("out\n").unwrap(), PinDirection::Out);
        assert_eq!(PinDirection::parse("high").unwrap(), PinDirection::Out);
        assert!(PinDirection::parse("sideways").is_err());
    }
}
