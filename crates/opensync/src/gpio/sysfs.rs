//! [`GpioFacility`] for the Linux sysfs interface.

use std::io;

use opensync_linux::{PinDirection, SysfsGpio};

use super::{Direction, GpioFacility};

impl From<Direction> for PinDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::In => Self::In,
            Direction::Out => Self::Out,
        }
    }
}

impl GpioFacility for SysfsGpio {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn is_exported(&self, pin: u32) -> io::Result<bool> {
        Ok(SysfsGpio::is_exported(self, pin))
    }

    fn export(&self, pin: u32) -> io::Result<()> {
        SysfsGpio::export(self, pin)
    }

    fn direction(&self, pin: u32) -> io::Result<Direction> {
        Ok(match SysfsGpio::direction(self, pin)? {
            PinDirection::In => Direction::In,
            PinDirection::Out => Direction::Out,
        })
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> io::Result<()> {
        SysfsGpio::set_direction(self, pin, direction.into())
    }

    fn read_value(&self, pin: u32) -> io::Result<bool> {
        SysfsGpio::read_value(self, pin)
    }

    fn write_value(&self, pin: u32, high: bool) -> io::Result<()> {
        SysfsGpio::write_value(self, pin, high)
    }

    fn unexport(&self, pin: u32) -> io::Result<()> {
        SysfsGpio::unexport(self, pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{GpioBank, GpioLine};
    use std::sync::Arc;

    #[test]
    fn test_bank_over_fake_sysfs_tree() {
        let root = std::env::temp_dir().join(format!("opensync-sysfs-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let pin_dir = root.join("gpio18");
        std::fs::create_dir_all(&pin_dir).unwrap();
        std::fs::write(pin_dir.join("direction"), "in\n").unwrap();
        std::fs::write(pin_dir.join("value"), "0\n").unwrap();

        let bank = GpioBank::new(Arc::new(SysfsGpio::new(&root)));
        let line = GpioLine::new("host-alive", 18);
        bank.configure(&line, Direction::Out).unwrap();
        bank.write(&line, true).unwrap();

        assert_eq!(std::fs::read_to_string(pin_dir.join("direction")).unwrap(), "out");
        assert_eq!(std::fs::read_to_string(pin_dir.join("value")).unwrap(), "1");
        std::fs::remove_dir_all(root).unwrap();
    }
}
