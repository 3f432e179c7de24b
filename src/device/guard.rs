use crate::device::DeviceDriver;
use crate::error::Result;

/// Scoped "current device" switch with guaranteed restore.
///
/// Required around any driver call whose behavior depends on the current
/// device (handle export, handle import, async copies). Restores the prior
/// device on every exit path, including early returns through `?`.
pub struct DeviceGuard<'a> {
    driver: &'a dyn DeviceDriver,
    prev: i32,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, device: i32) -> Result<Self> {
        let prev = driver.current_device()?;
        driver.set_device(device)?;
        Ok(Self { driver, prev })
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.set_device(self.prev) {
            tracing::warn!(prev = self.prev, "failed to restore current device: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDriver;
    use crate::error::GpulinkError;

    #[test]
    fn test_restores_on_exit() {
        let driver = HostDriver::new(3);
        driver.set_device(1).unwrap();
        {
            let _guard = DeviceGuard::new(&driver, 2).unwrap();
            assert_eq!(driver.current_device().unwrap(), 2);
        }
        assert_eq!(driver.current_device().unwrap(), 1);
    }

    #[test]
    fn test_restores_on_error_path() {
        let driver = HostDriver::new(2);
        driver.set_device(1).unwrap();
        let failing = || -> Result<()> {
            let _guard = DeviceGuard::new(&driver, 0)?;
            Err(GpulinkError::device("synthetic"))
        };
        assert!(failing().is_err());
        assert_eq!(driver.current_device().unwrap(), 1);
    }

    #[test]
    fn test_invalid_device_rejected() {
        let driver = HostDriver::new(1);
        assert!(DeviceGuard::new(&driver, 5).is_err());
        assert_eq!(driver.current_device().unwrap(), 0);
    }
}
