use crate::device::{DeviceDriver, RawDeviceEvent};
use crate::error::{GpulinkError, Result};

/// A GPU event owned by one operation.
///
/// Created events are recorded by their owner and waited on by either side;
/// imported events (opened from a peer's handle) may only be waited on.
/// Dropping an event after exporting its handle does not invalidate the
/// handle for importers.
pub struct DeviceEvent {
    raw: Box<dyn RawDeviceEvent>,
    imported: bool,
}

impl DeviceEvent {
    /// Create a fresh event on `device`.
    pub fn new(driver: &dyn DeviceDriver, device: i32, interprocess: bool) -> Result<Self> {
        Ok(Self {
            raw: driver.create_event(device, interprocess)?,
            imported: false,
        })
    }

    /// Open a foreign event from its exported handle bytes.
    pub fn from_handle(driver: &dyn DeviceDriver, device: i32, handle: &[u8]) -> Result<Self> {
        Ok(Self {
            raw: driver.import_event(device, handle)?,
            imported: true,
        })
    }

    /// Enqueue "signal when prior work on `stream` completes".
    pub fn record(&self, stream: u64) -> Result<()> {
        if self.imported {
            return Err(GpulinkError::device("cannot record an imported event"));
        }
        self.raw.record(stream)
    }

    /// Enqueue a wait for this event on `stream` without blocking the host.
    pub fn wait(&self, stream: u64, device: i32) -> Result<()> {
        self.raw.wait(stream, device)
    }

    /// Exportable handle bytes for this event.
    pub fn serialized_handle(&self) -> Result<Vec<u8>> {
        self.raw.serialized_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDriver;

    #[test]
    fn test_record_then_wait() {
        let driver = HostDriver::new(1);
        let ev = DeviceEvent::new(&driver, 0, true).unwrap();
        ev.record(0).unwrap();
        ev.wait(0, 0).unwrap();
    }

    #[test]
    fn test_imported_event_cannot_record() {
        let driver = HostDriver::new(1);
        let ev = DeviceEvent::new(&driver, 0, true).unwrap();
        let handle = ev.serialized_handle().unwrap();
        let foreign = DeviceEvent::from_handle(&driver, 0, &handle).unwrap();
        assert!(foreign.record(0).is_err());
    }

    #[test]
    fn test_handle_survives_exporter_drop() {
        let driver = HostDriver::new(1);
        let handle = {
            let ev = DeviceEvent::new(&driver, 0, true).unwrap();
            ev.record(0).unwrap();
            ev.serialized_handle().unwrap()
        };
        let foreign = DeviceEvent::from_handle(&driver, 0, &handle).unwrap();
        foreign.wait(0, 0).unwrap();
    }
}
