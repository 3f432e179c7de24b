//! Receiver-side cache of imported IPC memory handles.
//!
//! Importing the same memory handle twice while the first mapping is live is
//! not guaranteed to succeed, so the cache imports once per remote
//! allocation and hands the mapped base pointer to every operation that
//! references it, refcounting the mapping's lifetime.
//!
//! The cache is shared by all channels attached to one context and is
//! mutated only on the context loop, so it needs no internal lock; the
//! context wraps it in a `Mutex` purely to satisfy `Sync`.

use std::collections::HashMap;

use crate::device::{DeviceDriver, DeviceGuard};
use crate::error::{GpulinkError, Result};

struct IpcMapping {
    base_ptr: u64,
    ref_count: u64,
}

#[derive(Default)]
pub(crate) struct IpcHandleCache {
    mappings: HashMap<(String, i32), IpcMapping>,
}

impl IpcHandleCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Map a remote allocation into this process, or reuse the live mapping
    /// for `(allocation_id, device)`.
    ///
    /// On a miss the handle is imported under the device guard; a failed
    /// import inserts nothing.
    pub(crate) fn open(
        &mut self,
        driver: &dyn DeviceDriver,
        allocation_id: &str,
        mem_handle: &[u8],
        device: i32,
    ) -> Result<u64> {
        let key = (allocation_id.to_string(), device);
        if let Some(mapping) = self.mappings.get_mut(&key) {
            mapping.ref_count += 1;
            tracing::trace!(
                allocation_id,
                device,
                ref_count = mapping.ref_count,
                "reusing ipc mapping"
            );
            return Ok(mapping.base_ptr);
        }

        let base_ptr = {
            let _guard = DeviceGuard::new(driver, device)?;
            driver.import_mem_handle(device, mem_handle)?
        };
        tracing::debug!(allocation_id, device, base_ptr, "opened ipc mapping");
        self.mappings.insert(
            key,
            IpcMapping {
                base_ptr,
                ref_count: 1,
            },
        );
        Ok(base_ptr)
    }

    /// Drop one reference to `(allocation_id, device)`; the last reference
    /// closes the driver mapping under the device guard.
    pub(crate) fn close(
        &mut self,
        driver: &dyn DeviceDriver,
        allocation_id: &str,
        device: i32,
    ) -> Result<()> {
        let key = (allocation_id.to_string(), device);
        let mapping = self.mappings.get_mut(&key).ok_or_else(|| {
            GpulinkError::internal(format!(
                "close of untracked ipc mapping {allocation_id} on device {device}"
            ))
        })?;
        mapping.ref_count -= 1;
        if mapping.ref_count > 0 {
            return Ok(());
        }
        let base_ptr = mapping.base_ptr;
        self.mappings.remove(&key);
        tracing::debug!(allocation_id, device, base_ptr, "closing ipc mapping");
        let _guard = DeviceGuard::new(driver, device)?;
        driver.close_mem_handle(device, base_ptr)
    }

    /// Close every remaining mapping at context shutdown. Live refcounts at
    /// this point mean an operation leaked its reference.
    pub(crate) fn teardown(&mut self, driver: &dyn DeviceDriver) {
        for ((allocation_id, device), mapping) in self.mappings.drain() {
            debug_assert_eq!(
                mapping.ref_count, 0,
                "ipc mapping {allocation_id} on device {device} torn down with live refs"
            );
            tracing::debug!(
                %allocation_id,
                device,
                base_ptr = mapping.base_ptr,
                "closing leftover ipc mapping"
            );
            let closed = DeviceGuard::new(driver, device)
                .and_then(|_guard| driver.close_mem_handle(device, mapping.base_ptr));
            if let Err(e) = closed {
                tracing::warn!(%allocation_id, device, "leftover ipc mapping close failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDriver;

    #[test]
    fn test_open_once_per_allocation() {
        let driver = HostDriver::new(1);
        let base = driver.alloc(0, 256).unwrap();
        let handle = driver.export_mem_handle(base).unwrap();

        let mut cache = IpcHandleCache::new();
        let a = cache.open(&driver, "p_1", &handle, 0).unwrap();
        let b = cache.open(&driver, "p_1", &handle, 0).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base);
        assert_eq!(driver.ipc_open_count(), 1);

        cache.close(&driver, "p_1", 0).unwrap();
        assert_eq!(driver.ipc_close_count(), 0);
        cache.close(&driver, "p_1", 0).unwrap();
        assert_eq!(driver.ipc_close_count(), 1);
        assert_eq!(driver.open_count(base).unwrap(), 0);
    }

    #[test]
    fn test_reopen_after_full_close() {
        let driver = HostDriver::new(1);
        let base = driver.alloc(0, 16).unwrap();
        let handle = driver.export_mem_handle(base).unwrap();

        let mut cache = IpcHandleCache::new();
        cache.open(&driver, "p_1", &handle, 0).unwrap();
        cache.close(&driver, "p_1", 0).unwrap();
        cache.open(&driver, "p_1", &handle, 0).unwrap();
        assert_eq!(driver.ipc_open_count(), 2);
        cache.close(&driver, "p_1", 0).unwrap();
    }

    #[test]
    fn test_failed_open_inserts_nothing() {
        let driver = HostDriver::new(1);
        let mut cache = IpcHandleCache::new();
        let bogus = vec![0u8; 64];
        assert!(cache.open(&driver, "p_9", &bogus, 0).is_err());
        assert!(cache.mappings.is_empty());
        assert_eq!(driver.ipc_open_count(), 0);
    }

    #[test]
    fn test_distinct_devices_map_separately() {
        let driver = HostDriver::new(2);
        let base = driver.alloc(0, 16).unwrap();
        let handle = driver.export_mem_handle(base).unwrap();

        // The same remote allocation mapped on two local devices is two
        // cache entries. The host emulation maps both onto the same base.
        let mut cache = IpcHandleCache::new();
        cache.open(&driver, "p_1", &handle, 0).unwrap();
        cache.open(&driver, "p_1", &handle, 1).unwrap();
        assert_eq!(driver.ipc_open_count(), 2);
        cache.close(&driver, "p_1", 0).unwrap();
        cache.close(&driver, "p_1", 1).unwrap();
    }

    #[test]
    fn test_teardown_closes_leftovers() {
        let driver = HostDriver::new(1);
        let base = driver.alloc(0, 16).unwrap();
        let handle = driver.export_mem_handle(base).unwrap();

        let mut cache = IpcHandleCache::new();
        cache.open(&driver, "p_1", &handle, 0).unwrap();
        cache.close(&driver, "p_1", 0).unwrap();
        cache.teardown(&driver);
        assert_eq!(driver.open_count(base).unwrap(), 0);
    }
}
