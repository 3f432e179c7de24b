//! GPU driver bindings behind an object-safe trait.
//!
//! The channel core never talks to a driver library directly; everything it
//! needs — pointer queries, IPC handle export/import, async copies, events —
//! goes through [`DeviceDriver`]. Two implementations ship with the crate:
//!
//! - [`CudaDriver`] (`feature = "cuda"`): the real thing, via cudarc.
//! - [`HostDriver`]: a strict in-process emulation backed by host memory,
//!   used by the test suite and by CPU-only CI.

#[cfg(feature = "cuda")]
pub mod cuda;
mod event;
mod guard;
mod host;

pub use event::DeviceEvent;
pub use guard::DeviceGuard;
pub use host::HostDriver;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;

use crate::error::Result;

/// A GPU event as the driver sees it: recordable on a stream, waitable from
/// a stream, exportable as an opaque handle.
///
/// Use [`DeviceEvent`] rather than this trait directly; it layers on the
/// created-vs-imported distinction.
pub trait RawDeviceEvent: Send {
    /// Enqueue "signal when prior work on `stream` completes".
    fn record(&self, stream: u64) -> Result<()>;

    /// Enqueue a wait for this event on `stream` without blocking the host.
    fn wait(&self, stream: u64, device: i32) -> Result<()>;

    /// Exportable handle bytes for this event.
    fn serialized_handle(&self) -> Result<Vec<u8>>;
}

/// Driver surface required by the channel core.
///
/// All pointers and streams are raw `u64` handles, the same convention the
/// rest of the crate's FFI boundary uses.
pub trait DeviceDriver: Send + Sync + 'static {
    /// Device ordinal owning the allocation that `ptr` points into.
    fn device_for_pointer(&self, ptr: u64) -> Result<i32>;

    /// Current device of the calling thread.
    fn current_device(&self) -> Result<i32>;

    /// Make `device` current for the calling thread.
    fn set_device(&self, device: i32) -> Result<()>;

    /// `(base, size)` of the allocation containing `ptr`.
    ///
    /// Must run with the owning device current (see [`DeviceGuard`]).
    fn address_range(&self, ptr: u64) -> Result<(u64, usize)>;

    /// Driver-assigned identifier of the allocation at `base`, stable for
    /// the allocation's lifetime.
    fn buffer_id(&self, base: u64) -> Result<u64>;

    /// Export an IPC handle for the allocation at `base`.
    ///
    /// Must run with the owning device current.
    fn export_mem_handle(&self, base: u64) -> Result<Vec<u8>>;

    /// Import a peer's IPC memory handle, returning the locally mapped base
    /// pointer. Must run with `device` current.
    fn import_mem_handle(&self, device: i32, handle: &[u8]) -> Result<u64>;

    /// Release a mapping obtained from [`Self::import_mem_handle`].
    fn close_mem_handle(&self, device: i32, base: u64) -> Result<()>;

    /// Enqueue a device-to-device copy on `stream`.
    ///
    /// # Safety
    /// `dst` and `src` must be valid device pointers for `len` bytes, and
    /// `stream` a valid stream handle on the current device.
    unsafe fn memcpy_dtod_async(&self, dst: u64, src: u64, len: usize, stream: u64) -> Result<()>;

    /// Create a fresh event on `device`; `interprocess` events have
    /// exportable handles.
    fn create_event(&self, device: i32, interprocess: bool) -> Result<Box<dyn RawDeviceEvent>>;

    /// Open a foreign event from its exported handle bytes.
    fn import_event(&self, device: i32, handle: &[u8]) -> Result<Box<dyn RawDeviceEvent>>;

    /// Block the host until all work queued on `stream` has completed.
    fn synchronize_stream(&self, device: i32, stream: u64) -> Result<()>;
}
