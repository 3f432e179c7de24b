//! CUDA device driver via cudarc.
//!
//! Uses `CudaContext::bind_to_thread` for the current-device discipline and
//! raw driver-API calls (through `cudarc::driver::sys`) for the IPC and
//! pointer-attribute surface the safe wrappers do not cover.

#![cfg(feature = "cuda")]

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use cudarc::driver::sys;
use cudarc::driver::CudaContext;

use crate::device::{DeviceDriver, RawDeviceEvent};
use crate::error::{GpulinkError, Result};

const MEM_HANDLE_LEN: usize = std::mem::size_of::<sys::CUipcMemHandle>();
const EVENT_HANDLE_LEN: usize = std::mem::size_of::<sys::CUipcEventHandle>();

thread_local! {
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(0) };
}

fn cu_check(code: sys::CUresult, what: &str) -> Result<()> {
    if code == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(GpulinkError::device(format!("{what} failed: {code:?}")))
    }
}

/// Device driver for NVIDIA GPUs.
///
/// Primary contexts are retained lazily per ordinal and shared by every
/// channel on the context.
pub struct CudaDriver {
    contexts: Mutex<HashMap<i32, Arc<CudaContext>>>,
}

impl CudaDriver {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn context(&self, device: i32) -> Result<Arc<CudaContext>> {
        let mut contexts = self.contexts.lock().expect("cuda contexts lock poisoned");
        if let Some(ctx) = contexts.get(&device) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = CudaContext::new(device as usize).map_err(|e| {
            GpulinkError::device(format!("failed to create CUDA context for GPU {device}: {e}"))
        })?;
        contexts.insert(device, Arc::clone(&ctx));
        Ok(ctx)
    }
}

impl Default for CudaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for CudaDriver {
    fn device_for_pointer(&self, ptr: u64) -> Result<i32> {
        let mut ordinal: i32 = 0;
        cu_check(
            unsafe {
                sys::lib().cuPointerGetAttribute(
                    &mut ordinal as *mut i32 as *mut c_void,
                    sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL,
                    ptr as sys::CUdeviceptr,
                )
            },
            "cuPointerGetAttribute(DEVICE_ORDINAL)",
        )?;
        Ok(ordinal)
    }

    fn current_device(&self) -> Result<i32> {
        Ok(CURRENT_DEVICE.with(|d| d.get()))
    }

    fn set_device(&self, device: i32) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(|e| GpulinkError::device(format!("CUDA bind_to_thread failed: {e}")))?;
        CURRENT_DEVICE.with(|d| d.set(device));
        Ok(())
    }

    fn address_range(&self, ptr: u64) -> Result<(u64, usize)> {
        let mut base: sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        cu_check(
            unsafe {
                sys::lib().cuMemGetAddressRange_v2(&mut base, &mut size, ptr as sys::CUdeviceptr)
            },
            "cuMemGetAddressRange",
        )?;
        Ok((base as u64, size))
    }

    fn buffer_id(&self, base: u64) -> Result<u64> {
        let mut buffer_id: u64 = 0;
        cu_check(
            unsafe {
                sys::lib().cuPointerGetAttribute(
                    &mut buffer_id as *mut u64 as *mut c_void,
                    sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_BUFFER_ID,
                    base as sys::CUdeviceptr,
                )
            },
            "cuPointerGetAttribute(BUFFER_ID)",
        )?;
        Ok(buffer_id)
    }

    fn export_mem_handle(&self, base: u64) -> Result<Vec<u8>> {
        let mut handle = sys::CUipcMemHandle { reserved: [0; 64] };
        cu_check(
            unsafe { sys::lib().cuIpcGetMemHandle(&mut handle, base as sys::CUdeviceptr) },
            "cuIpcGetMemHandle",
        )?;
        let bytes =
            unsafe { std::slice::from_raw_parts(&handle as *const _ as *const u8, MEM_HANDLE_LEN) };
        Ok(bytes.to_vec())
    }

    fn import_mem_handle(&self, _device: i32, handle: &[u8]) -> Result<u64> {
        if handle.len() != MEM_HANDLE_LEN {
            return Err(GpulinkError::ipc_map(format!(
                "memory handle is {} bytes, expected {MEM_HANDLE_LEN}",
                handle.len()
            )));
        }
        let mut raw = sys::CUipcMemHandle { reserved: [0; 64] };
        unsafe {
            std::ptr::copy_nonoverlapping(
                handle.as_ptr(),
                &mut raw as *mut _ as *mut u8,
                MEM_HANDLE_LEN,
            );
        }
        let mut mapped: sys::CUdeviceptr = 0;
        let code = unsafe {
            sys::lib().cuIpcOpenMemHandle_v2(
                &mut mapped,
                raw,
                sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
            )
        };
        if code != sys::CUresult::CUDA_SUCCESS {
            return Err(GpulinkError::ipc_map(format!(
                "cuIpcOpenMemHandle failed: {code:?}"
            )));
        }
        Ok(mapped as u64)
    }

    fn close_mem_handle(&self, _device: i32, base: u64) -> Result<()> {
        cu_check(
            unsafe { sys::lib().cuIpcCloseMemHandle(base as sys::CUdeviceptr) },
            "cuIpcCloseMemHandle",
        )
    }

    unsafe fn memcpy_dtod_async(&self, dst: u64, src: u64, len: usize, stream: u64) -> Result<()> {
        cu_check(
            unsafe {
                sys::lib().cuMemcpyDtoDAsync_v2(
                    dst as sys::CUdeviceptr,
                    src as sys::CUdeviceptr,
                    len,
                    stream as sys::CUstream,
                )
            },
            "cuMemcpyDtoDAsync",
        )
    }

    fn create_event(&self, device: i32, interprocess: bool) -> Result<Box<dyn RawDeviceEvent>> {
        let ctx = self.context(device)?;
        ctx.bind_to_thread()
            .map_err(|e| GpulinkError::device(format!("CUDA bind_to_thread failed: {e}")))?;
        let mut flags = sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32;
        if interprocess {
            flags |= sys::CUevent_flags::CU_EVENT_INTERPROCESS as u32;
        }
        let mut event: sys::CUevent = std::ptr::null_mut();
        cu_check(
            unsafe { sys::lib().cuEventCreate(&mut event, flags) },
            "cuEventCreate",
        )?;
        Ok(Box::new(CudaEvent { event, _ctx: ctx }))
    }

    fn import_event(&self, device: i32, handle: &[u8]) -> Result<Box<dyn RawDeviceEvent>> {
        if handle.len() != EVENT_HANDLE_LEN {
            return Err(GpulinkError::device(format!(
                "event handle is {} bytes, expected {EVENT_HANDLE_LEN}",
                handle.len()
            )));
        }
        let ctx = self.context(device)?;
        ctx.bind_to_thread()
            .map_err(|e| GpulinkError::device(format!("CUDA bind_to_thread failed: {e}")))?;
        let mut raw = sys::CUipcEventHandle { reserved: [0; 64] };
        unsafe {
            std::ptr::copy_nonoverlapping(
                handle.as_ptr(),
                &mut raw as *mut _ as *mut u8,
                EVENT_HANDLE_LEN,
            );
        }
        let mut event: sys::CUevent = std::ptr::null_mut();
        cu_check(
            unsafe { sys::lib().cuIpcOpenEventHandle(&mut event, raw) },
            "cuIpcOpenEventHandle",
        )?;
        Ok(Box::new(CudaEvent { event, _ctx: ctx }))
    }

    fn synchronize_stream(&self, device: i32, stream: u64) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(|e| GpulinkError::device(format!("CUDA bind_to_thread failed: {e}")))?;
        cu_check(
            unsafe { sys::lib().cuStreamSynchronize(stream as sys::CUstream) },
            "cuStreamSynchronize",
        )
    }
}

struct CudaEvent {
    event: sys::CUevent,
    /// Keeps the owning context alive for the event's lifetime.
    _ctx: Arc<CudaContext>,
}

unsafe impl Send for CudaEvent {}

impl RawDeviceEvent for CudaEvent {
    fn record(&self, stream: u64) -> Result<()> {
        cu_check(
            unsafe { sys::lib().cuEventRecord(self.event, stream as sys::CUstream) },
            "cuEventRecord",
        )
    }

    fn wait(&self, stream: u64, _device: i32) -> Result<()> {
        cu_check(
            unsafe { sys::lib().cuStreamWaitEvent(stream as sys::CUstream, self.event, 0) },
            "cuStreamWaitEvent",
        )
    }

    fn serialized_handle(&self) -> Result<Vec<u8>> {
        let mut handle = sys::CUipcEventHandle { reserved: [0; 64] };
        cu_check(
            unsafe { sys::lib().cuIpcGetEventHandle(&mut handle, self.event) },
            "cuIpcGetEventHandle",
        )?;
        let bytes = unsafe {
            std::slice::from_raw_parts(&handle as *const _ as *const u8, EVENT_HANDLE_LEN)
        };
        Ok(bytes.to_vec())
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        // An exported handle stays valid for importers; destruction only
        // releases this process's reference.
        let _ = unsafe { sys::lib().cuEventDestroy_v2(self.event) };
    }
}
