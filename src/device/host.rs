//! Host-memory emulation of the device driver.
//!
//! Backs the test suite and CPU-only CI. Two contexts sharing one
//! `Arc<HostDriver>` model two processes on one host: exported handles from
//! one side import on the other, copies move real bytes, and events form a
//! registry shared across importers.
//!
//! The emulation is synchronous (copies complete at submission) but strict
//! where it can be: handle export/import/close and copies must run with the
//! right device current, waiting on a never-recorded event is an error, and
//! open/close imbalances are observable through counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::device::{DeviceDriver, RawDeviceEvent};
use crate::error::{GpulinkError, Result};

const MEM_HANDLE_MAGIC: u32 = 0x4D45_4D48; // "MEMH"
const EVENT_HANDLE_MAGIC: u32 = 0x4556_4E54; // "EVNT"
const HANDLE_LEN: usize = 64;

struct HostAllocation {
    device: i32,
    buffer_id: u64,
    data: Box<[u8]>,
    /// Live imports of this allocation's IPC handle.
    open_count: u32,
}

struct HostEventState {
    device: i32,
    recorded: AtomicBool,
}

struct HostState {
    next_buffer_id: u64,
    next_event_id: u64,
    allocations: HashMap<u64, HostAllocation>,
    /// Event registry. Entries stay alive for the driver's lifetime so that
    /// an exported handle outlives the exporting event, as on real hardware.
    events: HashMap<u64, Arc<HostEventState>>,
    current_device: HashMap<ThreadId, i32>,
    ipc_opens: u64,
    ipc_closes: u64,
}

pub struct HostDriver {
    num_devices: i32,
    state: Mutex<HostState>,
}

impl HostDriver {
    pub fn new(num_devices: i32) -> Self {
        Self {
            num_devices,
            state: Mutex::new(HostState {
                next_buffer_id: 1,
                next_event_id: 1,
                allocations: HashMap::new(),
                events: HashMap::new(),
                current_device: HashMap::new(),
                ipc_opens: 0,
                ipc_closes: 0,
            }),
        }
    }

    fn check_device(&self, device: i32) -> Result<()> {
        if device < 0 || device >= self.num_devices {
            return Err(GpulinkError::device(format!(
                "device ordinal {device} out of range (have {})",
                self.num_devices
            )));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("host driver state lock poisoned")
    }

    /// Allocate a zero-filled device buffer and return its base pointer.
    pub fn alloc(&self, device: i32, len: usize) -> Result<u64> {
        self.check_device(device)?;
        let data = vec![0u8; len].into_boxed_slice();
        let base = data.as_ptr() as u64;
        let mut st = self.lock();
        let buffer_id = st.next_buffer_id;
        st.next_buffer_id += 1;
        st.allocations.insert(
            base,
            HostAllocation {
                device,
                buffer_id,
                data,
                open_count: 0,
            },
        );
        Ok(base)
    }

    /// Free an allocation. Fails while a peer still has it mapped.
    pub fn free(&self, base: u64) -> Result<()> {
        let mut st = self.lock();
        let alloc = st
            .allocations
            .get(&base)
            .ok_or_else(|| GpulinkError::device(format!("free of unknown base 0x{base:x}")))?;
        if alloc.open_count != 0 {
            return Err(GpulinkError::device(format!(
                "free of base 0x{base:x} with {} live ipc mappings",
                alloc.open_count
            )));
        }
        st.allocations.remove(&base);
        Ok(())
    }

    /// Copy `data` into device memory at `ptr` (test setup helper).
    pub fn write_bytes(&self, ptr: u64, data: &[u8]) -> Result<()> {
        let mut st = self.lock();
        let (base, alloc) = find_allocation_mut(&mut st.allocations, ptr, data.len())?;
        let off = (ptr - base) as usize;
        alloc.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes of device memory at `ptr` (test assertion helper).
    pub fn read_bytes(&self, ptr: u64, len: usize) -> Result<Vec<u8>> {
        let st = self.lock();
        let (base, alloc) = find_allocation(&st.allocations, ptr, len)?;
        let off = (ptr - base) as usize;
        Ok(alloc.data[off..off + len].to_vec())
    }

    /// Total `import_mem_handle` calls that reached the driver.
    pub fn ipc_open_count(&self) -> u64 {
        self.lock().ipc_opens
    }

    /// Total `close_mem_handle` calls that reached the driver.
    pub fn ipc_close_count(&self) -> u64 {
        self.lock().ipc_closes
    }

    /// Live imports of the allocation at `base`.
    pub fn open_count(&self, base: u64) -> Result<u32> {
        let st = self.lock();
        Ok(st
            .allocations
            .get(&base)
            .ok_or_else(|| GpulinkError::device(format!("unknown base 0x{base:x}")))?
            .open_count)
    }

    fn require_current(&self, st: &HostState, device: i32, what: &str) -> Result<()> {
        let current = *st
            .current_device
            .get(&std::thread::current().id())
            .unwrap_or(&0);
        if current != device {
            return Err(GpulinkError::device(format!(
                "{what} requires device {device} current, but device {current} is"
            )));
        }
        Ok(())
    }
}

fn find_allocation<'a>(
    allocations: &'a HashMap<u64, HostAllocation>,
    ptr: u64,
    len: usize,
) -> Result<(u64, &'a HostAllocation)> {
    for (base, alloc) in allocations {
        let end = base + alloc.data.len() as u64;
        if ptr >= *base && ptr + len as u64 <= end {
            return Ok((*base, alloc));
        }
    }
    Err(GpulinkError::device(format!(
        "pointer 0x{ptr:x} (+{len}) is not inside any allocation"
    )))
}

fn find_allocation_mut<'a>(
    allocations: &'a mut HashMap<u64, HostAllocation>,
    ptr: u64,
    len: usize,
) -> Result<(u64, &'a mut HostAllocation)> {
    let base = find_allocation(allocations, ptr, len)?.0;
    Ok((base, allocations.get_mut(&base).expect("base just found")))
}

impl DeviceDriver for HostDriver {
    fn device_for_pointer(&self, ptr: u64) -> Result<i32> {
        let st = self.lock();
        Ok(find_allocation(&st.allocations, ptr, 0)?.1.device)
    }

    fn current_device(&self) -> Result<i32> {
        let st = self.lock();
        Ok(*st
            .current_device
            .get(&std::thread::current().id())
            .unwrap_or(&0))
    }

    fn set_device(&self, device: i32) -> Result<()> {
        self.check_device(device)?;
        let mut st = self.lock();
        st.current_device
            .insert(std::thread::current().id(), device);
        Ok(())
    }

    fn address_range(&self, ptr: u64) -> Result<(u64, usize)> {
        let st = self.lock();
        let (base, alloc) = find_allocation(&st.allocations, ptr, 0)?;
        Ok((base, alloc.data.len()))
    }

    fn buffer_id(&self, base: u64) -> Result<u64> {
        let st = self.lock();
        Ok(st
            .allocations
            .get(&base)
            .ok_or_else(|| GpulinkError::device(format!("unknown base 0x{base:x}")))?
            .buffer_id)
    }

    fn export_mem_handle(&self, base: u64) -> Result<Vec<u8>> {
        let st = self.lock();
        let alloc = st
            .allocations
            .get(&base)
            .ok_or_else(|| GpulinkError::device(format!("unknown base 0x{base:x}")))?;
        self.require_current(&st, alloc.device, "export_mem_handle")?;
        let mut handle = vec![0u8; HANDLE_LEN];
        handle[0..4].copy_from_slice(&MEM_HANDLE_MAGIC.to_le_bytes());
        handle[4..12].copy_from_slice(&base.to_le_bytes());
        Ok(handle)
    }

    fn import_mem_handle(&self, device: i32, handle: &[u8]) -> Result<u64> {
        self.check_device(device)?;
        let base = parse_handle(handle, MEM_HANDLE_MAGIC)
            .ok_or_else(|| GpulinkError::ipc_map("unrecognized memory handle"))?;
        let mut st = self.lock();
        self.require_current(&st, device, "import_mem_handle")?;
        let alloc = st
            .allocations
            .get_mut(&base)
            .ok_or_else(|| GpulinkError::ipc_map(format!("stale memory handle 0x{base:x}")))?;
        alloc.open_count += 1;
        st.ipc_opens += 1;
        Ok(base)
    }

    fn close_mem_handle(&self, device: i32, base: u64) -> Result<()> {
        let mut st = self.lock();
        self.require_current(&st, device, "close_mem_handle")?;
        let alloc = st
            .allocations
            .get_mut(&base)
            .ok_or_else(|| GpulinkError::device(format!("unknown base 0x{base:x}")))?;
        if alloc.open_count == 0 {
            return Err(GpulinkError::device(format!(
                "close of base 0x{base:x} with no live mapping"
            )));
        }
        alloc.open_count -= 1;
        st.ipc_closes += 1;
        Ok(())
    }

    unsafe fn memcpy_dtod_async(&self, dst: u64, src: u64, len: usize, _stream: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let st = self.lock();
        let (_, dst_alloc) = find_allocation(&st.allocations, dst, len)?;
        find_allocation(&st.allocations, src, len)?;
        self.require_current(&st, dst_alloc.device, "memcpy_dtod_async")?;
        // The boxed slices are stable on the heap and the state lock is
        // held, so a raw copy between the two address ranges is sound.
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, len);
        }
        Ok(())
    }

    fn create_event(&self, device: i32, _interprocess: bool) -> Result<Box<dyn RawDeviceEvent>> {
        self.check_device(device)?;
        let mut st = self.lock();
        let id = st.next_event_id;
        st.next_event_id += 1;
        let state = Arc::new(HostEventState {
            device,
            recorded: AtomicBool::new(false),
        });
        st.events.insert(id, Arc::clone(&state));
        Ok(Box::new(HostEvent { id, state }))
    }

    fn import_event(&self, device: i32, handle: &[u8]) -> Result<Box<dyn RawDeviceEvent>> {
        self.check_device(device)?;
        let id = parse_handle(handle, EVENT_HANDLE_MAGIC)
            .ok_or_else(|| GpulinkError::device("unrecognized event handle"))?;
        let st = self.lock();
        let state = st
            .events
            .get(&id)
            .ok_or_else(|| GpulinkError::device(format!("stale event handle {id}")))?;
        Ok(Box::new(HostEvent {
            id,
            state: Arc::clone(state),
        }))
    }

    fn synchronize_stream(&self, device: i32, _stream: u64) -> Result<()> {
        self.check_device(device)?;
        // Work is executed at submission; nothing to wait for.
        Ok(())
    }
}

fn parse_handle(handle: &[u8], magic: u32) -> Option<u64> {
    if handle.len() != HANDLE_LEN {
        return None;
    }
    if u32::from_le_bytes(handle[0..4].try_into().ok()?) != magic {
        return None;
    }
    Some(u64::from_le_bytes(handle[4..12].try_into().ok()?))
}

struct HostEvent {
    id: u64,
    state: Arc<HostEventState>,
}

impl RawDeviceEvent for HostEvent {
    fn record(&self, _stream: u64) -> Result<()> {
        self.state.recorded.store(true, Ordering::Release);
        Ok(())
    }

    fn wait(&self, _stream: u64, _device: i32) -> Result<()> {
        // In the synchronous emulation a wait that precedes its record is a
        // protocol bug, not a benign race: surface it.
        if !self.state.recorded.load(Ordering::Acquire) {
            return Err(GpulinkError::device(format!(
                "wait on never-recorded event {} (device {})",
                self.id, self.state.device
            )));
        }
        Ok(())
    }

    fn serialized_handle(&self) -> Result<Vec<u8>> {
        let mut handle = vec![0u8; HANDLE_LEN];
        handle[0..4].copy_from_slice(&EVENT_HANDLE_MAGIC.to_le_bytes());
        handle[4..12].copy_from_slice(&self.id.to_le_bytes());
        Ok(handle)
    }
}
