//! Per-process context: one loop, one driver, one IPC handle cache, and the
//! enrollment table of live channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::ChannelInner;
use crate::config::ChannelConfig;
use crate::device::DeviceDriver;
use crate::error::Result;
use crate::executor::{LoopExecutor, Task};
use crate::ipc::IpcHandleCache;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Shared handle to a channel context.
///
/// Everything a channel needs at runtime hangs off its context: the loop
/// that owns all state, the device driver, the process identifier stamped
/// into allocation ids, and the IPC handle cache shared by all channels.
///
/// Call [`Context::close`] when done; enrolled channels keep the context
/// alive until they are closed or hit an error.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    executor: LoopExecutor,
    driver: Arc<dyn DeviceDriver>,
    config: ChannelConfig,
    process_id: String,
    cache: Mutex<IpcHandleCache>,
    channels: Mutex<HashMap<u64, Arc<ChannelInner>>>,
    next_channel_id: AtomicU64,
    closed: AtomicBool,
}

impl Context {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: ChannelConfig) -> Result<Self> {
        let seq = CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
        // Distinct per context so two contexts in one process (as in tests)
        // never mint colliding allocation ids.
        let process_id = format!("{}-{seq}", std::process::id());
        Ok(Self {
            inner: Arc::new(ContextInner {
                executor: LoopExecutor::new("gpulink-loop")?,
                driver,
                config,
                process_id,
                cache: Mutex::new(IpcHandleCache::new()),
                channels: Mutex::new(HashMap::new()),
                next_channel_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Identifier stable for this context's lifetime, prefixed onto every
    /// allocation id this side exports.
    pub fn process_identifier(&self) -> &str {
        &self.inner.process_id
    }

    /// Close every enrolled channel (draining their callbacks with
    /// `ChannelClosed`), tear down the IPC cache, and stop the loop.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let _ = self.inner.executor.run(move || {
            let channels: Vec<Arc<ChannelInner>> = inner
                .channels
                .lock()
                .expect("context channels lock poisoned")
                .values()
                .cloned()
                .collect();
            for channel in channels {
                channel.close_from_loop();
            }
            inner
                .cache
                .lock()
                .expect("context cache lock poisoned")
                .teardown(inner.driver.as_ref());
        });
        self.inner.executor.close();
    }

    pub(crate) fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.inner.driver
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub(crate) fn in_loop(&self) -> bool {
        self.inner.executor.in_loop()
    }

    pub(crate) fn defer(&self, task: Task) -> bool {
        self.inner.executor.defer(task)
    }

    pub(crate) fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.inner.executor.run(f)
    }

    pub(crate) fn next_channel_id(&self) -> u64 {
        self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn enroll(&self, id: u64, channel: Arc<ChannelInner>) {
        self.inner
            .channels
            .lock()
            .expect("context channels lock poisoned")
            .insert(id, channel);
    }

    pub(crate) fn unenroll(&self, id: u64) {
        self.inner
            .channels
            .lock()
            .expect("context channels lock poisoned")
            .remove(&id);
    }

    /// Run `f` against the shared IPC handle cache. Loop only.
    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut IpcHandleCache) -> R) -> R {
        debug_assert!(self.in_loop());
        let mut cache = self
            .inner
            .cache
            .lock()
            .expect("context cache lock poisoned");
        f(&mut cache)
    }
}
