//! Single-threaded cooperative loop.
//!
//! One `LoopExecutor` per context. All channel state transitions, queue
//! mutations, cache mutations, and callback invocations run on its thread.
//! The thread drives a current-thread tokio runtime, so control-connection
//! pump tasks spawned from loop tasks run interleaved on the same thread:
//! their completions are "on the loop" by construction.

use std::sync::Mutex;
use std::thread::{JoinHandle, ThreadId};

use tokio::sync::mpsc;

use crate::error::{GpulinkError, Result};

/// A unit of work posted to the loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct LoopExecutor {
    task_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl LoopExecutor {
    pub fn new(name: &str) -> Result<Self> {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();
        let (id_tx, id_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = id_tx.send(Err(GpulinkError::internal(format!(
                            "loop runtime build failed: {e}"
                        ))));
                        return;
                    }
                };
                let _ = id_tx.send(Ok(std::thread::current().id()));
                rt.block_on(async move {
                    while let Some(task) = task_rx.recv().await {
                        task();
                    }
                });
                // Dropping the runtime here cancels any pump task still
                // running; channels have drained their callbacks by now.
            })
            .map_err(|e| GpulinkError::internal(format!("loop thread spawn failed: {e}")))?;

        let thread_id = id_rx
            .recv()
            .map_err(|_| GpulinkError::internal("loop thread exited during startup"))??;

        Ok(Self {
            task_tx: Mutex::new(Some(task_tx)),
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    /// True when called from the loop thread.
    pub fn in_loop(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Post a task. Tasks run FIFO, each to completion before the next.
    ///
    /// Returns false if the loop has been closed; the task is dropped.
    pub fn defer(&self, task: Task) -> bool {
        let tx = self.task_tx.lock().expect("loop task lock poisoned");
        match tx.as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => {
                tracing::debug!("task posted after loop close, dropping");
                false
            }
        }
    }

    /// Post `f` and block until it has run, returning its result.
    ///
    /// When already on the loop (e.g. called from inside a callback), `f`
    /// runs inline instead: blocking would deadlock the loop.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.in_loop() {
            return Ok(f());
        }
        let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
        let posted = self.defer(Box::new(move || {
            let _ = done_tx.send(f());
        }));
        if !posted {
            return Err(GpulinkError::internal("loop closed"));
        }
        done_rx
            .recv()
            .map_err(|_| GpulinkError::internal("loop terminated before task ran"))
    }

    /// Stop accepting tasks, drain the queue, and join the thread.
    ///
    /// Idempotent. Must not be called from the loop itself.
    pub fn close(&self) {
        assert!(!self.in_loop(), "LoopExecutor::close called from the loop");
        // Dropping the sender lets the loop drain what is queued, then exit.
        self.task_tx.lock().expect("loop task lock poisoned").take();
        if let Some(thread) = self.thread.lock().expect("loop thread lock poisoned").take() {
            if thread.join().is_err() {
                tracing::warn!("loop thread panicked during shutdown");
            }
        }
    }
}

impl Drop for LoopExecutor {
    fn drop(&mut self) {
        self.task_tx.lock().expect("loop task lock poisoned").take();
        // The last reference can die on the loop itself (a callback dropping
        // the final context handle); then the thread unwinds on its own once
        // the queue drains and there is nobody left to join it.
        if !self.in_loop() {
            if let Some(thread) = self.thread.lock().expect("loop thread lock poisoned").take() {
                if thread.join().is_err() {
                    tracing::warn!("loop thread panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_fifo() {
        let exec = LoopExecutor::new("test-loop").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            exec.defer(Box::new(move || {
                order.lock().unwrap().push(i);
            }));
        }
        exec.run(|| ()).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_returns_value() {
        let exec = LoopExecutor::new("test-loop").unwrap();
        assert_eq!(exec.run(|| 41 + 1).unwrap(), 42);
    }

    #[test]
    fn test_in_loop() {
        let exec = Arc::new(LoopExecutor::new("test-loop").unwrap());
        assert!(!exec.in_loop());
        let inner = Arc::clone(&exec);
        let saw = exec.run(move || inner.in_loop()).unwrap();
        assert!(saw);
    }

    #[test]
    fn test_run_inline_when_on_loop() {
        // A task that calls run() again must not deadlock.
        let exec = Arc::new(LoopExecutor::new("test-loop").unwrap());
        let inner = Arc::clone(&exec);
        let v = exec.run(move || inner.run(|| 7).unwrap()).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_close_drains_queued_tasks() {
        let exec = LoopExecutor::new("test-loop").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            exec.defer(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        exec.close();
        assert_eq!(count.load(Ordering::SeqCst), 100);
        // Posting after close reports failure.
        assert!(!exec.defer(Box::new(|| ())));
        assert!(exec.run(|| ()).is_err());
    }

    #[test]
    fn test_spawned_io_runs_on_loop_thread() {
        let exec = Arc::new(LoopExecutor::new("test-loop").unwrap());
        let (tx, rx) = std::sync::mpsc::channel();
        let loop_ref = Arc::clone(&exec);
        exec.defer(Box::new(move || {
            let loop_ref = Arc::clone(&loop_ref);
            tokio::spawn(async move {
                let _ = tx.send(loop_ref.in_loop());
            });
        }));
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
    }
}
