//! The channel facade and its shared state.
//!
//! All channel state lives behind one mutex that only loop tasks lock.
//! Transitions run under the lock and queue their side effects — callback
//! invocations and error handling — onto an ordered [`Effects`] list that
//! the loop task drains after releasing it. That keeps user callbacks free
//! to call straight back into the channel, and keeps error handling from
//! recursing into an advance already on the stack.

pub(crate) mod queue;
mod recv;
mod send;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::context::Context;
use crate::error::{GpulinkError, Result};
use crate::transport::{ControlConnection, ControlStream, ErrorHook};

use queue::{OpQueue, Operation};
use recv::RecvOp;
use send::SendOp;

/// One device buffer handed to `send` or `recv`.
///
/// `ptr` is a raw device pointer, `stream` a raw stream handle on the same
/// device; both stay owned by the caller. The channel only enqueues work on
/// the stream.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBuffer {
    pub ptr: u64,
    pub length: usize,
    pub stream: u64,
}

/// Completion callback for one transfer operation; invoked exactly once, on
/// the context loop.
pub type TransferCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

pub(crate) enum Effect {
    Callback {
        callback: TransferCallback,
        result: Result<()>,
    },
    HandleError,
}

#[derive(Default)]
pub(crate) struct Effects {
    queue: VecDeque<Effect>,
}

impl Effects {
    /// Queue `callback` (when present) for invocation after the lock drops.
    pub(crate) fn callback(&mut self, callback: Option<TransferCallback>, result: Result<()>) {
        if let Some(callback) = callback {
            self.queue.push_back(Effect::Callback { callback, result });
        }
    }

    fn push_handle_error(&mut self) {
        self.queue.push_back(Effect::HandleError);
    }

    fn pop_front(&mut self) -> Option<Effect> {
        self.queue.pop_front()
    }
}

pub(crate) struct ChannelState {
    pub(crate) name: String,
    pub(crate) error: Option<GpulinkError>,
    pub(crate) send_ops: OpQueue<SendOp>,
    pub(crate) recv_ops: OpQueue<RecvOp>,
    pub(crate) reply_conn: ControlConnection,
    pub(crate) ack_conn: ControlConnection,
    unenrolled: bool,
}

pub(crate) struct ChannelInner {
    pub(crate) context: Context,
    channel_id: u64,
    state: Mutex<ChannelState>,
}

/// Record the channel error if none is set yet (first writer wins) and
/// schedule `handle_error`.
pub(crate) fn set_error(st: &mut ChannelState, fx: &mut Effects, error: GpulinkError) {
    if st.error.is_some() {
        return;
    }
    tracing::debug!(channel = %st.name, %error, "channel error");
    st.error = Some(error);
    fx.push_handle_error();
}

/// Move `seq` from `from` to `to` when it is in `from` and `cond` holds,
/// running `actions` first. A failing action leaves the state untouched and
/// promotes its error to the channel error; the error-path transitions then
/// drain the operation.
pub(crate) fn attempt_transition<O, Q, A>(
    st: &mut ChannelState,
    fx: &mut Effects,
    queue: Q,
    seq: u64,
    from: O::State,
    to: O::State,
    cond: bool,
    actions: A,
) -> bool
where
    O: Operation,
    Q: Fn(&mut ChannelState) -> &mut OpQueue<O> + Copy,
    A: FnOnce(&mut ChannelState, &mut Effects) -> Result<()>,
{
    match queue(st).get(seq) {
        Some(op) if op.state() == from => {}
        _ => return false,
    }
    if !cond {
        return false;
    }
    match actions(st, fx) {
        Ok(()) => {
            let op = queue(st).get_mut(seq).expect("op vanished mid-transition");
            tracing::trace!(seq, ?from, ?to, "transition");
            op.set_state(to);
            true
        }
        Err(e) => {
            set_error(st, fx, e);
            false
        }
    }
}

impl ChannelInner {
    /// Lock the state, run `f`, pop retired operations, then drain the
    /// queued effects with the lock released. Loop only.
    pub(crate) fn with_state<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut ChannelState, &mut Effects) -> R,
    ) -> R {
        debug_assert!(self.context.in_loop(), "channel state touched off-loop");
        let mut fx = Effects::default();
        let result = {
            let mut st = self.lock_state();
            let result = f(&mut st, &mut fx);
            st.send_ops.pop_finished();
            st.recv_ops.pop_finished();
            result
        };
        self.drain(fx);
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state lock poisoned")
    }

    fn drain(self: &Arc<Self>, mut fx: Effects) {
        while let Some(effect) = fx.pop_front() {
            match effect {
                Effect::Callback { callback, result } => callback(result),
                Effect::HandleError => {
                    let mut st = self.lock_state();
                    self.handle_error_impl(&mut st, &mut fx);
                    st.send_ops.pop_finished();
                    st.recv_ops.pop_finished();
                }
            }
        }
    }

    /// Runs once the channel error is set: drain both queues, close both
    /// control connections, unenroll from the context.
    fn handle_error_impl(self: &Arc<Self>, st: &mut ChannelState, fx: &mut Effects) {
        tracing::debug!(channel = %st.name, "handling channel error");
        // Outstanding control-stream reads are cancelled up front so the
        // drain below completes in one pass; the connections being closed
        // would answer them with errors eventually, but teardown must not
        // wait on that. A late completion finds its op retired and no-ops.
        self.cancel_pending_send_io(st);
        self.cancel_pending_recv_io(st);
        self.advance_all_send(st, fx);
        self.advance_all_recv(st, fx);
        st.reply_conn.close();
        st.ack_conn.close();
        if !st.unenrolled {
            st.unenrolled = true;
            self.context.unenroll(self.channel_id);
        }
    }

    pub(crate) fn close_from_loop(self: &Arc<Self>) {
        self.with_state(|st, fx| {
            if st.error.is_none() {
                tracing::debug!(channel = %st.name, "closing channel");
                set_error(st, fx, GpulinkError::ChannelClosed);
            }
        });
    }
}

fn connection_error_hook(weak: Weak<ChannelInner>, which: &'static str) -> ErrorHook {
    Box::new(move |error| {
        if let Some(inner) = weak.upgrade() {
            tracing::debug!(conn = which, %error, "control connection failed");
            inner.with_state(|st, fx| set_error(st, fx, error.clone()));
        }
    })
}

/// A same-host GPU transfer channel between two processes.
///
/// One `send`/`recv` is one independent operation. All entry points are
/// thread-safe and defer their work to the context loop; callbacks run on
/// the loop.
pub struct IpcChannel {
    inner: Arc<ChannelInner>,
}

impl IpcChannel {
    /// Build a channel over two pre-connected control streams. The peer
    /// constructs its channel over the other ends of the same two streams.
    pub fn new(
        context: &Context,
        reply_stream: Box<dyn ControlStream>,
        ack_stream: Box<dyn ControlStream>,
    ) -> Result<Self> {
        let context = context.clone();
        let inner = context.clone().run(move || {
            let channel_id = context.next_channel_id();
            let max_frame = context.config().max_control_frame_bytes;
            let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
                let reply_conn = ControlConnection::new(
                    reply_stream,
                    max_frame,
                    connection_error_hook(weak.clone(), "reply"),
                );
                let ack_conn = ControlConnection::new(
                    ack_stream,
                    max_frame,
                    connection_error_hook(weak.clone(), "ack"),
                );
                ChannelInner {
                    context: context.clone(),
                    channel_id,
                    state: Mutex::new(ChannelState {
                        name: format!("channel-{channel_id}"),
                        error: None,
                        send_ops: OpQueue::new(),
                        recv_ops: OpQueue::new(),
                        reply_conn,
                        ack_conn,
                        unenrolled: false,
                    }),
                }
            });
            context.enroll(channel_id, Arc::clone(&inner));
            inner
        })?;
        Ok(Self { inner })
    }

    /// Submit one buffer for transfer and return the encoded descriptor to
    /// convey to the peer out-of-band. `callback` fires once the peer has
    /// finished reading the source buffer (which may then be reused on its
    /// stream) or once the operation fails.
    ///
    /// On an already-errored channel this returns the channel error and the
    /// callback is never registered.
    ///
    /// # Safety
    /// `buffer.ptr` must point into a live device allocation of at least
    /// `buffer.length` bytes, and `buffer.stream` must be a valid stream on
    /// the same device, both staying valid until the callback fires.
    pub unsafe fn send(&self, buffer: DeviceBuffer, callback: TransferCallback) -> Result<Vec<u8>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .run(move || inner.send_from_loop(buffer, callback))?
    }

    /// Receive the transfer described by `descriptor` into `buffer`.
    /// `callback` fires once the device-to-device copy has been submitted on
    /// `buffer.stream` (before the ack round-trip completes, unless
    /// configured otherwise) or once the operation fails.
    ///
    /// # Safety
    /// Same contract as [`IpcChannel::send`], for the destination buffer.
    pub unsafe fn recv(&self, descriptor: &[u8], buffer: DeviceBuffer, callback: TransferCallback) {
        let descriptor = descriptor.to_vec();
        let inner = Arc::clone(&self.inner);
        let posted = self
            .inner
            .context
            .defer(Box::new(move || {
                inner.recv_from_loop(descriptor, buffer, callback)
            }));
        if !posted {
            tracing::warn!("recv posted after context close, dropping");
        }
    }

    /// Shut the channel down: every in-flight operation drains with
    /// `ChannelClosed`, both control connections close, and the channel
    /// unenrolls from its context. Idempotent.
    pub fn close(&self) {
        let inner = Arc::clone(&self.inner);
        let posted = self
            .inner
            .context
            .defer(Box::new(move || inner.close_from_loop()));
        if !posted {
            tracing::debug!("close posted after context close");
        }
    }

    /// Set the diagnostic name used in this channel's log output.
    /// Observation only; does not affect behavior.
    pub fn set_id(&self, id: impl Into<String>) {
        let id = id.into();
        let inner = Arc::clone(&self.inner);
        let posted = self.inner.context.defer(Box::new(move || {
            inner.with_state(|st, _fx| {
                tracing::debug!(old = %st.name, new = %id, "channel renamed");
                st.name = id;
            });
        }));
        if !posted {
            tracing::debug!("set_id posted after context close");
        }
    }

    /// Current channel health: `Ok` while the channel is usable, otherwise
    /// the channel error. Blocks briefly on the loop.
    pub fn status(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.context.run(move || {
            inner.with_state(|st, _fx| match &st.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            })
        })?
    }
}
