//! Consumer-side operation state machine.
//!
//! A recv decodes the peer's descriptor, waits on the start event, copies
//! device-to-device out of the imported mapping, records its stop event,
//! fires the callback, sends the stop event back on the reply connection,
//! and then holds the op — and with it the stop event — alive until the
//! peer's ack confirms the event is no longer being waited on.

use std::sync::Arc;

use crate::channel::queue::{OpQueue, Operation};
use crate::channel::{attempt_transition, set_error, ChannelInner, ChannelState};
use crate::channel::{DeviceBuffer, Effects, TransferCallback};
use crate::device::{DeviceEvent, DeviceGuard};
use crate::error::{GpulinkError, Result};
use crate::protocol::codec;
use crate::protocol::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RecvState {
    Uninitialized,
    ReadingAck,
    Finished,
}

pub(crate) struct RecvOp {
    seq: u64,
    device: i32,
    ptr: u64,
    length: usize,
    stream: u64,
    allocation_id: String,
    mem_handle: Vec<u8>,
    offset: u64,
    start_ev_handle: Vec<u8>,
    stop_ev: DeviceEvent,
    callback: Option<TransferCallback>,
    done_reading_ack: bool,
    opened_mapping: bool,
    state: RecvState,
}

impl Operation for RecvOp {
    type State = RecvState;
    const FINISHED: RecvState = RecvState::Finished;

    fn seq(&self) -> u64 {
        self.seq
    }
    fn state(&self) -> RecvState {
        self.state
    }
    fn set_state(&mut self, state: RecvState) {
        self.state = state;
    }
}

fn recv_queue(st: &mut ChannelState) -> &mut OpQueue<RecvOp> {
    &mut st.recv_ops
}

impl ChannelInner {
    /// Entry point, on the loop: decode the descriptor, enqueue the op,
    /// advance it. All failures surface through `callback`.
    pub(crate) fn recv_from_loop(
        self: &Arc<Self>,
        descriptor: Vec<u8>,
        buffer: DeviceBuffer,
        callback: TransferCallback,
    ) {
        self.with_state(|st, fx| {
            if let Some(e) = &st.error {
                fx.callback(Some(callback), Err(e.clone()));
                return;
            }
            let descriptor = match codec::decode_descriptor(&descriptor) {
                Ok(d) => d,
                Err(e) => {
                    tracing::debug!(channel = %st.name, %e, "rejecting malformed descriptor");
                    fx.callback(Some(callback), Err(e));
                    // Garbage on the descriptor path means the two sides no
                    // longer agree on the protocol; shut down as close() would.
                    set_error(st, fx, GpulinkError::ChannelClosed);
                    return;
                }
            };
            let driver = Arc::clone(self.context.driver());
            let device = match driver.device_for_pointer(buffer.ptr) {
                Ok(d) => d,
                Err(e) => {
                    fx.callback(Some(callback), Err(e));
                    return;
                }
            };
            let stop_ev = match DeviceEvent::new(driver.as_ref(), device, true) {
                Ok(ev) => ev,
                Err(e) => {
                    fx.callback(Some(callback), Err(e));
                    return;
                }
            };

            let seq = st.recv_ops.push_back_with(|seq| RecvOp {
                seq,
                device,
                ptr: buffer.ptr,
                length: buffer.length,
                stream: buffer.stream,
                allocation_id: descriptor.allocation_id,
                mem_handle: descriptor.mem_handle,
                offset: descriptor.offset,
                start_ev_handle: descriptor.start_event_handle,
                stop_ev,
                callback: Some(callback),
                done_reading_ack: false,
                opened_mapping: false,
                state: RecvState::Uninitialized,
            });
            tracing::debug!(channel = %st.name, seq, length = buffer.length, "recv submitted");
            self.advance_recv(st, fx, seq);
        });
    }

    pub(crate) fn advance_recv(
        self: &Arc<Self>,
        st: &mut ChannelState,
        fx: &mut Effects,
        from_seq: u64,
    ) {
        let mut seq = from_seq;
        loop {
            let mut fired = false;
            while self.advance_recv_one(st, fx, seq) {
                fired = true;
            }
            if !fired {
                break;
            }
            seq += 1;
            if st.recv_ops.get(seq).is_none() {
                break;
            }
        }
    }

    pub(crate) fn advance_all_recv(self: &Arc<Self>, st: &mut ChannelState, fx: &mut Effects) {
        let (lo, hi) = st.recv_ops.seq_bounds();
        for seq in lo..hi {
            while self.advance_recv_one(st, fx, seq) {}
        }
    }

    /// One pass over the transition table; true if any transition fired.
    fn advance_recv_one(self: &Arc<Self>, st: &mut ChannelState, fx: &mut Effects, seq: u64) -> bool {
        use RecvState::{Finished, ReadingAck, Uninitialized};

        let Some(op) = st.recv_ops.get(seq) else {
            return false;
        };
        let prev = st.recv_ops.prev_state(seq);
        let errored = st.error.is_some();
        let done_reading_ack = op.done_reading_ack;

        if attempt_transition(
            st,
            fx,
            recv_queue,
            seq,
            Uninitialized,
            Finished,
            errored,
            |st, fx| {
                // The copy phase may have opened the mapping and then failed.
                self.release_recv_mapping(st, seq);
                self.call_recv_callback(st, fx, seq);
                Ok(())
            },
        ) {
            return true;
        }

        // Gated on the predecessor so writes on the reply connection and
        // reads on the ack connection are issued in submission order.
        if attempt_transition(
            st,
            fx,
            recv_queue,
            seq,
            Uninitialized,
            ReadingAck,
            !errored && prev >= ReadingAck,
            |st, fx| {
                self.wait_start_copy_record_stop(st, seq)?;
                if !self.context.config().defer_recv_callback_until_ack {
                    self.call_recv_callback(st, fx, seq);
                }
                self.write_reply(st, seq)?;
                self.read_ack(st, seq);
                Ok(())
            },
        ) {
            return true;
        }

        // Exists to keep the op (and thus its stop event) alive until the
        // peer acknowledged having finished waiting on it.
        attempt_transition(
            st,
            fx,
            recv_queue,
            seq,
            ReadingAck,
            Finished,
            done_reading_ack,
            |st, fx| {
                self.release_recv_mapping(st, seq);
                self.call_recv_callback(st, fx, seq);
                Ok(())
            },
        )
    }

    /// Mark every outstanding ack read as done so the error-path
    /// transitions can fire without waiting for the connection to answer.
    pub(crate) fn cancel_pending_recv_io(&self, st: &mut ChannelState) {
        let (lo, hi) = st.recv_ops.seq_bounds();
        for seq in lo..hi {
            if let Some(op) = st.recv_ops.get_mut(seq) {
                if op.state == RecvState::ReadingAck && !op.done_reading_ack {
                    op.done_reading_ack = true;
                }
            }
        }
    }

    /// Actions (a)–(d): wait on the peer's start event, map its allocation,
    /// enqueue the device-to-device copy, record the stop event.
    fn wait_start_copy_record_stop(&self, st: &mut ChannelState, seq: u64) -> Result<()> {
        let driver = Arc::clone(self.context.driver());
        let (device, dst, length, stream, allocation_id, mem_handle, offset, start_handle) = {
            let op = st.recv_ops.get(seq).expect("op in transition");
            (
                op.device,
                op.ptr,
                op.length,
                op.stream,
                op.allocation_id.clone(),
                op.mem_handle.clone(),
                op.offset,
                op.start_ev_handle.clone(),
            )
        };
        tracing::trace!(channel = %st.name, seq, length, "copying payload");

        let start_ev = DeviceEvent::from_handle(driver.as_ref(), device, &start_handle)?;
        start_ev.wait(stream, device)?;

        let base = self
            .context
            .with_cache(|cache| cache.open(driver.as_ref(), &allocation_id, &mem_handle, device))?;
        st.recv_ops
            .get_mut(seq)
            .expect("op in transition")
            .opened_mapping = true;

        if length > 0 {
            let _guard = DeviceGuard::new(driver.as_ref(), device)?;
            unsafe {
                driver.memcpy_dtod_async(dst, base + offset, length, stream)?;
            }
        }

        let op = st.recv_ops.get(seq).expect("op in transition");
        op.stop_ev.record(stream)?;
        tracing::trace!(channel = %st.name, seq, "done copying payload");
        Ok(())
    }

    fn call_recv_callback(&self, st: &mut ChannelState, fx: &mut Effects, seq: u64) {
        let result = match &st.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        if let Some(op) = st.recv_ops.get_mut(seq) {
            fx.callback(op.callback.take(), result);
        }
    }

    fn write_reply(self: &Arc<Self>, st: &mut ChannelState, seq: u64) -> Result<()> {
        tracing::trace!(channel = %st.name, seq, "writing reply");
        let op = st.recv_ops.get(seq).expect("op in transition");
        let frame = codec::encode_reply(&Reply {
            stop_event_handle: op.stop_ev.serialized_handle()?,
        })?;
        let inner = Arc::clone(self);
        st.reply_conn.post_write(
            frame,
            Box::new(move |res| {
                if let Err(e) = res {
                    inner.with_state(|st, fx| set_error(st, fx, e));
                }
            }),
        );
        Ok(())
    }

    fn read_ack(self: &Arc<Self>, st: &mut ChannelState, seq: u64) {
        tracing::trace!(channel = %st.name, seq, "reading ack");
        let inner = Arc::clone(self);
        st.ack_conn.post_read(Box::new(move |res| {
            inner.with_state(|st, fx| {
                let Some(op) = st.recv_ops.get_mut(seq) else {
                    return;
                };
                tracing::trace!(channel = %st.name, seq, "done reading ack");
                op.done_reading_ack = true;
                if let Err(e) = res.and_then(|frame| codec::decode_ack(&frame).map(|_| ())) {
                    set_error(st, fx, e);
                }
                inner.advance_recv(st, fx, seq);
            });
        }));
    }

    /// Drop this op's reference on the shared IPC mapping. Close failures
    /// are logged, not propagated: they must not wedge the op's retirement.
    fn release_recv_mapping(&self, st: &mut ChannelState, seq: u64) {
        let Some(op) = st.recv_ops.get_mut(seq) else {
            return;
        };
        if !op.opened_mapping {
            return;
        }
        op.opened_mapping = false;
        let allocation_id = op.allocation_id.clone();
        let device = op.device;
        let driver = Arc::clone(self.context.driver());
        self.context.with_cache(|cache| {
            if let Err(e) = cache.close(driver.as_ref(), &allocation_id, device) {
                tracing::warn!(%allocation_id, device, "ipc mapping close failed: {e}");
            }
        });
    }
}
