//! Producer-side operation state machine.
//!
//! A send records a start event on the user's stream, hands back a
//! descriptor synchronously, then reads the peer's reply off the reply
//! connection, waits on the peer's stop event (gating source reuse), fires
//! the callback, and writes an ack.

use std::sync::Arc;

use crate::channel::queue::{OpQueue, Operation};
use crate::channel::{attempt_transition, set_error, ChannelInner, ChannelState};
use crate::channel::{DeviceBuffer, Effects, TransferCallback};
use crate::device::{DeviceEvent, DeviceGuard};
use crate::error::Result;
use crate::protocol::codec;
use crate::protocol::{Ack, Descriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SendState {
    Uninitialized,
    ReadingReply,
    Finished,
}

pub(crate) struct SendOp {
    seq: u64,
    device: i32,
    ptr: u64,
    stream: u64,
    start_ev: DeviceEvent,
    callback: Option<TransferCallback>,
    stop_ev_handle: Vec<u8>,
    done_reading_reply: bool,
    state: SendState,
}

impl Operation for SendOp {
    type State = SendState;
    const FINISHED: SendState = SendState::Finished;

    fn seq(&self) -> u64 {
        self.seq
    }
    fn state(&self) -> SendState {
        self.state
    }
    fn set_state(&mut self, state: SendState) {
        self.state = state;
    }
}

fn send_queue(st: &mut ChannelState) -> &mut OpQueue<SendOp> {
    &mut st.send_ops
}

impl ChannelInner {
    /// Entry point, on the loop: enqueue the op, advance it, and build the
    /// descriptor for the caller.
    pub(crate) fn send_from_loop(
        self: &Arc<Self>,
        buffer: DeviceBuffer,
        callback: TransferCallback,
    ) -> Result<Vec<u8>> {
        self.with_state(|st, fx| {
            if let Some(e) = &st.error {
                return Err(e.clone());
            }
            let driver = Arc::clone(self.context.driver());
            let device = driver.device_for_pointer(buffer.ptr)?;

            // The start event is recorded before the op becomes visible, so
            // the descriptor built below is already meaningful.
            let start_ev = DeviceEvent::new(driver.as_ref(), device, true)?;
            start_ev.record(buffer.stream)?;

            let seq = st.send_ops.push_back_with(|seq| SendOp {
                seq,
                device,
                ptr: buffer.ptr,
                stream: buffer.stream,
                start_ev,
                callback: Some(callback),
                stop_ev_handle: Vec::new(),
                done_reading_reply: false,
                state: SendState::Uninitialized,
            });
            tracing::debug!(channel = %st.name, seq, length = buffer.length, "send submitted");
            self.advance_send(st, fx, seq);

            // The op is in flight now; a failure to build its descriptor
            // poisons the channel and the pending callback reports it.
            match self.make_send_descriptor(st, seq) {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    set_error(st, fx, e.clone());
                    Err(e)
                }
            }
        })
    }

    fn make_send_descriptor(&self, st: &ChannelState, seq: u64) -> Result<Vec<u8>> {
        let op = st.send_ops.get(seq).expect("op just pushed");
        let driver = self.context.driver();
        let _guard = DeviceGuard::new(driver.as_ref(), op.device)?;
        let (base, _size) = driver.address_range(op.ptr)?;
        let buffer_id = driver.buffer_id(base)?;
        let descriptor = Descriptor {
            allocation_id: format!("{}_{buffer_id}", self.context.process_identifier()),
            mem_handle: driver.export_mem_handle(base)?,
            offset: op.ptr - base,
            start_event_handle: op.start_ev.serialized_handle()?,
        };
        codec::encode_descriptor(&descriptor)
    }

    pub(crate) fn advance_send(
        self: &Arc<Self>,
        st: &mut ChannelState,
        fx: &mut Effects,
        from_seq: u64,
    ) {
        let mut seq = from_seq;
        loop {
            let mut fired = false;
            while self.advance_send_one(st, fx, seq) {
                fired = true;
            }
            // A successor can only unblock when this op changed.
            if !fired {
                break;
            }
            seq += 1;
            if st.send_ops.get(seq).is_none() {
                break;
            }
        }
    }

    pub(crate) fn advance_all_send(self: &Arc<Self>, st: &mut ChannelState, fx: &mut Effects) {
        let (lo, hi) = st.send_ops.seq_bounds();
        for seq in lo..hi {
            while self.advance_send_one(st, fx, seq) {}
        }
    }

    /// One pass over the transition table; true if any transition fired.
    fn advance_send_one(self: &Arc<Self>, st: &mut ChannelState, fx: &mut Effects, seq: u64) -> bool {
        use SendState::{Finished, ReadingReply, Uninitialized};

        let Some(op) = st.send_ops.get(seq) else {
            return false;
        };
        let prev = st.send_ops.prev_state(seq);
        let errored = st.error.is_some();
        let done_reading_reply = op.done_reading_reply;

        if attempt_transition(
            st,
            fx,
            send_queue,
            seq,
            Uninitialized,
            Finished,
            errored,
            |st, fx| {
                self.call_send_callback(st, fx, seq);
                Ok(())
            },
        ) {
            return true;
        }

        // Gated on the predecessor so reads are posted on the reply
        // connection in submission order.
        if attempt_transition(
            st,
            fx,
            send_queue,
            seq,
            Uninitialized,
            ReadingReply,
            !errored && prev >= ReadingReply,
            |st, _fx| {
                self.read_reply(st, seq);
                Ok(())
            },
        ) {
            return true;
        }

        if attempt_transition(
            st,
            fx,
            send_queue,
            seq,
            ReadingReply,
            Finished,
            errored && done_reading_reply,
            |st, fx| {
                self.call_send_callback(st, fx, seq);
                Ok(())
            },
        ) {
            return true;
        }

        // Gated on the predecessor so writes are issued on the ack
        // connection in submission order.
        attempt_transition(
            st,
            fx,
            send_queue,
            seq,
            ReadingReply,
            Finished,
            !errored && done_reading_reply && prev >= Finished,
            |st, fx| {
                self.wait_on_stop_event(st, seq)?;
                self.call_send_callback(st, fx, seq);
                self.write_ack(st, seq)
            },
        )
    }

    /// Mark every outstanding reply read as done so the error-path
    /// transitions can fire without waiting for the connection to answer.
    pub(crate) fn cancel_pending_send_io(&self, st: &mut ChannelState) {
        let (lo, hi) = st.send_ops.seq_bounds();
        for seq in lo..hi {
            if let Some(op) = st.send_ops.get_mut(seq) {
                if op.state == SendState::ReadingReply && !op.done_reading_reply {
                    op.done_reading_reply = true;
                }
            }
        }
    }

    fn read_reply(self: &Arc<Self>, st: &mut ChannelState, seq: u64) {
        tracing::trace!(channel = %st.name, seq, "reading reply");
        let inner = Arc::clone(self);
        st.reply_conn.post_read(Box::new(move |res| {
            inner.with_state(|st, fx| {
                let Some(op) = st.send_ops.get_mut(seq) else {
                    return;
                };
                tracing::trace!(channel = %st.name, seq, "done reading reply");
                op.done_reading_reply = true;
                match res.and_then(|frame| codec::decode_reply(&frame)) {
                    Ok(reply) => op.stop_ev_handle = reply.stop_event_handle,
                    Err(e) => set_error(st, fx, e),
                }
                inner.advance_send(st, fx, seq);
            });
        }));
    }

    /// Import the peer's stop event and make the source stream wait on it:
    /// work enqueued on the stream after the callback cannot overtake the
    /// peer's read of the buffer.
    fn wait_on_stop_event(&self, st: &ChannelState, seq: u64) -> Result<()> {
        let op = st.send_ops.get(seq).expect("op in transition");
        let driver = self.context.driver();
        let stop_ev = DeviceEvent::from_handle(driver.as_ref(), op.device, &op.stop_ev_handle)?;
        stop_ev.wait(op.stream, op.device)
    }

    fn call_send_callback(&self, st: &mut ChannelState, fx: &mut Effects, seq: u64) {
        let result = match &st.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        if let Some(op) = st.send_ops.get_mut(seq) {
            fx.callback(op.callback.take(), result);
        }
    }

    fn write_ack(self: &Arc<Self>, st: &mut ChannelState, seq: u64) -> Result<()> {
        tracing::trace!(channel = %st.name, seq, "writing ack");
        let frame = codec::encode_ack(&Ack)?;
        let inner = Arc::clone(self);
        st.ack_conn.post_write(
            frame,
            Box::new(move |res| {
                if let Err(e) = res {
                    inner.with_state(|st, fx| set_error(st, fx, e));
                }
            }),
        );
        Ok(())
    }
}
