//! Control connections: framed record I/O over a reliable ordered byte
//! stream.
//!
//! Each connection runs background pump tasks on the context loop runtime:
//! a frame reader that pulls records off the wire as they arrive, a matcher
//! that pairs buffered frames with posted read requests in FIFO order, and a
//! writer that drains a FIFO queue of (frame, completion) writes.
//!
//! The pumps give the channel two properties the state machines rely on:
//! requests complete strictly in posting order, and a broken or closed peer
//! is detected eagerly — the error hook fires even when no read is pending.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::{GpulinkError, Result};
use crate::protocol::codec::{self, FRAME_HEADER_SIZE};

/// Byte stream usable as a control connection: TCP or Unix sockets in
/// production, in-memory duplex pipes in tests.
pub trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlStream for T {}

pub(crate) type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;
pub(crate) type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Invoked when the connection fails with no request pending.
pub(crate) type ErrorHook = Box<dyn Fn(GpulinkError) + Send + Sync + 'static>;

struct WriteRequest {
    frame: Vec<u8>,
    done: WriteCallback,
}

pub(crate) struct ControlConnection {
    read_tx: mpsc::UnboundedSender<ReadCallback>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlConnection {
    /// Wrap a byte stream. Must be called from within the context loop
    /// runtime: the pump tasks are spawned onto it.
    pub(crate) fn new(
        stream: Box<dyn ControlStream>,
        max_frame_payload: usize,
        on_error: ErrorHook,
    ) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(frame_reader(rd, frame_tx, max_frame_payload));
        tokio::spawn(read_matcher(
            read_rx,
            frame_rx,
            shutdown_rx.clone(),
            reader,
            on_error,
        ));
        tokio::spawn(writer_pump(wr, write_rx, shutdown_rx));

        Self {
            read_tx,
            write_tx,
            shutdown_tx,
        }
    }

    /// Post a read of one record frame; `cb` runs on the loop with the frame
    /// bytes or the connection failure. Reads complete in posting order.
    ///
    /// Posting onto a connection whose loop runtime is already gone drops
    /// the callback; by then the owning channel has drained every pending
    /// operation with an error.
    pub(crate) fn post_read(&self, cb: ReadCallback) {
        if self.read_tx.send(cb).is_err() {
            tracing::debug!("read posted after connection pumps exited");
        }
    }

    /// Queue one frame for writing; `done` runs on the loop once the write
    /// has been flushed (or failed). Writes are issued in posting order.
    pub(crate) fn post_write(&self, frame: Vec<u8>, done: WriteCallback) {
        let req = WriteRequest { frame, done };
        if self.write_tx.send(req).is_err() {
            tracing::debug!("write posted after connection pumps exited");
        }
    }

    /// Stop the pumps and shut the write half so the peer sees EOF. Pending
    /// and future requests complete with a `Connection` error. Idempotent.
    pub(crate) fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R, max_payload: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    rd.read_exact(&mut header)
        .await
        .map_err(|e| GpulinkError::connection(format!("control read: {e}")))?;
    let (_, payload_len) = codec::decode_frame_header(&header, max_payload)
        .map_err(|e| GpulinkError::connection(format!("control stream corrupt: {e}")))?;
    let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload_len];
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    rd.read_exact(&mut frame[FRAME_HEADER_SIZE..])
        .await
        .map_err(|e| GpulinkError::connection(format!("control read: {e}")))?;
    Ok(frame)
}

/// Pull frames off the wire until the stream fails or the matcher goes
/// away. The terminal error is forwarded as the last message.
async fn frame_reader(
    mut rd: ReadHalf<Box<dyn ControlStream>>,
    frame_tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
    max_payload: usize,
) {
    loop {
        match read_frame(&mut rd, max_payload).await {
            Ok(frame) => {
                if frame_tx.send(Ok(frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = frame_tx.send(Err(e));
                return;
            }
        }
    }
}

async fn read_matcher(
    mut read_rx: mpsc::UnboundedReceiver<ReadCallback>,
    mut frame_rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    reader: tokio::task::JoinHandle<()>,
    on_error: ErrorHook,
) {
    let mut pending: VecDeque<ReadCallback> = VecDeque::new();
    let mut buffered: VecDeque<Vec<u8>> = VecDeque::new();
    let mut failure: Option<GpulinkError> = None;

    loop {
        tokio::select! {
            req = read_rx.recv() => match req {
                Some(cb) => pending.push_back(cb),
                None => break,
            },
            frame = frame_rx.recv(), if failure.is_none() => match frame {
                Some(Ok(frame)) => buffered.push_back(frame),
                Some(Err(e)) => {
                    failure = Some(e.clone());
                    on_error(e);
                }
                None => {
                    let e = GpulinkError::connection("control reader task ended");
                    failure = Some(e.clone());
                    on_error(e);
                }
            },
            _ = shutdown_rx.changed(), if failure.is_none() => {
                failure = Some(GpulinkError::connection("connection locally closed"));
                reader.abort();
            }
        }

        if let Some(e) = &failure {
            while let Some(cb) = pending.pop_front() {
                cb(Err(e.clone()));
            }
        } else {
            while !pending.is_empty() && !buffered.is_empty() {
                let cb = pending.pop_front().expect("pending nonempty");
                let frame = buffered.pop_front().expect("buffered nonempty");
                cb(Ok(frame));
            }
        }
    }
    reader.abort();
}

async fn writer_pump(
    mut wr: WriteHalf<Box<dyn ControlStream>>,
    mut write_rx: mpsc::UnboundedReceiver<WriteRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failure: Option<GpulinkError> = None;

    loop {
        tokio::select! {
            req = write_rx.recv() => match req {
                Some(WriteRequest { frame, done }) => {
                    if let Some(e) = &failure {
                        done(Err(e.clone()));
                        continue;
                    }
                    let res = write_one(&mut wr, &frame, &mut shutdown_rx).await;
                    if let Err(e) = &res {
                        failure = Some(e.clone());
                    }
                    done(res);
                }
                None => break,
            },
            _ = shutdown_rx.changed(), if failure.is_none() => {
                failure = Some(GpulinkError::connection("connection locally closed"));
                let _ = wr.shutdown().await;
            }
        }
    }
    let _ = wr.shutdown().await;
}

async fn write_one(
    wr: &mut WriteHalf<Box<dyn ControlStream>>,
    frame: &[u8],
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        res = async {
            wr.write_all(frame)
                .await
                .map_err(|e| GpulinkError::connection(format!("control write: {e}")))?;
            wr.flush()
                .await
                .map_err(|e| GpulinkError::connection(format!("control flush: {e}")))
        } => res,
        _ = shutdown_rx.changed() => {
            Err(GpulinkError::connection("connection locally closed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::record::Reply;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn pair(
        on_error_a: ErrorHook,
        on_error_b: ErrorHook,
    ) -> (ControlConnection, ControlConnection) {
        let (a, b) = tokio::io::duplex(1024);
        (
            ControlConnection::new(Box::new(a), 4096, on_error_a),
            ControlConnection::new(Box::new(b), 4096, on_error_b),
        )
    }

    fn noop_hook() -> ErrorHook {
        Box::new(|_| {})
    }

    fn reply_frame(tag: u8) -> Vec<u8> {
        codec::encode_reply(&Reply {
            stop_event_handle: vec![tag; 8],
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_then_read_roundtrip() {
        let (a, b) = pair(noop_hook(), noop_hook());
        let (done_tx, done_rx) = std_mpsc::channel();
        a.post_write(reply_frame(7), Box::new(move |r| done_tx.send(r).unwrap()));

        let (tx, rx) = std_mpsc::channel();
        b.post_read(Box::new(move |r| tx.send(r).unwrap()));

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let reply = codec::decode_reply(&frame).unwrap();
        assert_eq!(reply.stop_event_handle, vec![7; 8]);
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_complete_in_post_order() {
        let (a, b) = pair(noop_hook(), noop_hook());
        for tag in 0..8u8 {
            a.post_write(reply_frame(tag), Box::new(|_| {}));
        }
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            b.post_read(Box::new(move |r| tx.send(r).unwrap()));
        }
        for tag in 0..8u8 {
            let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            let reply = codec::decode_reply(&frame).unwrap();
            assert_eq!(reply.stop_event_handle, vec![tag; 8], "out of order");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_buffered_before_read_posted() {
        let (a, b) = pair(noop_hook(), noop_hook());
        a.post_write(reply_frame(1), Box::new(|_| {}));
        a.post_write(reply_frame(2), Box::new(|_| {}));
        // Give the frames time to land in b's buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            b.post_read(Box::new(move |r| tx.send(r).unwrap()));
        }
        for tag in 1..=2u8 {
            let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert_eq!(
                codec::decode_reply(&frame).unwrap().stop_event_handle,
                vec![tag; 8]
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_drop_fires_error_hook_eagerly() {
        let (hook_tx, hook_rx) = std_mpsc::channel();
        let (a, b) = pair(
            noop_hook(),
            Box::new(move |e| {
                let _ = hook_tx.send(e);
            }),
        );
        drop(a);
        let e = hook_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(e, GpulinkError::Connection { .. }), "{e}");
        // Reads posted afterwards observe the failure.
        let (tx, rx) = std_mpsc::channel();
        b.post_read(Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_fails_pending_reads() {
        let (_a, b) = pair(noop_hook(), noop_hook());
        let (tx, rx) = std_mpsc::channel();
        b.post_read(Box::new(move |r| tx.send(r).unwrap()));
        b.close();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
        b.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_propagates_eof_to_peer() {
        let (hook_tx, hook_rx) = std_mpsc::channel();
        let (a, b) = tokio::io::duplex(1024);
        let a = ControlConnection::new(Box::new(a), 4096, noop_hook());
        let _b = ControlConnection::new(
            Box::new(b),
            4096,
            Box::new(move |e| {
                let _ = hook_tx.send(e);
            }),
        );
        a.close();
        let e = hook_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(e, GpulinkError::Connection { .. }), "{e}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a = ControlConnection::new(Box::new(a), 4096, noop_hook());
        let b = ControlConnection::new(Box::new(b), 16, noop_hook());
        // Frame legal for a's cap but beyond b's.
        a.post_write(reply_frame(9), Box::new(|_| {}));
        let (tx, rx) = std_mpsc::channel();
        b.post_read(Box::new(move |r| tx.send(r).unwrap()));
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(res, Err(GpulinkError::Connection { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_after_failure_reports_error() {
        let (a, b) = pair(noop_hook(), noop_hook());
        drop(b);
        a.close();
        let (tx, rx) = std_mpsc::channel();
        a.post_write(reply_frame(0), Box::new(|_| {}));
        a.post_write(reply_frame(1), Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
    }
}
