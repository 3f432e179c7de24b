//! gpulink: a point-to-point tensor-transfer channel that moves GPU memory
//! between two processes on the same host over the driver's inter-process
//! memory and event handles.
//!
//! The producer's `send` hands back an opaque descriptor synchronously; the
//! caller conveys it to the consumer out-of-band, whose `recv` copies
//! directly out of the imported peer allocation — no host staging. Start and
//! stop events bracket the copy to give cross-process happens-before, and
//! two small control streams (reply, ack) carry the completion handshake
//! that gates source-buffer reuse.

pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod executor;
pub(crate) mod ipc;
pub mod protocol;
pub mod transport;

pub use channel::{DeviceBuffer, IpcChannel, TransferCallback};
pub use config::ChannelConfig;
pub use context::Context;
pub use device::{DeviceDriver, DeviceEvent, DeviceGuard, HostDriver, RawDeviceEvent};
pub use error::{GpulinkError, Result};
pub use protocol::{Ack, Descriptor, Reply};
pub use transport::ControlStream;

#[cfg(feature = "cuda")]
pub use device::CudaDriver;
