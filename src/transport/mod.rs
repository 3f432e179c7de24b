mod connection;

pub use connection::ControlStream;

pub(crate) use connection::{ControlConnection, ErrorHook};
