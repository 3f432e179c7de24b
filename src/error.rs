pub type Result<T> = std::result::Result<T, GpulinkError>;

/// Channel-level errors.
///
/// The enum is `Clone` because the first error a channel hits becomes *the*
/// channel error and is handed to every pending callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpulinkError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("control connection failed: {reason}")]
    Connection { reason: String },

    #[error("device driver call failed: {reason}")]
    Device { reason: String },

    #[error("malformed descriptor: {reason}")]
    MalformedDescriptor { reason: String },

    #[error("ipc mapping failed: {reason}")]
    IpcMapFailed { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl GpulinkError {
    /// Create a `Connection` error with just a message.
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(reason: impl Into<String>) -> Self {
        Self::Device {
            reason: reason.into(),
        }
    }

    /// Create a `MalformedDescriptor` error with just a message.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            reason: reason.into(),
        }
    }

    /// Create an `IpcMapFailed` error with just a message.
    pub fn ipc_map(reason: impl Into<String>) -> Self {
        Self::IpcMapFailed {
            reason: reason.into(),
        }
    }

    /// Create an `Internal` error with just a message.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_closed_display() {
        assert_eq!(GpulinkError::ChannelClosed.to_string(), "channel closed");
    }

    #[test]
    fn test_connection_display() {
        let e = GpulinkError::connection("peer hung up");
        assert_eq!(
            e.to_string(),
            "control connection failed: peer hung up"
        );
    }

    #[test]
    fn test_all_variants_display() {
        let errors = vec![
            GpulinkError::ChannelClosed,
            GpulinkError::connection("reset"),
            GpulinkError::device("cuMemcpyDtoDAsync failed"),
            GpulinkError::malformed("bad tag"),
            GpulinkError::ipc_map("unknown allocation"),
            GpulinkError::internal("loop terminated"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }

    #[test]
    fn test_clone_preserves_kind() {
        let e = GpulinkError::ipc_map("x");
        assert_eq!(e.clone(), e);
    }
}
