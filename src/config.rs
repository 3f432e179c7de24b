//! Runtime-configurable tuning parameters for gpulink.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `GPULINK_`) or by constructing a custom `ChannelConfig`.

/// Tuning parameters for channels created on a context.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Fire the recv callback only after the peer has acknowledged the stop
    /// event, instead of right after the device-to-device copy is submitted.
    /// Stricter completion semantics at the cost of one control round-trip
    /// of latency.
    pub defer_recv_callback_until_ack: bool,

    /// Upper bound on a single control record frame accepted from the wire.
    pub max_control_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            defer_recv_callback_until_ack: false,
            max_control_frame_bytes: 4096,
        }
    }
}

impl ChannelConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GPULINK_DEFER_RECV_CALLBACK` (`0`/`1`)
    /// - `GPULINK_MAX_CONTROL_FRAME_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GPULINK_DEFER_RECV_CALLBACK") {
            cfg.defer_recv_callback_until_ack = v == "1";
        }
        if let Ok(v) = std::env::var("GPULINK_MAX_CONTROL_FRAME_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_control_frame_bytes = n;
            }
        }

        cfg
    }
}
