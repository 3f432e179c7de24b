/// Control records exchanged between the two endpoints of a channel.
///
/// Tensor data does NOT flow through these records. The payload moves over
/// the GPU interconnect via an imported IPC mapping; the control streams only
/// carry these small fixed records.
///
/// A `Descriptor` travels out-of-band (the caller conveys the encoded bytes
/// to the peer); `Reply` and `Ack` travel on the two control streams.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// `"<process-identifier>_<buffer-id>"` of the source allocation.
    pub allocation_id: String,
    /// Exported IPC handle of the source allocation's base pointer.
    pub mem_handle: Vec<u8>,
    /// Byte offset of the source pointer within its allocation.
    pub offset: u64,
    /// Exported handle of the event recorded after the producer's pending
    /// work on the source buffer.
    pub start_event_handle: Vec<u8>,
}

/// Consumer-to-producer notification that the copy has been submitted,
/// carrying the stop event that gates source-buffer reuse.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct Reply {
    pub stop_event_handle: Vec<u8>,
}

/// Producer-to-consumer notification that the stop event has been waited on
/// and may be retired.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct Ack;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let d = Descriptor {
            allocation_id: "4242-0_17".into(),
            mem_handle: vec![0xAB; 64],
            offset: 2048,
            start_event_handle: vec![0xCD; 64],
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&d).unwrap();
        let back = rkyv::from_bytes::<Descriptor, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_reply_roundtrip() {
        let r = Reply {
            stop_event_handle: vec![7; 64],
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&r).unwrap();
        let back = rkyv::from_bytes::<Reply, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_descriptor_encoding_is_deterministic() {
        let d = Descriptor {
            allocation_id: "1-0_3".into(),
            mem_handle: vec![1; 64],
            offset: 0,
            start_event_handle: vec![2; 64],
        };
        let a = rkyv::to_bytes::<rkyv::rancor::Error>(&d).unwrap();
        let b = rkyv::to_bytes::<rkyv::rancor::Error>(&d.clone()).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
