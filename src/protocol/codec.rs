//! Framed encoding of the three control records.
//!
//! Wire layout: `[header][rkyv payload]`, where the 8-byte header is
//!
//! ```text
//! [0..4] payload_length: u32 LE
//! [4]    record type: u8
//! [5]    codec version: u8
//! [6..8] reserved: u16 (must be 0)
//! ```
//!
//! Encoding is deterministic: the same logical record encodes byte-for-byte
//! identically across channel instances of the same version.

use crate::error::{GpulinkError, Result};
use crate::protocol::record::{Ack, Descriptor, Reply};

/// Size of the wire header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Current codec version, bumped on any layout change.
pub const CODEC_VERSION: u8 = 1;

/// Type tag for the record that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Descriptor = 0,
    Reply = 1,
    Ack = 2,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordType::Descriptor),
            1 => Some(RecordType::Reply),
            2 => Some(RecordType::Ack),
            _ => None,
        }
    }
}

/// Parse a frame header and return `(record type, payload length)`.
///
/// `max_payload` bounds the length accepted off the wire.
pub(crate) fn decode_frame_header(
    header: &[u8; FRAME_HEADER_SIZE],
    max_payload: usize,
) -> Result<(RecordType, usize)> {
    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let record_type = RecordType::from_u8(header[4])
        .ok_or_else(|| GpulinkError::malformed(format!("unknown record type {}", header[4])))?;
    if header[5] != CODEC_VERSION {
        return Err(GpulinkError::malformed(format!(
            "codec version mismatch: got {}, expected {CODEC_VERSION}",
            header[5]
        )));
    }
    if header[6] != 0 || header[7] != 0 {
        return Err(GpulinkError::malformed("nonzero reserved header bytes"));
    }
    if payload_len > max_payload {
        return Err(GpulinkError::malformed(format!(
            "record payload too large: {payload_len} > {max_payload}"
        )));
    }
    Ok((record_type, payload_len))
}

fn frame(record_type: RecordType, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(GpulinkError::internal(format!(
            "record payload too large for framed header: {} bytes",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(record_type as u8);
    buf.push(CODEC_VERSION);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a full frame into its type tag and payload. Used on frames already
/// pulled off the wire, so the only length bound is the `u32` field itself.
fn split_frame(buf: &[u8]) -> Result<(RecordType, &[u8])> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(GpulinkError::malformed(format!(
            "frame too short: {} < {FRAME_HEADER_SIZE}",
            buf.len()
        )));
    }
    let header: &[u8; FRAME_HEADER_SIZE] = buf[..FRAME_HEADER_SIZE]
        .try_into()
        .map_err(|_| GpulinkError::malformed("header slice length mismatch"))?;
    let (record_type, payload_len) = decode_frame_header(header, u32::MAX as usize)?;
    let payload_end = FRAME_HEADER_SIZE + payload_len;
    if buf.len() != payload_end {
        return Err(GpulinkError::malformed(format!(
            "frame length mismatch: {} != {payload_end}",
            buf.len()
        )));
    }
    Ok((record_type, &buf[FRAME_HEADER_SIZE..payload_end]))
}

pub fn encode_descriptor(d: &Descriptor) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(d)
        .map_err(|e| GpulinkError::internal(format!("descriptor encode failed: {e}")))?;
    frame(RecordType::Descriptor, &payload)
}

/// Decode a descriptor blob handed in by the caller.
///
/// Anything wrong with the blob — wrong tag, truncation, trailing bytes, an
/// undecodable payload — is a `MalformedDescriptor` error.
pub fn decode_descriptor(buf: &[u8]) -> Result<Descriptor> {
    let (record_type, payload) = split_frame(buf)?;
    if record_type != RecordType::Descriptor {
        return Err(GpulinkError::malformed(format!(
            "expected descriptor record, got {record_type:?}"
        )));
    }
    rkyv::from_bytes::<Descriptor, rkyv::rancor::Error>(payload)
        .map_err(|e| GpulinkError::malformed(format!("descriptor payload: {e}")))
}

pub fn encode_reply(r: &Reply) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(r)
        .map_err(|e| GpulinkError::internal(format!("reply encode failed: {e}")))?;
    frame(RecordType::Reply, &payload)
}

/// Decode a reply frame read off the reply control stream.
///
/// The stream is trusted; a record that does not parse means the stream is
/// corrupt, which is a `Connection` error.
pub fn decode_reply(buf: &[u8]) -> Result<Reply> {
    let (record_type, payload) = split_frame(buf).map_err(as_connection)?;
    if record_type != RecordType::Reply {
        return Err(GpulinkError::connection(format!(
            "expected reply record, got {record_type:?}"
        )));
    }
    rkyv::from_bytes::<Reply, rkyv::rancor::Error>(payload)
        .map_err(|e| GpulinkError::connection(format!("reply payload: {e}")))
}

pub fn encode_ack(a: &Ack) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(a)
        .map_err(|e| GpulinkError::internal(format!("ack encode failed: {e}")))?;
    frame(RecordType::Ack, &payload)
}

/// Decode an ack frame read off the ack control stream.
pub fn decode_ack(buf: &[u8]) -> Result<Ack> {
    let (record_type, _payload) = split_frame(buf).map_err(as_connection)?;
    if record_type != RecordType::Ack {
        return Err(GpulinkError::connection(format!(
            "expected ack record, got {record_type:?}"
        )));
    }
    Ok(Ack)
}

fn as_connection(e: GpulinkError) -> GpulinkError {
    match e {
        GpulinkError::MalformedDescriptor { reason } => GpulinkError::Connection { reason },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> Descriptor {
        Descriptor {
            allocation_id: "31337-0_5".into(),
            mem_handle: vec![0x11; 64],
            offset: 4096,
            start_event_handle: vec![0x22; 64],
        }
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let d = sample_descriptor();
        let buf = encode_descriptor(&d).unwrap();
        assert_eq!(decode_descriptor(&buf).unwrap(), d);
    }

    #[test]
    fn test_reply_roundtrip() {
        let r = Reply {
            stop_event_handle: vec![9; 64],
        };
        let buf = encode_reply(&r).unwrap();
        assert_eq!(decode_reply(&buf).unwrap(), r);
    }

    #[test]
    fn test_ack_roundtrip() {
        let buf = encode_ack(&Ack).unwrap();
        assert_eq!(decode_ack(&buf).unwrap(), Ack);
    }

    #[test]
    fn test_descriptor_stays_small() {
        // Typical descriptors should fit comfortably under ~256 bytes.
        let buf = encode_descriptor(&sample_descriptor()).unwrap();
        assert!(buf.len() < 256, "descriptor frame is {} bytes", buf.len());
    }

    #[test]
    fn test_decode_invalid_tag() {
        let mut buf = encode_descriptor(&sample_descriptor()).unwrap();
        buf[4] = 0xFF;
        let err = decode_descriptor(&buf).unwrap_err();
        assert!(
            matches!(err, GpulinkError::MalformedDescriptor { .. }),
            "{err}"
        );
    }

    #[test]
    fn test_decode_mistyped_record() {
        // A valid ack frame is not a valid descriptor.
        let buf = encode_ack(&Ack).unwrap();
        let err = decode_descriptor(&buf).unwrap_err();
        assert!(
            matches!(err, GpulinkError::MalformedDescriptor { .. }),
            "{err}"
        );
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = encode_descriptor(&sample_descriptor()).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(decode_descriptor(&buf).is_err());
        assert!(decode_descriptor(&buf[..4]).is_err());
    }

    #[test]
    fn test_decode_version_mismatch() {
        let mut buf = encode_reply(&Reply {
            stop_event_handle: vec![],
        })
        .unwrap();
        buf[5] = CODEC_VERSION + 1;
        let err = decode_reply(&buf).unwrap_err();
        assert!(matches!(err, GpulinkError::Connection { .. }), "{err}");
    }

    #[test]
    fn test_frame_header_cap() {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&10_000u32.to_le_bytes());
        header[4] = RecordType::Reply as u8;
        header[5] = CODEC_VERSION;
        assert!(decode_frame_header(&header, 4096).is_err());
        assert!(decode_frame_header(&header, 16_384).is_ok());
    }
}
