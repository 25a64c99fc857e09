//! Command transport framing
//!
//! Every datagram on the command path carries one frame: a 7-byte header
//! `{data_type u8, queue_id u8, seq u8, size u32 LE}` followed by the
//! payload, where `size` covers header and payload. The same layout is used
//! verbatim inside mux packets, with the mux channel adding its own length
//! prefix.

use crate::{Result, SdkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size on the wire
pub const FRAME_HEADER_SIZE: usize = 7;

/// Transport-level class of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    /// Acknowledgement of a previously received sequence number
    Ack = 1,
    /// Plain data, no acknowledgement expected
    Data = 2,
    /// Data flagged for latency-sensitive handling
    DataLowLatency = 3,
    /// Data requiring an ack frame in return
    DataWithAck = 4,
}

impl DataType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(DataType::Ack),
            2 => Some(DataType::Data),
            3 => Some(DataType::DataLowLatency),
            4 => Some(DataType::DataWithAck),
            _ => None,
        }
    }
}

/// One framed message on the command transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transport-level class of the frame
    pub data_type: DataType,

    /// Transmit queue the frame belongs to
    pub queue_id: u8,

    /// Per-queue sequence number, wrapping at 256
    pub seq: u8,

    /// Encoded command bytes, or the acked seq for ack frames
    pub payload: Bytes,
}

impl Frame {
    pub fn new(data_type: DataType, queue_id: u8, seq: u8, payload: Bytes) -> Self {
        Self {
            data_type,
            queue_id,
            seq,
            payload,
        }
    }

    /// An ack frame for `acked_seq`, emitted on `ack_queue_id`
    ///
    /// The acked sequence number travels as the single payload byte; the ack
    /// frame's own `seq` is assigned by the sending queue like any frame.
    pub fn ack(ack_queue_id: u8, seq: u8, acked_seq: u8) -> Self {
        Self {
            data_type: DataType::Ack,
            queue_id: ack_queue_id,
            seq,
            payload: Bytes::copy_from_slice(&[acked_seq]),
        }
    }

    /// Sequence number carried by an ack frame payload
    pub fn acked_seq(&self) -> Result<u8> {
        if self.data_type != DataType::Ack || self.payload.is_empty() {
            return Err(SdkError::invalid_argument("not an ack frame"));
        }
        Ok(self.payload[0])
    }

    pub fn to_bytes(&self) -> Bytes {
        let size = (FRAME_HEADER_SIZE + self.payload.len()) as u32;
        let mut buf = BytesMut::with_capacity(size as usize);
        buf.put_u8(self.data_type as u8);
        buf.put_u8(self.queue_id);
        buf.put_u8(self.seq);
        buf.put_u32_le(size);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(SdkError::invalid_argument(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let raw_type = buf.get_u8();
        let data_type = DataType::from_u8(raw_type)
            .ok_or_else(|| SdkError::invalid_argument(format!("unknown data type {raw_type}")))?;
        let queue_id = buf.get_u8();
        let seq = buf.get_u8();
        let size = buf.get_u32_le() as usize;
        if size < FRAME_HEADER_SIZE || size > data.len() {
            return Err(SdkError::invalid_argument(format!(
                "bad frame size {size} (datagram is {} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            data_type,
            queue_id,
            seq,
            payload: Bytes::copy_from_slice(&buf[..size - FRAME_HEADER_SIZE]),
        })
    }
}

/// Modular comparison of 8-bit sequence numbers
///
/// `true` when `a` comes after `b` in wraparound order; a forward gap of 128
/// or more reads as "before".
pub fn seq_after(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < 128
}

/// Next sequence number in wraparound order
pub fn seq_next(seq: u8) -> u8 {
    seq.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(
            DataType::DataWithAck,
            11,
            42,
            Bytes::from_static(b"\x01\x04\x00\x00"),
        );
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 4);
        let back = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_ack_frame() {
        let frame = Frame::ack(21, 3, 42);
        assert_eq!(frame.acked_seq().unwrap(), 42);
        let data = Frame::new(DataType::Data, 10, 0, Bytes::new());
        assert!(data.acked_seq().is_err());
    }

    #[test]
    fn test_bad_frames() {
        assert!(Frame::from_bytes(&[2, 10]).is_err());
        // unknown data type
        assert!(Frame::from_bytes(&[9, 10, 0, 7, 0, 0, 0]).is_err());
        // size exceeds datagram
        assert!(Frame::from_bytes(&[2, 10, 0, 200, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_seq_wraparound() {
        assert_eq!(seq_next(255), 0);
        assert!(seq_after(0, 255));
        assert!(seq_after(1, 255));
        assert!(!seq_after(255, 0));
        assert!(!seq_after(5, 5));
    }
}
