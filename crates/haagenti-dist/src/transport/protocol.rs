//! Wire protocol for the TCP transport

use crate::value::{Buffer, ReduceOp};
use crate::{DistError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Length prefix size
const HEADER_LEN: usize = 4;

/// Protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Peer joins the hub
    Hello { rank: usize, world_size: usize },
    /// Hub has admitted every peer
    Ready,
    /// Peer contribution to an all-reduce
    Reduce { op: ReduceOp, data: Vec<f64> },
    /// Reduced result
    Reduced(Vec<f64>),
    /// Peer contribution to an all-gather
    Gather(Buffer),
    /// Gathered buffers in rank order
    Gathered(Vec<Buffer>),
    /// Peer leaves the group
    Bye,
    /// Collective failed on the hub
    Error(String),
}

impl Frame {
    /// Short name for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Ready => "ready",
            Frame::Reduce { .. } => "reduce",
            Frame::Reduced(_) => "reduced",
            Frame::Gather(_) => "gather",
            Frame::Gathered(_) => "gathered",
            Frame::Bye => "bye",
            Frame::Error(_) => "error",
        }
    }

    /// Serialize frame with its length prefix
    pub fn encode(&self) -> Result<BytesMut> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(DistError::Comm(format!(
                "{} frame of {} bytes exceeds limit",
                self.kind(),
                payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Deserialize a frame payload (without length prefix)
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let buf = frame.encode()?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = (&header[..]).get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(DistError::Comm(format!("incoming frame of {} bytes exceeds limit", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Frame::decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::Hello { rank: 3, world_size: 4 }).unwrap();
        write_frame(
            &mut wire,
            &Frame::Reduce {
                op: ReduceOp::Max,
                data: vec![1.0, 2.5],
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Frame::Hello { rank: 3, world_size: 4 }
        );
        match read_frame(&mut cursor).unwrap() {
            Frame::Reduce { op, data } => {
                assert_eq!(op, ReduceOp::Max);
                assert_eq!(data, vec![1.0, 2.5]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, DistError::Comm(_)));
    }

    #[test]
    fn test_frame_kind() {
        assert_eq!(Frame::Ready.kind(), "ready");
        assert_eq!(Frame::Error("x".into()).kind(), "error");
    }
}
