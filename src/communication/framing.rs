//! Tag + length prefixed frames.
//!
//! A frame is one unsigned byte message tag, an unsigned 32 bit big-endian
//! payload length and exactly that many payload bytes. Datagrams carry exactly
//! one frame; V2X bodies may carry several frames back to back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PREFIX_LENGTH: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer ({0} bytes) too short for frame prefix")]
    MissingPrefix(usize),
    #[error("buffer ({available} bytes) too short for message ({declared} bytes)")]
    Truncated { declared: usize, available: usize },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            tag,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        PREFIX_LENGTH + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let length =
            u32::try_from(self.payload.len()).map_err(|_| FrameError::TooLarge(self.payload.len()))?;
        buf.reserve(self.encoded_len());
        buf.put_u8(self.tag);
        buf.put_u32(length);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Read one frame off the front of `buf`, advancing it past the frame.
fn take_frame(buf: &mut Bytes) -> Result<Frame, FrameError> {
    if buf.remaining() < PREFIX_LENGTH {
        return Err(FrameError::MissingPrefix(buf.remaining()));
    }
    let tag = buf.get_u8();
    let declared = buf.get_u32() as usize;
    if buf.remaining() < declared {
        return Err(FrameError::Truncated {
            declared,
            available: buf.remaining(),
        });
    }
    let payload = buf.split_to(declared);
    Ok(Frame { tag, payload })
}

/// Decode a datagram holding exactly one frame.
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    let mut buf = Bytes::copy_from_slice(data);
    let frame = take_frame(&mut buf)?;
    if buf.has_remaining() {
        return Err(FrameError::TrailingBytes(buf.remaining()));
    }
    Ok(frame)
}

/// Decode a body holding any number of consecutive frames.
pub fn split_frames(data: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut frames = Vec::new();
    while buf.has_remaining() {
        frames.push(take_frame(&mut buf)?);
    }
    Ok(frames)
}

/// Concatenate frames into one body.
pub fn join_frames(frames: &[Frame]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
    for frame in frames {
        frame.encode_into(&mut buf)?;
    }
    Ok(buf.freeze())
}

/// Lowercase hex rendering for the `proto` log target.
pub fn hex_dump(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
