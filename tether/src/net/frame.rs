//! Frame wire format for controller traffic.
//!
//! Every message after the handshake is one frame:
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬──────────────────────────┐
//! │ Kind (4)   │ Tag (4)    │ Len (4)    │ Payload (Len bytes)      │
//! └────────────┴────────────┴────────────┴──────────────────────────┘
//! ```
//!
//! All header fields are big-endian.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::TransportError;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameKind {
    /// Remote method invocation; the tag selects the callback group.
    Rmi = 1,
    /// Point-to-point data; the tag matches a pending `receive`.
    Data = 2,
}

impl TryFrom<u32> for FrameKind {
    type Error = TransportError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Rmi),
            2 => Ok(Self::Data),
            other => Err(TransportError::UnknownFrameKind(other)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rmi => f.write_str("rmi"),
            Self::Data => f.write_str("data"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub tag: u32,
    pub len: u32,
}

impl FrameHeader {
    /// Builds a header for `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] if the payload exceeds
    /// [`MAX_FRAME_LEN`].
    pub fn for_payload(kind: FrameKind, tag: u32, payload: &[u8]) -> Result<Self, TransportError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }
        // MAX_FRAME_LEN < u32::MAX, checked above
        let len = payload.len() as u32;
        Ok(Self { kind, tag, len })
    }

    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_be_bytes());
        buf[8..12].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Parses a header, validating kind and length.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown kind or an oversized length.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, TransportError> {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let kind = FrameKind::try_from(word(0))?;
        let tag = word(4);
        let len = word(8);
        if len as usize > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: len as usize,
                max: MAX_FRAME_LEN,
            });
        }
        Ok(Self { kind, tag, len })
    }
}

/// A complete frame read from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tag: u32,
    pub payload: Vec<u8>,
}

/// Marker trait for types that can travel as a typed frame payload.
///
/// Automatically implemented for all `Serialize + Deserialize` types.
pub trait Wire: Serialize + for<'de> Deserialize<'de> {}
impl<T> Wire for T where T: Serialize + for<'de> Deserialize<'de> {}

/// Serializes `msg` with postcard.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_message<T: Wire>(msg: &T) -> Result<Vec<u8>, TransportError> {
    Ok(postcard::to_allocvec(msg)?)
}

/// Deserializes a postcard payload.
///
/// # Errors
///
/// Returns an error if the bytes do not describe a `T`.
pub fn decode_message<T: Wire>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(postcard::from_bytes(bytes)?)
}
