//! Encoding and decoding of the [`FrameHeader`].
//!
//! The layout is bit-exact little-endian (see [`ty`](crate::ty)), written and
//! read with the explicit `_le` accessors so the wire image never depends on
//! host byte order.

use bytes::{Buf, BufMut};

use crate::ty::{BufferSeq, FrameFlags, FrameHeader, Purpose, StreamId};

/// A received frame failed header validation and was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame was shorter than the fixed header.
    #[error("frame too short: {len} / {} bytes", FrameHeader::LEN)]
    TooShort {
        /// Number of bytes in the frame.
        len: usize,
    },
    /// The purpose field was not one of the recognized magic values.
    #[error("unrecognized purpose magic {magic:#010x}")]
    UnknownPurpose {
        /// The raw purpose field.
        magic: u32,
    },
    /// The embedded header length did not match the fixed header length.
    #[error("bad header length field: {length}")]
    BadLength {
        /// The raw length field.
        length: u16,
    },
}

impl FrameHeader {
    /// Writes this header into `dst` in wire form.
    ///
    /// # Panics
    ///
    /// Panics if `dst` does not have [`FrameHeader::LEN`] bytes of space
    /// remaining.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.purpose.magic());
        dst.put_u16_le(self.flags.bits());
        dst.put_u16_le(self.length);
        dst.put_u64_le(self.seq_num.0);
        dst.put_u64_le(self.ack_seq_num.0);
        dst.put_u16_le(self.message_stream.0);
    }

    /// Reads a header from the front of `src`, validating the purpose magic
    /// and length field.
    ///
    /// # Errors
    ///
    /// Errors if the frame is truncated, carries an unknown purpose magic, or
    /// an unexpected length field.
    pub fn decode(src: &mut impl Buf) -> Result<Self, FrameError> {
        if src.remaining() < Self::LEN {
            return Err(FrameError::TooShort {
                len: src.remaining(),
            });
        }
        let magic = src.get_u32_le();
        let purpose = Purpose::from_magic(magic).ok_or(FrameError::UnknownPurpose { magic })?;
        let flags = FrameFlags::from_bits_truncate(src.get_u16_le());
        let length = src.get_u16_le();
        if usize::from(length) != Self::LEN {
            return Err(FrameError::BadLength { length });
        }
        let seq_num = BufferSeq::new(src.get_u64_le());
        let ack_seq_num = BufferSeq::new(src.get_u64_le());
        let message_stream = StreamId::new(src.get_u16_le());
        Ok(Self {
            purpose,
            flags,
            length,
            seq_num,
            ack_seq_num,
            message_stream,
        })
    }

    /// Encodes this header into a fresh `LEN`-byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        self.encode(&mut &mut buf[..]);
        buf
    }
}
