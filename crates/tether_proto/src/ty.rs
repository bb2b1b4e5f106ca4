//! Definitions for the types which appear on the wire.
//!
//! This module only contains the type definitions themselves, to make it easy
//! to understand the whole protocol at a glance. The encoding and decoding
//! logic lives in [`header`](crate::header); the behavior is implemented in
//! [`session`](crate::session).
//!
//! Every frame exchanged between two endpoints starts with a fixed-size
//! [`FrameHeader`], followed by `0..(capacity - 26)` payload bytes:
//!
//! ```text
//! off size field
//!  0   4   purpose        (magic value, also a protocol version heuristic)
//!  4   2   flags
//!  6   2   length         (= 26, the header length)
//!  8   8   seq_num
//! 16   8   ack_seq_num
//! 24   2   message_stream
//! ```
//!
//! All fields are little-endian.
//!
//! Data frames ([`Purpose::MessageStart`], [`Purpose::MessageMiddle`],
//! [`Purpose::MessageEnd`], [`Purpose::Message`]) occupy the reliable sequence
//! space: each carries a strictly increasing `seq_num` and is retransmitted
//! until the peer's cumulative acknowledgement covers it. [`Purpose::Ack`] and
//! [`Purpose::Management`] frames carry `seq_num = 0` and are idempotent.

use derive_more::Display;

/// Sequence number of a buffer in the reliable sequence space of a session.
///
/// Assigned per session, starting at 1 and strictly increasing. Stored as a
/// [`u64`], so wraparound is not a practical concern and plain [`Ord`] is
/// correct.
#[derive(
    Debug, Display, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct BufferSeq(pub u64);

impl BufferSeq {
    /// Sequence number with value `0`, used by frames outside the reliable
    /// sequence space.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number from a raw value.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the sequence number directly after `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifier of a logical stream within a session.
///
/// Stream 0 is reserved for the base tool, which also carries the server-info
/// exchange. Streams are created by the client and mirrored on the server via
/// the stream-setup pathway (see [`FrameFlags::MESSAGE_CONTAINS_STREAM_SETUP`]).
#[derive(
    Debug, Display, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct StreamId(pub u16);

impl StreamId {
    /// The base stream, always present on both sides.
    pub const BASE: Self = Self(0);

    /// Creates a stream id from a raw value.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(n)
    }
}

/// What a frame is for, expressed as a 32-bit magic value.
///
/// The magic doubles as a cheap protocol-version check: a peer speaking a
/// different revision of the wire format will not produce these exact values,
/// and its frames are rejected at decode time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Header has not been assigned a purpose yet. Never valid on the wire.
    #[default]
    None,
    /// Control frame carrying a name/value payload; not part of the reliable
    /// sequence space.
    Management,
    /// First buffer of a multi-buffer message.
    MessageStart,
    /// Interior buffer of a multi-buffer message.
    MessageMiddle,
    /// Last buffer of a multi-buffer message.
    MessageEnd,
    /// A complete message in a single buffer.
    Message,
    /// Standalone cumulative acknowledgement; carries no payload.
    Ack,
}

impl Purpose {
    /// Wire magic for this purpose.
    #[must_use]
    pub const fn magic(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Management => 0xDE47_EA12,
            Self::MessageStart => 0xDE47_EA13,
            Self::MessageMiddle => 0xDE47_EA14,
            Self::MessageEnd => 0xDE47_EA15,
            Self::Message => 0xDE47_EA16,
            Self::Ack => 0xDE47_EA17,
        }
    }

    /// Looks up the purpose for a wire magic, or [`None`] if the value is not
    /// a recognized magic.
    #[must_use]
    pub const fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            0 => Some(Self::None),
            0xDE47_EA12 => Some(Self::Management),
            0xDE47_EA13 => Some(Self::MessageStart),
            0xDE47_EA14 => Some(Self::MessageMiddle),
            0xDE47_EA15 => Some(Self::MessageEnd),
            0xDE47_EA16 => Some(Self::Message),
            0xDE47_EA17 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Whether frames with this purpose occupy the reliable sequence space.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            Self::MessageStart | Self::MessageMiddle | Self::MessageEnd | Self::Message
        )
    }
}

bitflags::bitflags! {
    /// Bitfield in the frame header.
    ///
    /// The low byte describes the buffer; the high byte describes the message
    /// the buffer belongs to.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u16 {
        /// This buffer has been sent at least once before.
        const BUFFER_IS_BEING_RESENT = 0x0001;
        /// The buffer payload is an E005 binary name/value set.
        const BUFFER_CONTAINS_E005_NVS = 0x0002;
        /// The first message on a stream: its payload opens the stream and
        /// names the tool type that will own it.
        const MESSAGE_CONTAINS_STREAM_SETUP = 0x0100;
        /// The message payload is a JSON name/value set.
        const MESSAGE_CONTAINS_JSON_NVS = 0x0200;
        /// The message payload is a single JSON string.
        const MESSAGE_CONTAINS_JSON_STRING = 0x0400;
    }
}

/// The fixed-layout header at the front of every frame.
///
/// Kept in memory in decoded form on every [`Buffer`](crate::buffer::Buffer);
/// serialized into the buffer's first [`FrameHeader::LEN`] bytes immediately
/// before transmission and deserialized immediately after reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// What this frame is for.
    pub purpose: Purpose,
    /// Frame flag bits.
    pub flags: FrameFlags,
    /// Length of the header itself; always [`FrameHeader::LEN`].
    pub length: u16,
    /// Buffer sequence number; `0` for ack-only and management frames.
    pub seq_num: BufferSeq,
    /// Cumulative acknowledgement watermark: the highest sequence number the
    /// sending endpoint has received contiguously.
    pub ack_seq_num: BufferSeq,
    /// Logical stream this frame belongs to.
    pub message_stream: StreamId,
}

impl FrameHeader {
    /// Encoded length of the header in bytes.
    pub const LEN: usize = 26;
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            purpose: Purpose::None,
            flags: FrameFlags::empty(),
            length: Self::LEN as u16,
            seq_num: BufferSeq::ZERO,
            ack_seq_num: BufferSeq::ZERO,
            message_stream: StreamId::BASE,
        }
    }
}
