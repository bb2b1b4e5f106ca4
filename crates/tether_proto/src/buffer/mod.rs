//! Fixed-size transmission buffers and the pool which recycles them.
//!
//! A [`Buffer`] is the unit handed to and received from the transport: a
//! fixed-capacity byte array whose first [`FrameHeader::LEN`] bytes mirror the
//! in-memory [`FrameHeader`]. The header is serialized into the prefix on
//! entry to [`BufferState::SendPosted`] and deserialized out of it on entry
//! to [`BufferState::Received`], so the decoded form is authoritative
//! everywhere else.
//!
//! Buffers are owned by exactly one place at a time: the [`BufferPool`], a
//! session's held list, or a [`Message`](crate::message::Message)'s buffer
//! list. Rust move semantics enforce this; the back references a buffer
//! carries (its origin [`PoolId`] and owning [`MessageId`]) are plain ids,
//! never owning handles.

mod pool;

pub use pool::*;

use std::{fmt, sync::Arc};

use web_time::Instant;

use crate::{
    message::MessageId,
    ty::{FrameFlags, FrameHeader, Purpose, StreamId},
};

/// Lifecycle of a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Freshly allocated, never pooled.
    Created,
    /// Handed out by a pool's retain list.
    Acquired,
    /// Reset to header-only contents.
    Clear,
    /// Given to the transport to be filled with an inbound frame.
    ReceivePosted,
    /// Holds a received frame; header deserialized.
    Received,
    /// Holds application payload being built up.
    Data,
    /// Queued for its first transmission.
    ReadyToSend,
    /// Queued for a retransmission.
    ReadyToResend,
    /// Handed to the transport; header serialized.
    SendPosted,
    /// Accepted by the transport; awaiting acknowledgement.
    Sent,
    /// Covered by the peer's cumulative acknowledgement.
    Delivered,
    /// Storage abandoned; must never be used again.
    Released,
}

/// Observer invoked on every buffer state transition.
///
/// Installed on a [`BufferPool`] and inherited by every buffer it hands out.
/// Implementations must be cheap; they run inline on the session service
/// path.
pub trait BufferNotify {
    /// Called after `buffer` transitioned from `old` to its current state.
    fn buffer_state_changed(&self, buffer: &Buffer, old: BufferState, reason: &str);
}

/// Bulk update applied to a buffer in one call.
///
/// Fields left at their defaults are not touched. Flags are OR-ed into the
/// header rather than replacing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferUpdate<'a> {
    /// New purpose for the header.
    pub purpose: Option<Purpose>,
    /// Flag bits to OR into the header.
    pub or_flags: FrameFlags,
    /// New stream id for the header.
    pub stream: Option<StreamId>,
    /// Payload bytes to copy into the region after the header, clamped to the
    /// buffer capacity.
    pub payload: Option<&'a [u8]>,
}

/// A fixed-capacity frame: header prefix plus payload.
pub struct Buffer {
    data: Vec<u8>,
    byte_count: usize,
    header: FrameHeader,
    state: BufferState,
    pool: Option<PoolId>,
    message: Option<MessageId>,
    notify: Option<Arc<dyn BufferNotify>>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("byte_count", &self.byte_count)
            .field("header", &self.header)
            .field("state", &self.state)
            .field("pool", &self.pool)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub(crate) fn with_capacity(
        capacity: usize,
        pool: Option<PoolId>,
        notify: Option<Arc<dyn BufferNotify>>,
    ) -> Self {
        debug_assert!(capacity >= FrameHeader::LEN);
        Self {
            data: vec![0; capacity],
            byte_count: FrameHeader::LEN,
            header: FrameHeader::default(),
            state: BufferState::Created,
            pool,
            message: None,
            notify,
        }
    }

    /// Total capacity in bytes, header included. Immutable once allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently used, header included.
    #[must_use]
    pub const fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Bytes of payload space still available.
    #[must_use]
    pub fn available_space(&self) -> usize {
        self.capacity() - self.byte_count
    }

    /// The in-memory header.
    #[must_use]
    pub const fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Mutable access to the in-memory header.
    pub const fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> BufferState {
        self.state
    }

    /// The pool this buffer came from, if any.
    #[must_use]
    pub const fn pool_id(&self) -> Option<PoolId> {
        self.pool
    }

    /// The message this buffer belongs to, if any.
    #[must_use]
    pub const fn message_id(&self) -> Option<MessageId> {
        self.message
    }

    pub(crate) const fn set_message(&mut self, message: Option<MessageId>) {
        self.message = message;
    }

    /// The payload region: everything between the header and `byte_count`.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[FrameHeader::LEN..self.byte_count]
    }

    /// The full frame image, ready for the transport. Only meaningful after
    /// the header has been serialized by a transition to
    /// [`BufferState::SendPosted`].
    #[must_use]
    pub fn frame_bytes(&self) -> &[u8] {
        &self.data[..self.byte_count]
    }

    /// Copies `src` into the payload region, clamped to the remaining
    /// capacity. Returns how many bytes were copied.
    pub fn append_payload(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.available_space());
        self.data[self.byte_count..self.byte_count + n].copy_from_slice(&src[..n]);
        self.byte_count += n;
        n
    }

    /// Transitions to `state`, firing the notifier.
    ///
    /// On entry to [`BufferState::SendPosted`] the in-memory header is
    /// serialized into the frame prefix. On entry to
    /// [`BufferState::Received`] the prefix is deserialized into the
    /// in-memory header; the caller is expected to have validated the frame
    /// beforehand, so a prefix that fails to decode leaves the header
    /// untouched.
    pub fn set_state(&mut self, _now: Instant, state: BufferState, reason: &str) {
        let old = self.state;
        match state {
            BufferState::SendPosted => {
                let image = self.header.to_bytes();
                self.data[..FrameHeader::LEN].copy_from_slice(&image);
            }
            BufferState::Received => {
                if let Ok(header) = FrameHeader::decode(&mut &self.data[..FrameHeader::LEN]) {
                    self.header = header;
                }
            }
            _ => {}
        }
        self.state = state;
        if let Some(notify) = self.notify.clone() {
            notify.buffer_state_changed(self, old, reason);
        }
    }

    /// Applies a bulk [`BufferUpdate`].
    pub fn update(&mut self, _now: Instant, update: BufferUpdate<'_>) {
        if let Some(purpose) = update.purpose {
            self.header.purpose = purpose;
        }
        self.header.flags |= update.or_flags;
        if let Some(stream) = update.stream {
            self.header.message_stream = stream;
        }
        if let Some(payload) = update.payload {
            self.append_payload(payload);
        }
    }

    /// Resets header, byte count and message back-pointer, transitioning to
    /// [`BufferState::Clear`].
    pub fn clear(&mut self, now: Instant, reason: &str) {
        self.header = FrameHeader::default();
        self.byte_count = FrameHeader::LEN;
        self.message = None;
        self.set_state(now, BufferState::Clear, reason);
    }

    /// Loads an inbound frame image into this buffer and transitions it
    /// through [`BufferState::ReceivePosted`] to [`BufferState::Received`],
    /// deserializing the header prefix.
    ///
    /// The frame must already have passed header validation; `frame` is
    /// truncated to this buffer's capacity if it is somehow longer.
    pub fn load_frame(&mut self, now: Instant, frame: &[u8]) {
        self.set_state(now, BufferState::ReceivePosted, "inbound frame");
        let n = frame.len().min(self.capacity());
        self.data[..n].copy_from_slice(&frame[..n]);
        self.byte_count = n;
        self.set_state(now, BufferState::Received, "inbound frame");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::ty::BufferSeq;

    fn now() -> Instant {
        Instant::now()
    }

    struct CountingNotify(AtomicU32);

    impl BufferNotify for CountingNotify {
        fn buffer_state_changed(&self, _buffer: &Buffer, _old: BufferState, _reason: &str) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn notifier_fires_on_every_transition() {
        let notify = Arc::new(CountingNotify(AtomicU32::new(0)));
        let mut pool = BufferPool::new(256, 1_024_000);
        pool.set_notify(notify.clone());

        let mut buf = pool.acquire(now(), "test");
        buf.set_state(now(), BufferState::Data, "test");
        buf.set_state(now(), BufferState::ReadyToSend, "test");
        pool.release(now(), Some(buf), "test");

        // Data, ReadyToSend, and the Clear fired by release
        assert_eq!(3, notify.0.load(Ordering::Relaxed));

        // a recycled buffer keeps notifying
        let buf = pool.acquire(now(), "test");
        assert_eq!(BufferState::Acquired, buf.state());
        assert_eq!(4, notify.0.load(Ordering::Relaxed));
    }

    #[test]
    fn header_serialized_on_send_posted() {
        let mut buf = Buffer::with_capacity(64, None, None);
        buf.header_mut().purpose = Purpose::Message;
        buf.header_mut().seq_num = BufferSeq::new(9);
        buf.set_state(now(), BufferState::SendPosted, "test");

        let mut prefix = &buf.frame_bytes()[..FrameHeader::LEN];
        let decoded = FrameHeader::decode(&mut prefix).unwrap();
        assert_eq!(*buf.header(), decoded);
    }

    #[test]
    fn header_deserialized_on_received() {
        let mut src = Buffer::with_capacity(64, None, None);
        src.header_mut().purpose = Purpose::MessageEnd;
        src.header_mut().seq_num = BufferSeq::new(3);
        src.header_mut().message_stream = StreamId::new(2);
        src.append_payload(&[1, 2, 3]);
        src.set_state(now(), BufferState::SendPosted, "test");

        let mut dst = Buffer::with_capacity(64, None, None);
        dst.load_frame(now(), src.frame_bytes());
        assert_eq!(BufferState::Received, dst.state());
        assert_eq!(*src.header(), *dst.header());
        assert_eq!(&[1, 2, 3], dst.payload());
    }

    #[test]
    fn payload_clamped_to_capacity() {
        let mut buf = Buffer::with_capacity(FrameHeader::LEN + 4, None, None);
        assert_eq!(4, buf.append_payload(&[0xA5; 10]));
        assert_eq!(0, buf.available_space());
        assert_eq!(&[0xA5; 4], buf.payload());
    }

    #[test]
    fn update_is_cumulative() {
        let mut buf = Buffer::with_capacity(64, None, None);
        buf.update(
            now(),
            BufferUpdate {
                purpose: Some(Purpose::MessageStart),
                or_flags: FrameFlags::MESSAGE_CONTAINS_JSON_NVS,
                stream: Some(StreamId::new(4)),
                payload: Some(&[7, 8]),
            },
        );
        buf.update(
            now(),
            BufferUpdate {
                or_flags: FrameFlags::BUFFER_IS_BEING_RESENT,
                payload: Some(&[9]),
                ..BufferUpdate::default()
            },
        );
        assert_eq!(Purpose::MessageStart, buf.header().purpose);
        assert_eq!(StreamId::new(4), buf.header().message_stream);
        assert_eq!(
            FrameFlags::MESSAGE_CONTAINS_JSON_NVS | FrameFlags::BUFFER_IS_BEING_RESENT,
            buf.header().flags
        );
        assert_eq!(&[7, 8, 9], buf.payload());
    }

    #[test]
    fn clear_resets() {
        let mut buf = Buffer::with_capacity(64, None, None);
        buf.header_mut().purpose = Purpose::Message;
        buf.append_payload(&[1, 2]);
        buf.clear(now(), "test");
        assert_eq!(BufferState::Clear, buf.state());
        assert_eq!(FrameHeader::default(), *buf.header());
        assert_eq!(FrameHeader::LEN, buf.byte_count());
        assert_eq!(None, buf.message_id());
    }
}
