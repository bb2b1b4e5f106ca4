//! Application-level messages: ordered lists of buffers on one stream.
//!
//! A [`Message`] owns 1..N buffers, all on the same stream. Payload bytes are
//! accessed through views that walk the buffer list and skip each buffer's
//! header region, so consumers never see buffer boundaries: [`MessageReader`]
//! for reading, [`MessageWriter`] for appending (acquiring fresh buffers from
//! the pool as earlier ones fill up).

use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;
use web_time::Instant;

use crate::{
    buffer::{Buffer, BufferPool, BufferState},
    ty::{BufferSeq, FrameFlags, StreamId},
};

/// Process-local instance number of a [`Message`], assigned monotonically at
/// construction. Used as the non-owning back reference from a buffer to the
/// message it belongs to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

impl MessageId {
    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Created, nothing written yet.
    Initial,
    /// Holds payload being built up.
    Data,
    /// Handed to the session for transmission.
    SendPosted,
    /// All buffers accepted by the transport.
    Sent,
    /// All buffers covered by the peer's cumulative acknowledgement.
    Delivered,
    /// Fully reassembled from inbound buffers.
    Received,
    /// Buffers returned; the message must not be used again.
    Released,
    /// Transmission failed; see [`Message::failure_reason`].
    Failed,
}

/// A message write could not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The pool could not supply a buffer. The partially built message has
    /// been released.
    #[error("out of memory: buffer pool exhausted")]
    OutOfMemory,
}

/// An ordered list of buffers carrying one application-level unit on a single
/// stream.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    stream: StreamId,
    state: MessageState,
    failure: Option<String>,
    send_posted_at: Option<Instant>,
    last_seq: Option<BufferSeq>,
    buffers: Vec<Buffer>,
}

impl Message {
    /// Creates an empty message for `stream`.
    ///
    /// A message with zero buffers is local-only and cannot be transmitted.
    #[must_use]
    pub fn new(stream: StreamId) -> Self {
        Self {
            id: MessageId::next(),
            stream,
            state: MessageState::Initial,
            failure: None,
            send_posted_at: None,
            last_seq: None,
            buffers: Vec::new(),
        }
    }

    /// Builds a message directly from reassembled inbound buffers, in state
    /// [`MessageState::Received`].
    #[must_use]
    pub fn from_received(stream: StreamId, mut buffers: Vec<Buffer>) -> Self {
        let id = MessageId::next();
        let last_seq = buffers.last().map(|buf| buf.header().seq_num);
        for buf in &mut buffers {
            buf.set_message(Some(id));
        }
        Self {
            id,
            stream,
            state: MessageState::Received,
            failure: None,
            send_posted_at: None,
            last_seq,
            buffers,
        }
    }

    /// This message's instance number.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// The stream this message belongs to.
    #[must_use]
    pub const fn stream(&self) -> StreamId {
        self.stream
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> MessageState {
        self.state
    }

    /// Why this message failed, if it is [`MessageState::Failed`].
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// When this message was handed to the session, if it has been.
    #[must_use]
    pub const fn send_posted_at(&self) -> Option<Instant> {
        self.send_posted_at
    }

    /// Sequence number of this message's last buffer, once known.
    #[must_use]
    pub const fn last_seq(&self) -> Option<BufferSeq> {
        self.last_seq
    }

    pub(crate) fn note_last_seq(&mut self, seq: BufferSeq) {
        self.last_seq = Some(seq);
    }

    /// Transitions to `state`, recording the send-posted timestamp when
    /// entering [`MessageState::SendPosted`].
    pub fn set_state(&mut self, now: Instant, state: MessageState) {
        if state == MessageState::SendPosted {
            self.send_posted_at = Some(now);
        }
        self.state = state;
    }

    /// Marks this message [`MessageState::Failed`] with a reason.
    pub fn fail(&mut self, now: Instant, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.set_state(now, MessageState::Failed);
    }

    /// The buffers making up this message, in order.
    #[must_use]
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Number of buffers in this message.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Total payload bytes across all buffers.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buffers.iter().map(|buf| buf.payload().len()).sum()
    }

    /// Appends a buffer, setting its message back-pointer.
    pub fn push_buffer(&mut self, mut buffer: Buffer) {
        buffer.set_message(Some(self.id));
        self.buffers.push(buffer);
    }

    /// Takes the buffer list out of this message, leaving it empty.
    pub fn take_buffers(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.buffers)
    }

    /// ORs message-level flag bits into every buffer's header.
    pub fn or_flags(&mut self, flags: FrameFlags) {
        for buf in &mut self.buffers {
            buf.header_mut().flags |= flags;
        }
    }

    /// Returns every buffer to `pool` and transitions to
    /// [`MessageState::Released`].
    pub fn release(&mut self, now: Instant, pool: &mut BufferPool, reason: &str) {
        for buf in self.buffers.drain(..) {
            pool.release(now, Some(buf), reason);
        }
        self.set_state(now, MessageState::Released);
    }

    /// A byte-stream view over the payload regions.
    #[must_use]
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader {
            buffers: &self.buffers,
            index: 0,
            offset: 0,
        }
    }

    /// A byte-stream writer appending to this message, acquiring buffers
    /// from `pool` as needed.
    pub fn writer<'a>(&'a mut self, pool: &'a mut BufferPool) -> MessageWriter<'a> {
        MessageWriter {
            message: self,
            pool,
        }
    }

    /// Copies the whole payload into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        for buf in &self.buffers {
            out.extend_from_slice(buf.payload());
        }
        out
    }
}

/// Reads a message's payload as one contiguous byte stream.
///
/// Walks the buffer list in order; for each buffer it starts after the header
/// region and stops at the buffer's byte count. Consumers must not rely on
/// buffer boundaries.
#[derive(Debug)]
pub struct MessageReader<'m> {
    buffers: &'m [Buffer],
    index: usize,
    offset: usize,
}

impl MessageReader<'_> {
    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, buf) in self.buffers.iter().enumerate().skip(self.index) {
            total += buf.payload().len();
            if i == self.index {
                total -= self.offset;
            }
        }
        total
    }

    /// Copies up to `dst.len()` bytes into `dst`, returning how many were
    /// copied. Returns 0 only at end of message.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(buf) = self.buffers.get(self.index) else {
                break;
            };
            let payload = buf.payload();
            if self.offset >= payload.len() {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = (dst.len() - copied).min(payload.len() - self.offset);
            dst[copied..copied + n].copy_from_slice(&payload[self.offset..self.offset + n]);
            self.offset += n;
            copied += n;
        }
        copied
    }
}

/// Appends payload to a message as one contiguous byte stream.
///
/// When the current buffer has no available space, a new one is acquired from
/// the pool and appended. The first write transitions the message from
/// [`MessageState::Initial`] to [`MessageState::Data`].
#[derive(Debug)]
pub struct MessageWriter<'a> {
    message: &'a mut Message,
    pool: &'a mut BufferPool,
}

impl MessageWriter<'_> {
    /// Writes all of `src` into the message.
    ///
    /// # Errors
    ///
    /// Errors with [`WriteError::OutOfMemory`] when the pool cannot supply a
    /// buffer; the partially built message is released back to the pool.
    pub fn write(&mut self, now: Instant, src: &[u8]) -> Result<(), WriteError> {
        if self.message.state == MessageState::Initial {
            self.message.set_state(now, MessageState::Data);
        }
        let mut rest = src;
        while !rest.is_empty() {
            let need_new = self
                .message
                .buffers
                .last()
                .is_none_or(|buf| buf.available_space() == 0);
            if need_new {
                let Some(mut buf) = self.pool.try_acquire(now, "message write") else {
                    self.message.release(now, self.pool, "write failed");
                    return Err(WriteError::OutOfMemory);
                };
                buf.set_state(now, BufferState::Data, "message write");
                self.message.push_buffer(buf);
            }
            let buf = self
                .message
                .buffers
                .last_mut()
                .expect("a buffer was just ensured");
            let n = buf.append_payload(rest);
            rest = &rest[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut pool = BufferPool::new(128, 1_024_000);
        let mut msg = Message::new(StreamId::BASE);
        let payload = (0..=255u8).cycle().take(500).collect::<Vec<_>>();
        msg.writer(&mut pool).write(now(), &payload).unwrap();

        assert_eq!(MessageState::Data, msg.state());
        // 128-byte buffers carry 102 payload bytes each
        assert_eq!(5, msg.buffer_count());
        assert_eq!(500, msg.payload_len());
        assert_eq!(payload, msg.to_vec());

        let mut reader = msg.reader();
        assert_eq!(500, reader.remaining());
        let mut out = vec![0u8; 500];
        let mut filled = 0;
        // read in awkward chunk sizes to cross buffer boundaries
        for chunk in out.chunks_mut(33) {
            let n = reader.read(chunk);
            assert_eq!(chunk.len().min(500 - filled), n);
            filled += n;
        }
        assert_eq!(payload, out);
        assert_eq!(0, reader.remaining());
    }

    #[test]
    fn buffers_carry_back_pointer() {
        let mut pool = BufferPool::new(128, 1_024_000);
        let mut msg = Message::new(StreamId::new(3));
        msg.writer(&mut pool).write(now(), &[1, 2, 3]).unwrap();
        assert_eq!(Some(msg.id()), msg.buffers()[0].message_id());
    }

    #[test]
    fn empty_message_reads_nothing() {
        let msg = Message::new(StreamId::BASE);
        let mut reader = msg.reader();
        assert_eq!(0, reader.remaining());
        assert_eq!(0, reader.read(&mut [0u8; 8]));
    }

    #[test]
    fn out_of_memory_releases_partial_message() {
        // room for exactly one buffer
        let mut pool = BufferPool::new(128, 128);
        let mut msg = Message::new(StreamId::BASE);
        let payload = vec![0xA5; 300];
        assert_matches!(
            msg.writer(&mut pool).write(now(), &payload),
            Err(WriteError::OutOfMemory)
        );
        assert_eq!(MessageState::Released, msg.state());
        assert_eq!(0, msg.buffer_count());
    }

    #[test]
    fn release_returns_buffers() {
        let mut pool = BufferPool::new(128, 1_024_000);
        let mut msg = Message::new(StreamId::BASE);
        msg.writer(&mut pool).write(now(), &[0; 200]).unwrap();
        msg.release(now(), &mut pool, "test");
        assert_eq!(MessageState::Released, msg.state());
        assert_eq!(2, pool.retained());
    }
}
