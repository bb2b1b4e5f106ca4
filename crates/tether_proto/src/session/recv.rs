use std::cmp::Ordering;

use tracing::warn;
use web_time::Instant;

use super::{ConnectionSession, SessionEvent};
use crate::{
    buffer::Buffer,
    message::Message,
    mgmt::Management,
    ty::{FrameFlags, FrameHeader, Purpose, StreamId},
};

impl ConnectionSession {
    /// Processes one raw frame from the transport.
    ///
    /// Invalid frames are dropped and counted; the session always continues.
    /// Data frames are accepted in strict sequence order, buffered briefly
    /// when they arrive early, and fed into per-stream reassembly; completed
    /// messages surface as [`SessionEvent::MessageReceived`].
    pub fn recv_frame(&mut self, now: Instant, frame: &[u8]) {
        #[allow(clippy::cast_precision_loss)]
        self.stats.rx.bytes.record(frame.len() as f64);
        let header = match FrameHeader::decode(&mut &frame[..]) {
            Ok(header) => header,
            Err(err) => {
                warn!(session = %self.session_uuid, %err, "dropping invalid frame");
                self.stats.events.invalid_frames += 1;
                return;
            }
        };
        self.last_recv_at = now;
        // hearing from the peer resets the keep-alive backoff, and confirms
        // any keep-alive we sent before this frame
        self.keep_alive_interval = self.config.nominal_keep_alive_send_interval;
        if let Some(sent) = self.last_keep_alive_sent_at {
            if self.last_delivered_keep_alive_at.is_none_or(|at| at < sent) {
                self.last_delivered_keep_alive_at = Some(now);
            }
        }

        self.process_ack(now, header.ack_seq_num);

        match header.purpose {
            Purpose::Ack => {}
            Purpose::Management => match Management::decode(&frame[FrameHeader::LEN..]) {
                Ok(mgmt) => self.handle_management(now, mgmt),
                Err(err) => {
                    warn!(session = %self.session_uuid, %err, "dropping bad management frame");
                    self.stats.events.invalid_frames += 1;
                }
            },
            Purpose::None => {
                self.stats.events.invalid_frames += 1;
            }
            _ => self.recv_data(now, &header, frame),
        }
    }

    fn recv_data(&mut self, now: Instant, header: &FrameHeader, frame: &[u8]) {
        self.stats.rx.buffers.record(1.0);
        self.note_app_traffic(now);

        let expected = self.last_recv_seq.next();
        match header.seq_num.cmp(&expected) {
            Ordering::Equal => {
                let mut buffer = self.pool.acquire(now, "inbound frame");
                buffer.load_frame(now, frame);
                self.stats.rx.buffer_delay.record(web_time::Duration::ZERO);
                self.accept_buffer(now, buffer);
                self.drain_reorder(now);
                self.schedule_ack(now);
            }
            Ordering::Less => {
                // duplicate of something already accepted; our ack for it was
                // probably lost, so get another one out promptly
                if header.flags.contains(FrameFlags::BUFFER_IS_BEING_RESENT) {
                    self.stats.events.buffers_resent_rx += 1;
                } else {
                    self.stats.events.old_duplicate_recv += 1;
                }
                self.ack_due_at = Some(self.ack_due_at.map_or(now, |at| at.min(now)));
            }
            Ordering::Greater => {
                self.stats.events.out_of_order_recv += 1;
                let seq = header.seq_num.0;
                if self.reorder.len() < self.config.reorder_window
                    && !self.reorder.contains_key(&seq)
                {
                    let mut buffer = self.pool.acquire(now, "reorder");
                    buffer.load_frame(now, frame);
                    self.reorder.insert(seq, (buffer, now));
                } else {
                    // beyond the window (or already buffered): drop, never nack
                    self.stats.events.old_duplicate_recv += 1;
                }
            }
        }
    }

    fn drain_reorder(&mut self, now: Instant) {
        loop {
            let next = self.last_recv_seq.next().0;
            let Some((buffer, inserted_at)) = self.reorder.remove(&next) else {
                break;
            };
            self.stats
                .rx
                .buffer_delay
                .record(now.saturating_duration_since(inserted_at));
            self.accept_buffer(now, buffer);
        }
    }

    fn accept_buffer(&mut self, now: Instant, buffer: Buffer) {
        self.last_recv_seq = buffer.header().seq_num;
        self.push_reassembly(now, buffer);
    }

    /// Appends an accepted data buffer to its stream's reassembly
    /// accumulator, completing a message on `MessageEnd` or a single-frame
    /// `Message`.
    fn push_reassembly(&mut self, now: Instant, buffer: Buffer) {
        let stream = buffer.header().message_stream;
        let purpose = buffer.header().purpose;
        match purpose {
            Purpose::Message => {
                self.discard_incomplete_reassembly(now, stream, "single-frame message");
                self.complete_message(stream, vec![buffer]);
            }
            Purpose::MessageStart => {
                self.discard_incomplete_reassembly(now, stream, "new message start");
                self.reassembly.entry(stream).or_default().push(buffer);
            }
            Purpose::MessageMiddle => {
                match self.reassembly.get_mut(&stream) {
                    Some(pending) if !pending.is_empty() => pending.push(buffer),
                    _ => {
                        warn!(session = %self.session_uuid, %stream,
                            "message middle with no message in progress");
                        self.stats.events.protocol_violations += 1;
                        self.pool.release(now, Some(buffer), "orphan middle");
                    }
                }
            }
            Purpose::MessageEnd => {
                let pending = self
                    .reassembly
                    .get_mut(&stream)
                    .map(std::mem::take)
                    .unwrap_or_default();
                if pending.is_empty() {
                    warn!(session = %self.session_uuid, %stream,
                        "message end with no message in progress");
                    self.stats.events.protocol_violations += 1;
                    self.pool.release(now, Some(buffer), "orphan end");
                } else {
                    let mut buffers = pending;
                    buffers.push(buffer);
                    self.complete_message(stream, buffers);
                }
            }
            _ => self.pool.release(now, Some(buffer), "not a data purpose"),
        }
    }

    /// A `MessageStart` (or single-frame message) arriving while a prior
    /// reassembly is incomplete is a protocol violation: the in-progress
    /// reassembly is discarded and the stream continues.
    fn discard_incomplete_reassembly(&mut self, now: Instant, stream: StreamId, context: &str) {
        let Some(pending) = self.reassembly.get_mut(&stream) else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        warn!(session = %self.session_uuid, %stream, context,
            discarded = pending.len(), "discarding incomplete reassembly");
        self.stats.events.protocol_violations += 1;
        let discarded = std::mem::take(pending);
        for buf in discarded {
            self.pool.release(now, Some(buf), "incomplete reassembly");
        }
    }

    fn complete_message(&mut self, stream: StreamId, buffers: Vec<Buffer>) {
        let message = Message::from_received(stream, buffers);
        self.stats.rx.messages.record(1.0);
        self.events
            .push_back(SessionEvent::MessageReceived { stream, message });
    }

    /// An ack piggybacks on any outbound data frame; when the watermark has
    /// advanced past the coalesce threshold, or nothing carries it within
    /// the coalesce holdoff, a standalone ack frame goes out instead.
    fn schedule_ack(&mut self, now: Instant) {
        if self.last_recv_seq <= self.last_ack_sent {
            return;
        }
        let advance = self.last_recv_seq.0 - self.last_ack_sent.0;
        if advance >= self.config.ack_coalesce_threshold {
            self.send_ack_frame(now);
        } else {
            let due = now + self.config.ack_coalesce_holdoff;
            self.ack_due_at = Some(self.ack_due_at.map_or(due, |at| at.min(due)));
        }
    }
}
