use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, trace};
use web_time::{Duration, Instant};

use super::{ConnectionSession, HeldBuffer, OutboundMessage, QueueError, SessionEvent};
use crate::{
    buffer::{BufferState, BufferUpdate},
    message::{Message, MessageId, MessageState},
    mgmt::{Management, ManagementType},
    ty::{BufferSeq, FrameFlags, FrameHeader, Purpose, StreamId},
};

impl ConnectionSession {
    /// Queues a message's buffers for reliable transmission on its stream.
    ///
    /// Each buffer is assigned the next sequence number, stamped with its
    /// position purpose (single / start / middle / end), appended to the
    /// held list, and picked up by [`ConnectionSession::poll_outbound`].
    /// Delivery is reported later as [`SessionEvent::MessageDelivered`] or
    /// [`SessionEvent::MessageFailed`].
    ///
    /// # Errors
    ///
    /// Errors if the session is not connected, the message is empty, or
    /// queuing would exceed the held-buffer window (back-pressure; retry
    /// after acks advance).
    pub fn queue_message(&mut self, now: Instant, mut message: Message) -> Result<MessageId, QueueError> {
        if !self.state.is_connected() {
            return Err(QueueError::NotConnected { state: self.state });
        }
        let count = message.buffer_count();
        if count == 0 {
            return Err(QueueError::EmptyMessage);
        }
        if self.held.len() + count > self.config.max_held_buffers {
            return Err(QueueError::Backpressure);
        }

        let id = message.id();
        let stream = message.stream();
        message.set_state(now, MessageState::SendPosted);
        self.outbound_msgs.insert(
            id,
            OutboundMessage {
                stream,
                remaining: count,
                posted_at: now,
            },
        );

        for (index, mut buffer) in message.take_buffers().into_iter().enumerate() {
            self.next_send_seq = self.next_send_seq.next();
            let purpose = match (count, index) {
                (1, _) => Purpose::Message,
                (_, 0) => Purpose::MessageStart,
                (n, i) if i == n - 1 => Purpose::MessageEnd,
                _ => Purpose::MessageMiddle,
            };
            buffer.update(
                now,
                BufferUpdate {
                    purpose: Some(purpose),
                    stream: Some(stream),
                    ..BufferUpdate::default()
                },
            );
            buffer.header_mut().seq_num = self.next_send_seq;
            buffer.set_state(now, BufferState::ReadyToSend, "queued");
            self.held.push_back(HeldBuffer {
                buffer,
                message: Some((id, index == count - 1)),
                first_posted_at: None,
                attempt: 0,
                next_resend_at: now,
            });
        }
        message.note_last_seq(self.next_send_seq);

        self.stats.tx.messages.record(1.0);
        self.note_app_traffic(now);
        trace!(session = %self.session_uuid, %stream, %id, buffers = count, "message queued");
        Ok(id)
    }

    /// Pulls the next frame to hand to the transport, or [`None`] when
    /// nothing is ready this tick.
    ///
    /// Management and ack frames come first, then held buffers in state
    /// ready-to-send or ready-to-resend. Every data frame piggybacks the
    /// current inbound acknowledgement watermark.
    pub fn poll_outbound(&mut self, now: Instant) -> Option<Bytes> {
        if let Some(frame) = self.send_now.pop_front() {
            return Some(frame);
        }
        if !self.state.is_connected() {
            return None;
        }
        let watermark = self.last_recv_seq;
        let base_holdoff = self.config.retransmit_holdoff;
        let max_holdoff = self.config.retransmit_holdoff_max;
        let held = self.held.iter_mut().find(|h| {
            matches!(
                h.buffer.state(),
                BufferState::ReadyToSend | BufferState::ReadyToResend
            )
        })?;

        held.buffer.header_mut().ack_seq_num = watermark;
        held.buffer.set_state(now, BufferState::SendPosted, "send");
        let frame = Bytes::copy_from_slice(held.buffer.frame_bytes());
        held.buffer.set_state(now, BufferState::Sent, "send");
        if held.first_posted_at.is_none() {
            held.first_posted_at = Some(now);
        }
        held.attempt += 1;
        held.next_resend_at = now + resend_backoff(base_holdoff, max_holdoff, held.attempt);

        self.last_ack_sent = watermark;
        self.ack_due_at = None;
        self.last_send_at = now;
        #[allow(clippy::cast_precision_loss)]
        self.stats.tx.bytes.record(frame.len() as f64);
        self.stats.tx.buffers.record(1.0);
        Some(frame)
    }

    /// Advances the outbound watermark: every held buffer with a sequence
    /// number at or below `watermark` becomes delivered, notifies its
    /// message, and returns to the pool.
    pub(crate) fn process_ack(&mut self, now: Instant, watermark: BufferSeq) {
        let mut advanced = false;
        loop {
            let covered = self
                .held
                .front()
                .is_some_and(|h| h.buffer.header().seq_num <= watermark);
            if !covered {
                break;
            }
            let Some(mut held) = self.held.pop_front() else {
                break;
            };
            advanced = true;
            held.buffer.set_state(now, BufferState::Delivered, "acked");
            if let Some(first) = held.first_posted_at {
                self.stats
                    .tx
                    .buffer_delay
                    .record(now.saturating_duration_since(first));
            }
            if let Some((id, _)) = held.message {
                self.note_message_buffer_delivered(now, id);
            }
            self.pool.release(now, Some(held.buffer), "delivered");
        }
        if advanced {
            self.stats.rx.acks.record(1.0);
        }
    }

    fn note_message_buffer_delivered(&mut self, now: Instant, id: MessageId) {
        let Some(outbound) = self.outbound_msgs.get_mut(&id) else {
            return;
        };
        outbound.remaining = outbound.remaining.saturating_sub(1);
        if outbound.remaining > 0 {
            return;
        }
        if let Some(outbound) = self.outbound_msgs.remove(&id) {
            self.stats
                .tx
                .message_delay
                .record(now.saturating_duration_since(outbound.posted_at));
            self.events.push_back(SessionEvent::MessageDelivered {
                stream: outbound.stream,
                message: id,
            });
        }
    }

    /// Encodes `mgmt` into a management frame and queues it ahead of data.
    pub(crate) fn queue_management(&mut self, now: Instant, mgmt: &Management) {
        let payload = match mgmt.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(session = %self.session_uuid, %err, "dropping malformed management frame");
                return;
            }
        };
        let header = FrameHeader {
            purpose: Purpose::Management,
            flags: FrameFlags::MESSAGE_CONTAINS_JSON_NVS,
            length: FrameHeader::LEN as u16,
            seq_num: BufferSeq::ZERO,
            ack_seq_num: self.last_recv_seq,
            message_stream: StreamId::BASE,
        };
        let mut frame = BytesMut::with_capacity(FrameHeader::LEN + payload.len());
        header.encode(&mut frame);
        frame.put_slice(&payload);

        #[allow(clippy::cast_precision_loss)]
        self.stats.tx.bytes.record(frame.len() as f64);
        self.stats.events.management_frames_tx += 1;
        if mgmt.ty == ManagementType::KeepAlive {
            self.stats.events.keep_alives_tx += 1;
        }
        self.last_ack_sent = self.last_recv_seq;
        self.ack_due_at = None;
        self.last_send_at = now;
        self.send_now.push_back(frame.freeze());
    }

    pub(crate) fn send_ack_frame(&mut self, now: Instant) {
        let header = FrameHeader {
            purpose: Purpose::Ack,
            flags: FrameFlags::empty(),
            length: FrameHeader::LEN as u16,
            seq_num: BufferSeq::ZERO,
            ack_seq_num: self.last_recv_seq,
            message_stream: StreamId::BASE,
        };
        let mut frame = BytesMut::with_capacity(FrameHeader::LEN);
        header.encode(&mut frame);
        #[allow(clippy::cast_precision_loss)]
        self.stats.tx.bytes.record(frame.len() as f64);
        self.stats.tx.acks.record(1.0);
        self.last_ack_sent = self.last_recv_seq;
        self.ack_due_at = None;
        self.last_send_at = now;
        self.send_now.push_back(frame.freeze());
    }

    /// Retransmission aging, coalesced-ack emission and keep-alive timing.
    pub(crate) fn service_send(&mut self, now: Instant) -> u32 {
        if !self.state.is_connected() {
            return 0;
        }
        let mut work = 0;

        let max_held_time = self.config.max_held_time;
        let mut held_timed_out = false;
        for held in &mut self.held {
            if held.buffer.state() != BufferState::Sent {
                continue;
            }
            if held
                .first_posted_at
                .is_some_and(|first| now.saturating_duration_since(first) > max_held_time)
            {
                held_timed_out = true;
                break;
            }
            if now >= held.next_resend_at {
                held.buffer.header_mut().flags |= FrameFlags::BUFFER_IS_BEING_RESENT;
                held.buffer.set_state(now, BufferState::ReadyToResend, "retransmit");
                self.stats.events.buffers_resent_tx += 1;
                work += 1;
            }
        }
        if held_timed_out {
            self.terminate_inner(now, super::TerminationReason::HeldBufferTimeout, true);
            return work + 1;
        }

        if self.ack_due_at.is_some_and(|at| now >= at) {
            self.send_ack_frame(now);
            work += 1;
        }

        if now.saturating_duration_since(self.last_send_at) >= self.keep_alive_interval {
            self.queue_management(now, &Management::keep_alive());
            self.last_keep_alive_sent_at = Some(now);
            self.keep_alive_interval =
                (self.keep_alive_interval * 2).min(self.config.max_keep_alive_send_interval);
            work += 1;
        }

        work
    }

    pub(crate) fn note_app_traffic(&mut self, now: Instant) {
        self.last_app_traffic_at = now;
        if matches!(
            self.state,
            super::SessionStateCode::Idle | super::SessionStateCode::IdleWithPendingWork
        ) {
            self.set_state(now, super::SessionStateCode::Active, "application traffic");
        }
    }
}

fn resend_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << shift).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        SessionConfig, SessionStateCode,
        test_util::{connected_client, data_message, decode_header},
    };

    #[test]
    fn sequence_numbers_strictly_increase_from_one() {
        let now = Instant::now();
        let mut session = connected_client(now, SessionConfig::default());
        for _ in 0..3 {
            let message = data_message(&mut session, StreamId::BASE, &[1, 2, 3]);
            session.queue_message(now, message).unwrap();
        }
        let mut seqs = Vec::new();
        while let Some(frame) = session.poll_outbound(now) {
            seqs.push(decode_header(&frame).seq_num.0);
        }
        assert_eq!(vec![1, 2, 3], seqs);
    }

    #[test]
    fn multi_buffer_message_purposes() {
        let now = Instant::now();
        let mut session = connected_client(now, SessionConfig::default());
        let payload = vec![0xA5; 2500];
        let message = data_message(&mut session, StreamId::BASE, &payload);
        assert_eq!(3, message.buffer_count());
        session.queue_message(now, message).unwrap();

        let mut headers = Vec::new();
        while let Some(frame) = session.poll_outbound(now) {
            headers.push(decode_header(&frame));
        }
        assert_eq!(3, headers.len());
        assert_eq!(Purpose::MessageStart, headers[0].purpose);
        assert_eq!(Purpose::MessageMiddle, headers[1].purpose);
        assert_eq!(Purpose::MessageEnd, headers[2].purpose);
        assert_eq!(
            vec![1, 2, 3],
            headers.iter().map(|h| h.seq_num.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn cumulative_ack_delivers_each_buffer_once() {
        let now = Instant::now();
        let mut session = connected_client(now, SessionConfig::default());
        for _ in 0..5 {
            let message = data_message(&mut session, StreamId::BASE, &[9]);
            session.queue_message(now, message).unwrap();
        }
        while session.poll_outbound(now).is_some() {}
        assert_eq!(5, session.held_count());

        session.process_ack(now, BufferSeq::new(3));
        assert_eq!(vec![4, 5], session.held_seq_nums());

        let mut delivered = 0;
        while let Some(event) = session.poll_event() {
            if matches!(event, SessionEvent::MessageDelivered { .. }) {
                delivered += 1;
            }
        }
        assert_eq!(3, delivered);

        // a repeated or lower watermark touches nothing
        session.process_ack(now, BufferSeq::new(3));
        assert_eq!(vec![4, 5], session.held_seq_nums());
        assert!(
            !session
                .poll_event()
                .is_some_and(|event| matches!(event, SessionEvent::MessageDelivered { .. }))
        );
    }

    #[test]
    fn backpressure_at_held_window() {
        let now = Instant::now();
        let config = SessionConfig {
            max_held_buffers: 2,
            ..SessionConfig::default()
        };
        let mut session = connected_client(now, config);
        let first = data_message(&mut session, StreamId::BASE, &[1]);
        session.queue_message(now, first).unwrap();
        let second = data_message(&mut session, StreamId::BASE, &[2]);
        session.queue_message(now, second).unwrap();

        let third = data_message(&mut session, StreamId::BASE, &[3]);
        assert_eq!(Err(QueueError::Backpressure), session.queue_message(now, third).map(|_| ()));

        // acks open the window again
        while session.poll_outbound(now).is_some() {}
        session.process_ack(now, BufferSeq::new(2));
        let fourth = data_message(&mut session, StreamId::BASE, &[4]);
        session.queue_message(now, fourth).unwrap();
    }

    #[test]
    fn retransmit_sets_resent_flag_and_backs_off() {
        let now = Instant::now();
        let config = SessionConfig::default();
        let holdoff = config.retransmit_holdoff;
        let mut session = connected_client(now, config);
        let message = data_message(&mut session, StreamId::BASE, &[7]);
        session.queue_message(now, message).unwrap();
        let first = session.poll_outbound(now).unwrap();
        assert!(
            !decode_header(&first)
                .flags
                .contains(FrameFlags::BUFFER_IS_BEING_RESENT)
        );

        // not yet due
        let before = now + holdoff / 2;
        assert_eq!(0, session.service_send(before));
        assert!(session.poll_outbound(before).is_none());

        let due = now + holdoff + Duration::from_millis(1);
        assert!(session.service_send(due) >= 1);
        let resent = session.poll_outbound(due).unwrap();
        let header = decode_header(&resent);
        assert!(header.flags.contains(FrameFlags::BUFFER_IS_BEING_RESENT));
        assert_eq!(1, header.seq_num.0);

        // second retransmission waits twice as long
        let too_soon = due + holdoff + Duration::from_millis(1);
        assert_eq!(0, session.service_send(too_soon));
        let due2 = due + holdoff * 2 + Duration::from_millis(1);
        assert!(session.service_send(due2) >= 1);
        assert!(session.poll_outbound(due2).is_some());
    }

    #[test]
    fn held_timeout_terminates() {
        let now = Instant::now();
        let config = SessionConfig {
            max_held_time: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = connected_client(now, config);
        let message = data_message(&mut session, StreamId::BASE, &[7]);
        let id = session.queue_message(now, message).unwrap();
        while session.poll_outbound(now).is_some() {}

        let late = now + Duration::from_millis(100);
        session.service_send(late);
        assert_eq!(SessionStateCode::Terminated, session.state());

        let mut failed = None;
        while let Some(event) = session.poll_event() {
            if let SessionEvent::MessageFailed { message, .. } = event {
                failed = Some(message);
            }
        }
        assert_eq!(Some(id), failed);
    }

    #[test]
    fn keep_alive_emitted_once_per_quiet_interval() {
        let now = Instant::now();
        let config = SessionConfig::default();
        let interval = config.nominal_keep_alive_send_interval;
        let mut session = connected_client(now, config);

        // quiet for just under the interval: nothing
        session.service_send(now + interval / 2);
        assert!(session.poll_outbound(now + interval / 2).is_none());

        let due = now + interval;
        session.service_send(due);
        let frame = session.poll_outbound(due).unwrap();
        let header = decode_header(&frame);
        assert_eq!(Purpose::Management, header.purpose);
        let mgmt = Management::decode(&frame[FrameHeader::LEN..]).unwrap();
        assert_eq!(ManagementType::KeepAlive, mgmt.ty);

        // still quiet, same instant: no second keep-alive
        session.service_send(due);
        assert!(session.poll_outbound(due).is_none());
        assert_eq!(1, session.stats().events.keep_alives_tx);

        // hearing anything from the peer confirms the keep-alive delivered
        assert_eq!(None, session.last_delivered_keep_alive_at());
        let answered = due + Duration::from_millis(5);
        let ack = FrameHeader {
            purpose: Purpose::Ack,
            ..FrameHeader::default()
        };
        session.recv_frame(answered, &ack.to_bytes());
        assert_eq!(Some(answered), session.last_delivered_keep_alive_at());
    }
}
