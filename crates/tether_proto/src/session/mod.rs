//! See [`ConnectionSession`].

mod config;
mod recv;
mod send;

pub use config::*;

use std::collections::{BTreeMap, VecDeque};

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;
use web_time::{Duration, Instant};

use crate::{
    buffer::{Buffer, BufferPool, BufferState},
    message::{Message, MessageId},
    mgmt::{Management, ManagementType},
    stats::SessionStats,
    ty::{BufferSeq, StreamId},
};

/// Which endpoint of the session this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The endpoint that opens the session.
    Client,
    /// The endpoint that accepts it.
    Server,
}

/// State of a [`ConnectionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStateCode {
    /// Client constructed, not yet told to go online.
    ClientSessionInitial,
    /// Server constructed, open request not yet processed.
    ServerSessionInitial,
    /// Waiting for the transport to report connected.
    RequestTransportConnect,
    /// Open or resume request sent; waiting for the peer's acceptance.
    RequestSessionOpen,
    /// Connected with recent application traffic.
    Active,
    /// Connected and quiet, nothing held.
    Idle,
    /// Connected and quiet, but held buffers are awaiting acknowledgement.
    IdleWithPendingWork,
    /// A graceful close is underway.
    CloseRequested,
    /// Gracefully closed; awaiting the final cleanup tick.
    ConnectionClosed,
    /// Gone for good. Terminal.
    Terminated,
}

impl SessionStateCode {
    /// Whether the session can carry application traffic.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::IdleWithPendingWork)
    }

    /// Whether the session is gone and can never carry traffic again.
    #[must_use]
    pub const fn is_permanently_closed(self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Terminated)
    }
}

/// Why a session reached [`SessionStateCode::Terminated`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerminationReason {
    /// The session-open negotiation reported an incompatible buffer size.
    #[error("buffer sizes do not match")]
    BufferSizesDoNotMatch,
    /// The peer sent `NoteSessionTerminated`. Once received this is
    /// permanent; the session may not be resumed.
    #[error("peer terminated session: {0}")]
    PeerTerminated(String),
    /// A held buffer's total in-flight time exceeded the configured maximum.
    #[error("held buffer exceeded max held time")]
    HeldBufferTimeout,
    /// Going online did not complete within the configured wait.
    #[error("session connect timed out")]
    ConnectTimeout,
    /// The transport disconnected and auto-reconnect is not available.
    #[error("transport lost: {0}")]
    TransportLost(String),
    /// A newer open request for the same uuid displaced this session.
    #[error("session replaced by a newer open")]
    Replaced,
}

impl TerminationReason {
    /// Whether this termination forbids a later automatic reconnect.
    #[must_use]
    pub const fn suppresses_reconnect(&self) -> bool {
        !matches!(self, Self::TransportLost(_))
    }
}

/// Host-facing projection of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Nothing is in progress.
    Disconnected,
    /// Connecting or opening.
    Connecting,
    /// Connected and healthy.
    Connected,
    /// Connected but nothing has been received for the degraded holdoff.
    ConnectionDegraded,
    /// Terminated for a reason that suppresses reconnecting.
    ConnectionFailed,
}

/// Something the session observed or decided; drained with
/// [`ConnectionSession::poll_event`].
#[derive(Debug)]
pub enum SessionEvent {
    /// The state machine moved.
    StateChanged {
        /// Previous state.
        from: SessionStateCode,
        /// New state.
        to: SessionStateCode,
    },
    /// The peer accepted our open request.
    SessionOpened,
    /// The peer accepted our resume request.
    SessionResumed {
        /// Highest sequence number the peer reported having received
        /// contiguously.
        peer_last_recv: BufferSeq,
    },
    /// A complete message was reassembled on a stream.
    MessageReceived {
        /// The stream it arrived on.
        stream: StreamId,
        /// The reassembled message, owning its buffers.
        message: Message,
    },
    /// Every buffer of a previously queued message is now covered by the
    /// peer's cumulative acknowledgement; its buffers have been returned to
    /// the pool.
    MessageDelivered {
        /// The stream it was queued on.
        stream: StreamId,
        /// The message's instance number.
        message: MessageId,
    },
    /// A previously queued message will never be delivered. Its buffers are
    /// not recycled.
    MessageFailed {
        /// The stream it was queued on.
        stream: StreamId,
        /// The message's instance number.
        message: MessageId,
        /// Why delivery failed.
        reason: String,
    },
    /// The peer sent a diagnostic status frame.
    PeerStatus {
        /// Sequence numbers of the peer's held buffers.
        held_buffer_seq_nums: Vec<u64>,
    },
    /// The peer asked for a graceful close.
    CloseRequestedByPeer,
    /// The graceful close completed.
    Closed,
    /// The session is gone.
    Terminated {
        /// Why.
        reason: TerminationReason,
    },
}

/// A message could not be queued for sending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The session is not in a connected state.
    #[error("session is not connected (state {state:?})")]
    NotConnected {
        /// The state the session was in.
        state: SessionStateCode,
    },
    /// A message with zero buffers is local-only.
    #[error("message has no buffers")]
    EmptyMessage,
    /// Queuing would exceed the held-buffer cap; retry after acks advance.
    #[error("held buffer window is full")]
    Backpressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRequest {
    Open,
    Resume,
}

#[derive(Debug)]
pub(crate) struct HeldBuffer {
    pub(crate) buffer: Buffer,
    pub(crate) message: Option<(MessageId, bool)>,
    pub(crate) first_posted_at: Option<Instant>,
    pub(crate) attempt: u32,
    pub(crate) next_resend_at: Instant,
}

#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub(crate) stream: StreamId,
    pub(crate) remaining: usize,
    pub(crate) posted_at: Instant,
}

/// One end of a session: the state machine that opens, resumes and closes a
/// logical connection, assigns sequence numbers, tracks held buffers,
/// retransmits, keeps alive, produces cumulative acknowledgements, and
/// reassembles fragmented messages per stream.
///
/// The session is sans-IO: inbound frames are pushed in with
/// [`ConnectionSession::recv_frame`], outbound frames are pulled out with
/// [`ConnectionSession::poll_outbound`], timers fire inside
/// [`ConnectionSession::service`], and everything the session decided is
/// drained with [`ConnectionSession::poll_event`]. All calls happen on one
/// service thread.
#[derive(Debug)]
pub struct ConnectionSession {
    side: Side,
    name: String,
    session_uuid: Uuid,
    client_uuid: Uuid,
    client_instance: u64,
    config: SessionConfig,
    pool: BufferPool,

    state: SessionStateCode,
    state_changed_at: Instant,
    termination: Option<TerminationReason>,
    awaiting: Option<PendingRequest>,
    resume_pending: bool,
    opened: bool,
    reconnect_at: Option<Instant>,

    // outbound
    next_send_seq: BufferSeq,
    held: VecDeque<HeldBuffer>,
    send_now: VecDeque<Bytes>,
    last_ack_sent: BufferSeq,
    outbound_msgs: AHashMap<MessageId, OutboundMessage>,

    // inbound
    last_recv_seq: BufferSeq,
    reorder: BTreeMap<u64, (Buffer, Instant)>,
    reassembly: AHashMap<StreamId, Vec<Buffer>>,

    // timing
    last_send_at: Instant,
    last_recv_at: Instant,
    last_app_traffic_at: Instant,
    keep_alive_interval: Duration,
    last_keep_alive_sent_at: Option<Instant>,
    last_delivered_keep_alive_at: Option<Instant>,
    ack_due_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    close_deadline: Option<Instant>,

    events: VecDeque<SessionEvent>,
    stats: SessionStats,
}

impl ConnectionSession {
    fn new(now: Instant, side: Side, name: String, config: SessionConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.max_total_pool_bytes);
        let keep_alive_interval = config.nominal_keep_alive_send_interval;
        Self {
            side,
            name,
            session_uuid: Uuid::new_v4(),
            client_uuid: Uuid::new_v4(),
            client_instance: 1,
            config,
            pool,
            state: match side {
                Side::Client => SessionStateCode::ClientSessionInitial,
                Side::Server => SessionStateCode::ServerSessionInitial,
            },
            state_changed_at: now,
            termination: None,
            awaiting: None,
            resume_pending: false,
            opened: false,
            reconnect_at: None,
            next_send_seq: BufferSeq::ZERO,
            held: VecDeque::new(),
            send_now: VecDeque::new(),
            last_ack_sent: BufferSeq::ZERO,
            outbound_msgs: AHashMap::new(),
            last_recv_seq: BufferSeq::ZERO,
            reorder: BTreeMap::new(),
            reassembly: AHashMap::new(),
            last_send_at: now,
            last_recv_at: now,
            last_app_traffic_at: now,
            keep_alive_interval,
            last_keep_alive_sent_at: None,
            last_delivered_keep_alive_at: None,
            ack_due_at: None,
            connect_deadline: None,
            close_deadline: None,
            events: VecDeque::new(),
            stats: SessionStats::new(now),
        }
    }

    /// Creates the client end of a session named `name`.
    #[must_use]
    pub fn client(now: Instant, name: impl Into<String>, config: SessionConfig) -> Self {
        Self::new(now, Side::Client, name.into(), config)
    }

    /// Creates the server end of a session from a received
    /// [`ManagementType::RequestOpenSession`], immediately queuing the
    /// acceptance response.
    ///
    /// The response confirms this server's own configured buffer size; if it
    /// differs from the client's advertised size the session also terminates
    /// itself with [`TerminationReason::BufferSizesDoNotMatch`], and the
    /// client will do the same on seeing the mismatched acceptance.
    #[must_use]
    pub fn server(now: Instant, config: SessionConfig, open: &Management) -> Self {
        let mut session = Self::new(
            now,
            Side::Server,
            open.name.clone().unwrap_or_default(),
            config,
        );
        if let Some(uuid) = open.session_uuid {
            session.session_uuid = uuid;
        }
        if let Some(uuid) = open.client_uuid {
            session.client_uuid = uuid;
        }
        session.client_instance = open.client_instance.unwrap_or(0);

        let own_size = session.config.buffer_size as u64;
        let accepted = Management::accepted(
            session.name.clone(),
            session.session_uuid,
            own_size,
            session.last_recv_seq.0,
        );
        session.queue_management(now, &accepted);
        if open.buffer_size == Some(own_size) {
            session.opened = true;
            session.set_state(now, SessionStateCode::Active, "session opened");
            session.events.push_back(SessionEvent::SessionOpened);
        } else {
            session.terminate_inner(now, TerminationReason::BufferSizesDoNotMatch, true);
        }
        session
    }

    /// The session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The session's stable identity.
    #[must_use]
    pub const fn session_uuid(&self) -> Uuid {
        self.session_uuid
    }

    /// Which endpoint this is.
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionStateCode {
        self.state
    }

    /// When the state last changed.
    #[must_use]
    pub const fn state_changed_at(&self) -> Instant {
        self.state_changed_at
    }

    /// Why the session terminated, if it has.
    #[must_use]
    pub const fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    /// The session's buffer pool. Tools acquire message buffers from here.
    pub const fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Counters for this session.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Number of sent-but-unacknowledged buffers.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Whether a message of `buffers` buffers could be queued right now
    /// without hitting back-pressure.
    #[must_use]
    pub fn can_queue(&self, buffers: usize) -> bool {
        self.state.is_connected()
            && buffers > 0
            && self.held.len() + buffers <= self.config.max_held_buffers
    }

    /// Records a protocol-warning event observed above the session layer.
    pub(crate) fn note_protocol_warning(&mut self) {
        self.stats.events.protocol_violations += 1;
    }

    /// Records a transport error reported by the host. Errors that cost the
    /// connection are reported through
    /// [`ConnectionSession::transport_disconnected`] instead.
    pub fn note_transport_error(&mut self) {
        self.stats.events.transport_errors += 1;
    }

    /// Sequence numbers of the held buffers, oldest first.
    #[must_use]
    pub fn held_seq_nums(&self) -> Vec<u64> {
        self.held.iter().map(|h| h.buffer.header().seq_num.0).collect()
    }

    /// Highest sequence number received contiguously from the peer.
    #[must_use]
    pub const fn last_recv_seq(&self) -> BufferSeq {
        self.last_recv_seq
    }

    /// When the most recent keep-alive we sent was confirmed delivered, if
    /// ever. A keep-alive counts as delivered once any frame arrives from
    /// the peer after it was sent.
    #[must_use]
    pub const fn last_delivered_keep_alive_at(&self) -> Option<Instant> {
        self.last_delivered_keep_alive_at
    }

    /// When the host should retry the transport connection, if an automatic
    /// reconnect is pending.
    #[must_use]
    pub const fn auto_reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// The host-facing projection of the session state.
    #[must_use]
    pub fn conn_state(&self, now: Instant) -> ConnState {
        match self.state {
            SessionStateCode::ClientSessionInitial | SessionStateCode::ServerSessionInitial => {
                ConnState::Disconnected
            }
            SessionStateCode::RequestTransportConnect | SessionStateCode::RequestSessionOpen => {
                ConnState::Connecting
            }
            SessionStateCode::Active
            | SessionStateCode::Idle
            | SessionStateCode::IdleWithPendingWork
            | SessionStateCode::CloseRequested => {
                let holdoff = self.config.connection_degraded_holdoff;
                if !holdoff.is_zero()
                    && now.saturating_duration_since(self.last_recv_at) > holdoff
                {
                    ConnState::ConnectionDegraded
                } else {
                    ConnState::Connected
                }
            }
            SessionStateCode::ConnectionClosed => ConnState::Disconnected,
            SessionStateCode::Terminated => match &self.termination {
                Some(reason) if reason.suppresses_reconnect() => ConnState::ConnectionFailed,
                _ => ConnState::Disconnected,
            },
        }
    }

    /// Drains one pending event.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn set_state(&mut self, now: Instant, to: SessionStateCode, reason: &str) {
        if self.state == to {
            return;
        }
        let from = self.state;
        debug!(session = %self.session_uuid, ?from, ?to, reason, "session state change");
        self.state = to;
        self.state_changed_at = now;
        self.events.push_back(SessionEvent::StateChanged { from, to });
    }

    /// Starts bringing the client session online. The host connects the
    /// transport and reports completion with
    /// [`ConnectionSession::transport_connected`].
    pub fn go_online(&mut self, now: Instant) {
        if self.state != SessionStateCode::ClientSessionInitial {
            return;
        }
        self.connect_deadline = Some(now + self.config.max_session_connect_wait);
        self.set_state(now, SessionStateCode::RequestTransportConnect, "go online");
    }

    /// The transport finished connecting; sends the open (or resume) request.
    pub fn transport_connected(&mut self, now: Instant) {
        if self.state != SessionStateCode::RequestTransportConnect {
            return;
        }
        let mgmt = if self.resume_pending {
            self.awaiting = Some(PendingRequest::Resume);
            Management::resume(
                self.name.clone(),
                self.session_uuid,
                self.config.buffer_size as u64,
                self.last_recv_seq.0,
            )
        } else {
            self.awaiting = Some(PendingRequest::Open);
            Management::open(
                self.name.clone(),
                self.session_uuid,
                self.client_uuid,
                self.client_instance,
                self.config.buffer_size as u64,
            )
        };
        self.queue_management(now, &mgmt);
        self.reconnect_at = None;
        self.set_state(now, SessionStateCode::RequestSessionOpen, "transport connected");
    }

    /// The transport lost its connection.
    ///
    /// An opened server session parks its state (held buffers, sequence
    /// numbers, in-progress reassembly) and waits for the client to resume.
    /// An opened client session does the same when auto-reconnect is
    /// configured, and re-opens the transport after the holdoff. Otherwise
    /// the session terminates with [`TerminationReason::TransportLost`].
    pub fn transport_disconnected(&mut self, now: Instant, reason: &str) {
        if self.state.is_permanently_closed() {
            return;
        }
        if matches!(self.state, SessionStateCode::CloseRequested) {
            // the peer went away mid-close; good enough
            self.set_state(now, SessionStateCode::ConnectionClosed, "closed on disconnect");
            self.events.push_back(SessionEvent::Closed);
            return;
        }
        let resumable = self.opened
            && (self.side == Side::Server || self.config.auto_reconnect_holdoff.is_some());
        if resumable {
            if self.side == Side::Client {
                let holdoff = self
                    .config
                    .auto_reconnect_holdoff
                    .unwrap_or(Duration::ZERO);
                self.resume_pending = true;
                self.reconnect_at = Some(now + holdoff);
                self.connect_deadline =
                    Some(now + holdoff + self.config.max_session_auto_reconnect_wait);
            } else {
                // the server has no transport to re-open; the client's
                // resume request re-binds this session
                self.reconnect_at = None;
                self.connect_deadline = None;
            }
            self.send_now.clear();
            self.set_state(now, SessionStateCode::RequestTransportConnect, reason);
        } else {
            self.stats.events.transport_error_closures += 1;
            self.terminate_inner(now, TerminationReason::TransportLost(reason.into()), false);
        }
    }

    /// Starts a graceful close.
    pub fn request_close(&mut self, now: Instant) {
        if self.state.is_permanently_closed() {
            return;
        }
        if self.state.is_connected() {
            self.queue_management(now, &Management::close(self.session_uuid));
            self.close_deadline = Some(now + self.config.max_session_close_wait);
            self.set_state(now, SessionStateCode::CloseRequested, "local close");
        } else {
            self.terminate_inner(now, TerminationReason::TransportLost("closed before open".into()), false);
        }
    }

    /// Forces the session to [`SessionStateCode::Terminated`], notifying the
    /// peer on a best-effort basis.
    pub fn terminate(&mut self, now: Instant, reason: TerminationReason) {
        self.terminate_inner(now, reason, true);
    }

    fn terminate_inner(&mut self, now: Instant, reason: TerminationReason, notify_peer: bool) {
        if self.state.is_permanently_closed() {
            return;
        }
        if notify_peer {
            let note = Management::terminated(Some(self.session_uuid), reason.to_string());
            self.queue_management(now, &note);
        }
        for (message, outbound) in self.outbound_msgs.drain() {
            self.events.push_back(SessionEvent::MessageFailed {
                stream: outbound.stream,
                message,
                reason: reason.to_string(),
            });
        }
        // held buffers are not recycled: their messages failed
        for mut h in self.held.drain(..) {
            h.buffer.set_state(now, BufferState::Released, "terminated");
        }
        for (_, bufs) in self.reassembly.drain() {
            for buf in bufs {
                self.pool.release(now, Some(buf), "terminated");
            }
        }
        let reorder = std::mem::take(&mut self.reorder);
        for (_, (buf, _)) in reorder {
            self.pool.release(now, Some(buf), "terminated");
        }
        self.reconnect_at = None;
        self.resume_pending = false;
        self.termination = Some(reason.clone());
        self.set_state(now, SessionStateCode::Terminated, "terminated");
        self.events.push_back(SessionEvent::Terminated { reason });
    }

    /// Re-binds this server session to a new transport connection on receipt
    /// of a [`ManagementType::RequestResumeSession`].
    ///
    /// Queues the acceptance carrying our highest contiguously received
    /// sequence number, purges held buffers the peer already has, and marks
    /// the remainder for retransmission.
    ///
    /// Only [`SessionStateCode::Terminated`] is refused: termination is
    /// permanent, but a session that merely reached
    /// [`SessionStateCode::ConnectionClosed`] and has not yet had its final
    /// cleanup tick may still be brought back.
    pub fn rebind(&mut self, now: Instant, resume: &Management) {
        if self.state == SessionStateCode::Terminated {
            warn!(session = %self.session_uuid, "resume for a terminated session");
            return;
        }
        let own_size = self.config.buffer_size as u64;
        if resume.buffer_size != Some(own_size) {
            self.terminate_inner(now, TerminationReason::BufferSizesDoNotMatch, true);
            return;
        }
        let accepted = Management::accepted(
            self.name.clone(),
            self.session_uuid,
            own_size,
            self.last_recv_seq.0,
        );
        self.queue_management(now, &accepted);
        let peer_last_recv = BufferSeq::new(resume.last_recv_seq.unwrap_or(0));
        self.apply_resume_watermark(now, peer_last_recv);
        self.close_deadline = None;
        self.set_state(now, SessionStateCode::Active, "session resumed");
        self.events
            .push_back(SessionEvent::SessionResumed { peer_last_recv });
    }

    /// Purges held buffers at or below the peer's reported watermark, then
    /// marks every remaining held buffer for immediate retransmission.
    fn apply_resume_watermark(&mut self, now: Instant, peer_last_recv: BufferSeq) {
        self.process_ack(now, peer_last_recv);
        for h in &mut self.held {
            h.buffer.header_mut().flags |= crate::ty::FrameFlags::BUFFER_IS_BEING_RESENT;
            h.buffer.set_state(now, BufferState::ReadyToResend, "resume");
            h.first_posted_at = None;
            h.next_resend_at = now;
            self.stats.events.buffers_resent_tx += 1;
        }
    }

    pub(crate) fn handle_management(&mut self, now: Instant, mgmt: Management) {
        self.stats.events.management_frames_rx += 1;
        match mgmt.ty {
            ManagementType::SessionRequestAccepted => self.handle_accepted(now, &mgmt),
            ManagementType::RequestCloseSession => {
                self.events.push_back(SessionEvent::CloseRequestedByPeer);
                let note =
                    Management::terminated(Some(self.session_uuid), "close requested".to_owned());
                self.queue_management(now, &note);
                self.set_state(now, SessionStateCode::ConnectionClosed, "peer close");
                self.events.push_back(SessionEvent::Closed);
            }
            ManagementType::NoteSessionTerminated => {
                if self.state == SessionStateCode::CloseRequested {
                    self.set_state(now, SessionStateCode::ConnectionClosed, "close complete");
                    self.events.push_back(SessionEvent::Closed);
                } else {
                    let reason = mgmt.reason.unwrap_or_else(|| "unspecified".to_owned());
                    self.terminate_inner(now, TerminationReason::PeerTerminated(reason), false);
                }
            }
            ManagementType::Status => {
                self.events.push_back(SessionEvent::PeerStatus {
                    held_buffer_seq_nums: mgmt.held_buffer_seq_nums.unwrap_or_default(),
                });
            }
            ManagementType::KeepAlive => {
                self.stats.events.keep_alives_rx += 1;
            }
            ManagementType::RequestOpenSession | ManagementType::RequestResumeSession => {
                // open/resume routing is the session manager's job
                warn!(session = %self.session_uuid, ty = mgmt.ty.as_str(),
                    "unexpected management frame on an established session");
                self.stats.events.protocol_violations += 1;
            }
        }
    }

    fn handle_accepted(&mut self, now: Instant, mgmt: &Management) {
        let Some(pending) = self.awaiting.take() else {
            self.stats.events.protocol_violations += 1;
            return;
        };
        if self.state != SessionStateCode::RequestSessionOpen {
            self.stats.events.protocol_violations += 1;
            return;
        }
        if mgmt.buffer_size != Some(self.config.buffer_size as u64) {
            self.terminate_inner(now, TerminationReason::BufferSizesDoNotMatch, true);
            return;
        }
        self.connect_deadline = None;
        self.opened = true;
        match pending {
            PendingRequest::Open => {
                self.set_state(now, SessionStateCode::Active, "session accepted");
                self.events.push_back(SessionEvent::SessionOpened);
            }
            PendingRequest::Resume => {
                self.resume_pending = false;
                let peer_last_recv = BufferSeq::new(mgmt.last_recv_seq.unwrap_or(0));
                self.apply_resume_watermark(now, peer_last_recv);
                self.set_state(now, SessionStateCode::Active, "session resumed");
                self.events
                    .push_back(SessionEvent::SessionResumed { peer_last_recv });
            }
        }
    }

    /// Queues a diagnostic status frame carrying our held-buffer list.
    pub fn queue_status(&mut self, now: Instant) {
        let status = Management::status(self.held_seq_nums());
        self.queue_management(now, &status);
    }

    /// Returns a reassembled message's buffers to the session pool once the
    /// stream tool is done with it.
    pub fn recycle_message(&mut self, now: Instant, mut message: Message) {
        message.release(now, &mut self.pool, "recycled");
    }

    /// Runs the session's timers: retransmission, keep-alive, coalesced
    /// acks, idle transitions, connect/close deadlines and the per-second
    /// stats roll. Returns the number of units of work done, for the
    /// service loop's quick-wait credit.
    pub fn service(&mut self, now: Instant) -> u32 {
        let mut work = 0;

        // final cleanup tick: a session that reached ConnectionClosed on an
        // earlier tick finishes dying here
        if self.state == SessionStateCode::ConnectionClosed {
            for mut h in self.held.drain(..) {
                h.buffer.set_state(now, BufferState::Released, "closed");
            }
            for (_, bufs) in self.reassembly.drain() {
                for buf in bufs {
                    self.pool.release(now, Some(buf), "closed");
                }
            }
            self.set_state(now, SessionStateCode::Terminated, "cleanup");
            return 1;
        }

        // connect deadline
        let connecting = matches!(
            self.state,
            SessionStateCode::RequestTransportConnect | SessionStateCode::RequestSessionOpen
        );
        if connecting && self.connect_deadline.is_some_and(|deadline| now >= deadline) {
            self.connect_deadline = None;
            self.terminate_inner(now, TerminationReason::ConnectTimeout, true);
            return 1;
        }

        // close deadline: stop waiting for the peer's termination note
        if self.state == SessionStateCode::CloseRequested
            && self.close_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.close_deadline = None;
            self.set_state(now, SessionStateCode::ConnectionClosed, "close timed out");
            self.events.push_back(SessionEvent::Closed);
            work += 1;
        }

        work += self.service_send(now);

        if self.state.is_connected() {
            // idle tracking
            let quiet = now.saturating_duration_since(self.last_app_traffic_at)
                >= self.config.nominal_keep_alive_send_interval;
            let target = if !quiet {
                SessionStateCode::Active
            } else if self.held.is_empty() {
                SessionStateCode::Idle
            } else {
                SessionStateCode::IdleWithPendingWork
            };
            if self.state != target {
                self.set_state(now, target, "traffic level");
            }
        }

        self.stats.service(now);
        work
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use bytes::Bytes;
    use web_time::Instant;

    use super::{ConnectionSession, SessionConfig, SessionStateCode};
    use crate::{
        message::Message,
        mgmt::Management,
        ty::{FrameHeader, StreamId},
    };

    /// A client session driven straight to `Active` without a real peer.
    pub(crate) fn connected_client(now: Instant, config: SessionConfig) -> ConnectionSession {
        let mut session = ConnectionSession::client(now, "test", config);
        session.go_online(now);
        session.transport_connected(now);
        let accept = Management::accepted(
            "test",
            session.session_uuid(),
            session.config.buffer_size as u64,
            0,
        );
        session.handle_management(now, accept);
        assert_eq!(SessionStateCode::Active, session.state());
        // throw away the open request frame
        while session.poll_outbound(now).is_some() {}
        session
    }

    pub(crate) fn data_message(
        session: &mut ConnectionSession,
        stream: StreamId,
        payload: &[u8],
    ) -> Message {
        let now = Instant::now();
        let mut message = Message::new(stream);
        message
            .writer(session.pool_mut())
            .write(now, payload)
            .expect("pool should supply buffers");
        message
    }

    pub(crate) fn decode_header(frame: &Bytes) -> FrameHeader {
        FrameHeader::decode(&mut &frame[..]).expect("frame should carry a valid header")
    }
}
