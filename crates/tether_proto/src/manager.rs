//! See [`SessionManager`].

use std::collections::VecDeque;

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use web_time::Instant;

use crate::{
    mgmt::{Management, ManagementType},
    mux::StreamMux,
    session::{ConnectionSession, SessionConfig, SessionStateCode, TerminationReason},
    stats::EventCounters,
    ty::{BufferSeq, FrameFlags, FrameHeader, Purpose, StreamId},
};

/// Opaque identity of one transport connection, assigned by the host's
/// accept loop.
pub type ConnId = u64;

/// Something the manager observed; drained with
/// [`SessionManager::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A new session was opened.
    SessionOpened {
        /// Its identity.
        uuid: Uuid,
    },
    /// An existing session was re-bound to a new connection.
    SessionResumed {
        /// Its identity.
        uuid: Uuid,
    },
    /// A permanently closed session was swept away.
    SessionRemoved {
        /// Its identity.
        uuid: Uuid,
    },
}

#[derive(Debug)]
struct ServerEntry {
    session: ConnectionSession,
    mux: StreamMux,
    conn: ConnId,
}

/// Accepts and routes sessions on the server side.
///
/// Frames arriving on a connection not yet bound to a session must be
/// management open or resume requests; anything else is counted and dropped.
/// An open instantiates a [`ConnectionSession`] (with its stream
/// multiplexer); a resume re-binds an existing one. There is at most one
/// session per uuid: a newer open forcibly terminates the older session.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    server_info: Value,
    sessions: AHashMap<Uuid, ServerEntry>,
    names: AHashMap<String, Uuid>,
    conns: AHashMap<ConnId, Uuid>,
    outbound: VecDeque<(ConnId, Bytes)>,
    events: VecDeque<ManagerEvent>,
    counters: EventCounters,
}

impl SessionManager {
    /// Creates a manager that will configure every accepted session with
    /// `config` and advertise `server_info` from each session's base tool.
    #[must_use]
    pub fn new(config: SessionConfig, server_info: Value) -> Self {
        Self {
            config,
            server_info,
            sessions: AHashMap::new(),
            names: AHashMap::new(),
            conns: AHashMap::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            counters: EventCounters::default(),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The identities of every live session.
    #[must_use]
    pub fn session_uuids(&self) -> Vec<Uuid> {
        self.sessions.keys().copied().collect()
    }

    /// Finds a session by uuid.
    pub fn session_mut(&mut self, uuid: Uuid) -> Option<&mut ConnectionSession> {
        self.sessions.get_mut(&uuid).map(|entry| &mut entry.session)
    }

    /// Finds a session's stream multiplexer by uuid.
    pub fn mux_mut(&mut self, uuid: Uuid) -> Option<&mut StreamMux> {
        self.sessions.get_mut(&uuid).map(|entry| &mut entry.mux)
    }

    /// Finds a session by name.
    #[must_use]
    pub fn uuid_for_name(&self, name: &str) -> Option<Uuid> {
        self.names.get(name).copied()
    }

    /// Manager-level event counters (unexpected frames, etc.).
    #[must_use]
    pub const fn counters(&self) -> &EventCounters {
        &self.counters
    }

    /// Drains one pending manager event.
    pub fn poll_event(&mut self) -> Option<ManagerEvent> {
        self.events.pop_front()
    }

    /// Drains one frame to hand to the transport for `ConnId`.
    pub fn poll_outbound(&mut self) -> Option<(ConnId, Bytes)> {
        self.outbound.pop_front()
    }

    /// Routes one raw inbound frame from connection `conn`.
    pub fn handle_frame(&mut self, now: Instant, conn: ConnId, frame: &[u8]) {
        if let Some(uuid) = self.conns.get(&conn).copied() {
            if let Some(entry) = self.sessions.get_mut(&uuid) {
                entry.session.recv_frame(now, frame);
                return;
            }
            self.conns.remove(&conn);
        }

        // an unbound connection may only speak the management sub-protocol
        let header = match FrameHeader::decode(&mut &frame[..]) {
            Ok(header) => header,
            Err(err) => {
                warn!(conn, %err, "dropping invalid frame on unbound connection");
                self.counters.invalid_frames += 1;
                return;
            }
        };
        if header.purpose != Purpose::Management {
            warn!(conn, purpose = ?header.purpose, "non-management frame on unbound connection");
            self.counters.unexpected_manager_frames += 1;
            return;
        }
        let mgmt = match Management::decode(&frame[FrameHeader::LEN..]) {
            Ok(mgmt) => mgmt,
            Err(err) => {
                warn!(conn, %err, "dropping bad management frame on unbound connection");
                self.counters.invalid_frames += 1;
                return;
            }
        };
        self.counters.management_frames_rx += 1;
        match mgmt.ty {
            ManagementType::RequestOpenSession => self.open_session(now, conn, &mgmt),
            ManagementType::RequestResumeSession => self.resume_session(now, conn, &mgmt),
            _ => {
                warn!(conn, ty = mgmt.ty.as_str(), "unexpected management frame on unbound connection");
                self.counters.unexpected_manager_frames += 1;
            }
        }
    }

    /// A transport connection went away; the session bound to it (if any)
    /// decides whether to await a resume or terminate.
    pub fn transport_disconnected(&mut self, now: Instant, conn: ConnId, reason: &str) {
        let Some(uuid) = self.conns.remove(&conn) else {
            return;
        };
        if let Some(entry) = self.sessions.get_mut(&uuid) {
            entry.session.transport_disconnected(now, reason);
        }
    }

    fn open_session(&mut self, now: Instant, conn: ConnId, open: &Management) {
        let Some(uuid) = open.session_uuid else {
            self.counters.unexpected_manager_frames += 1;
            return;
        };
        // a newer open for the same uuid displaces the old session
        if let Some(mut prior) = self.sessions.remove(&uuid) {
            info!(session = %uuid, "open request displaces existing session");
            prior
                .session
                .terminate(now, TerminationReason::Replaced);
            self.flush_entry(now, &mut prior);
            self.conns.retain(|_, bound| *bound != uuid);
            self.events.push_back(ManagerEvent::SessionRemoved { uuid });
        }

        let session = ConnectionSession::server(now, self.config.clone(), open);
        let mux = StreamMux::server(self.server_info.clone());
        if let Some(name) = &open.name {
            self.names.insert(name.clone(), uuid);
        }
        self.conns.insert(conn, uuid);
        self.sessions.insert(
            uuid,
            ServerEntry {
                session,
                mux,
                conn,
            },
        );
        debug!(session = %uuid, conn, "session opened");
        self.events.push_back(ManagerEvent::SessionOpened { uuid });
    }

    fn resume_session(&mut self, now: Instant, conn: ConnId, resume: &Management) {
        let Some(uuid) = resume.session_uuid else {
            self.counters.unexpected_manager_frames += 1;
            return;
        };
        let reply_terminated = |outbound: &mut VecDeque<(ConnId, Bytes)>, reason: &str| {
            let note = Management::terminated(Some(uuid), reason.to_owned());
            if let Some(frame) = management_frame(&note) {
                outbound.push_back((conn, frame));
            }
        };
        let Some(entry) = self.sessions.get_mut(&uuid) else {
            debug!(session = %uuid, "resume for unknown session");
            reply_terminated(&mut self.outbound, "unknown session");
            return;
        };
        if entry.session.state() == SessionStateCode::Terminated {
            // termination is permanent; a terminated session never resumes.
            // A ConnectionClosed session that is still registered falls
            // through and re-binds.
            debug!(session = %uuid, "resume for terminated session");
            reply_terminated(&mut self.outbound, "session terminated");
            return;
        }
        self.conns.retain(|_, bound| *bound != uuid);
        self.conns.insert(conn, uuid);
        entry.conn = conn;
        entry.session.rebind(now, resume);
        debug!(session = %uuid, conn, "session resumed");
        self.events.push_back(ManagerEvent::SessionResumed { uuid });
    }

    /// Services every session and its multiplexer, collects their outbound
    /// frames, and sweeps terminated sessions. Returns the work count.
    ///
    /// Only [`SessionStateCode::Terminated`] sessions are removed; a
    /// `ConnectionClosed` session stays registered (and resumable) until its
    /// own service tick finishes the cleanup and terminates it, which
    /// happens at the top of this loop.
    pub fn service(&mut self, now: Instant) -> u32 {
        let mut work = 0;
        let mut swept = Vec::new();
        for (uuid, entry) in &mut self.sessions {
            work += entry.session.service(now);
            work += entry.mux.service(now, &mut entry.session);
            while let Some(frame) = entry.session.poll_outbound(now) {
                self.outbound.push_back((entry.conn, frame));
                work += 1;
            }
            if entry.session.state() == SessionStateCode::Terminated {
                swept.push(*uuid);
            }
        }
        for uuid in swept {
            if self.sessions.remove(&uuid).is_some() {
                self.names.retain(|_, bound| *bound != uuid);
                self.conns.retain(|_, bound| *bound != uuid);
                debug!(session = %uuid, "session swept");
                self.events.push_back(ManagerEvent::SessionRemoved { uuid });
                work += 1;
            }
        }
        work
    }

    fn flush_entry(&mut self, now: Instant, entry: &mut ServerEntry) {
        while let Some(frame) = entry.session.poll_outbound(now) {
            self.outbound.push_back((entry.conn, frame));
        }
    }
}

/// Encodes a management payload into a standalone frame, for replies that
/// have no session to speak through.
fn management_frame(mgmt: &Management) -> Option<Bytes> {
    let payload = mgmt.encode().ok()?;
    let header = FrameHeader {
        purpose: Purpose::Management,
        flags: FrameFlags::MESSAGE_CONTAINS_JSON_NVS,
        length: FrameHeader::LEN as u16,
        seq_num: BufferSeq::ZERO,
        ack_seq_num: BufferSeq::ZERO,
        message_stream: StreamId::BASE,
    };
    let mut frame = BytesMut::with_capacity(FrameHeader::LEN + payload.len());
    header.encode(&mut frame);
    frame.put_slice(&payload);
    Some(frame.freeze())
}
