//! See [`StreamMux`].

use serde_json::Value;
use tracing::{debug, warn};
use web_time::Instant;

use crate::{
    message::{Message, MessageId},
    session::{ConnectionSession, SessionEvent, Side, TerminationReason},
    tool::{
        BaseTool, StreamTool, StreamToolCore, TOOL_TYPE_KEY, ToolContext, ToolKind, ToolResetKind,
    },
    ty::{FrameFlags, StreamId},
};

/// Per-stream bookkeeping: the tool, the message it has in flight, and a
/// parked message waiting out back-pressure.
#[derive(Debug)]
struct StreamTracker {
    tool: StreamTool,
    in_flight: Option<MessageId>,
    parked: Option<Message>,
    setup_pending: bool,
}

impl StreamTracker {
    fn new(tool: StreamTool, setup_pending: bool) -> Self {
        Self {
            tool,
            in_flight: None,
            parked: None,
            setup_pending,
        }
    }
}

/// Dispatches a session's inbound messages to per-stream tools and schedules
/// their outbound messages, one in flight per stream.
///
/// Stream 0 always holds the [`BaseTool`]. On the server, additional streams
/// come into existence when a message carrying
/// [`FrameFlags::MESSAGE_CONTAINS_STREAM_SETUP`] arrives whose payload names
/// a [`ToolKind`]; on the client they are opened locally with
/// [`StreamMux::open_stream`].
#[derive(Debug)]
pub struct StreamMux {
    side: Side,
    streams: Vec<Option<StreamTracker>>,
}

impl StreamMux {
    /// Creates a client-side multiplexer with its base tool on stream 0.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Side::Client, BaseTool::client())
    }

    /// Creates a server-side multiplexer advertising `server_info` from its
    /// base tool.
    #[must_use]
    pub fn server(server_info: Value) -> Self {
        Self::new(Side::Server, BaseTool::server(server_info))
    }

    fn new(side: Side, base: BaseTool) -> Self {
        Self {
            side,
            streams: vec![Some(StreamTracker::new(StreamTool::Base(base), false))],
        }
    }

    /// The base tool on stream 0.
    ///
    /// # Panics
    ///
    /// Never panics; stream 0 always holds the base tool.
    #[must_use]
    pub fn base(&self) -> &BaseTool {
        self.streams[0]
            .as_ref()
            .and_then(|tracker| tracker.tool.as_base())
            .expect("stream 0 always holds the base tool")
    }

    /// The base tool on stream 0, mutably.
    ///
    /// # Panics
    ///
    /// Never panics; stream 0 always holds the base tool.
    pub fn base_mut(&mut self) -> &mut BaseTool {
        self.streams[0]
            .as_mut()
            .and_then(|tracker| tracker.tool.as_base_mut())
            .expect("stream 0 always holds the base tool")
    }

    /// The tool owning `stream`, if one exists.
    #[must_use]
    pub fn tool(&self, stream: StreamId) -> Option<&StreamTool> {
        self.streams
            .get(usize::from(stream.0))
            .and_then(Option::as_ref)
            .map(|tracker| &tracker.tool)
    }

    /// The tool owning `stream`, mutably.
    pub fn tool_mut(&mut self, stream: StreamId) -> Option<&mut StreamTool> {
        self.streams
            .get_mut(usize::from(stream.0))
            .and_then(Option::as_mut)
            .map(|tracker| &mut tracker.tool)
    }

    /// Opens a new local stream owned by a tool of `kind` configured with
    /// `params`. The first message the tool sends carries the stream-setup
    /// flag and must let the peer identify the tool type, so `params` is
    /// queued as the setup payload.
    ///
    /// Client-side operation; the server's streams are created by the setup
    /// pathway.
    pub fn open_stream(&mut self, now: Instant, kind: ToolKind, mut params: Value) -> StreamId {
        let index = self
            .streams
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.streams.push(None);
                self.streams.len() - 1
            });
        #[allow(clippy::cast_possible_truncation)]
        let stream = StreamId::new(index as u16);
        if let Some(obj) = params.as_object_mut() {
            obj.insert(TOOL_TYPE_KEY.into(), Value::String(kind.as_type_str().into()));
        } else {
            params = serde_json::json!({ TOOL_TYPE_KEY: kind.as_type_str() });
        }
        let ctx = ToolContext::new(stream, self.side, params.clone());
        let mut tracker = StreamTracker::new(StreamTool::from_setup(now, kind, ctx), true);
        // the setup payload itself is the stream's first message
        let setup_payload =
            serde_json::to_vec(&params).unwrap_or_else(|_| b"{}".to_vec());
        match &mut tracker.tool {
            StreamTool::Base(tool) => tool.queue_send(setup_payload),
            StreamTool::ActionRelay(tool) => tool.queue_send(setup_payload),
            StreamTool::SetRelay(tool) => tool.queue_send(setup_payload),
            StreamTool::IviRelay(tool) => tool.queue_send(setup_payload),
        }
        debug!(%stream, kind = kind.as_type_str(), "stream opened");
        self.streams[index] = Some(tracker);
        stream
    }

    /// Resets every tool, e.g. when the session is lost or closed.
    pub fn reset_all(&mut self, now: Instant, kind: ToolResetKind, reason: &str) {
        for tracker in self.streams.iter_mut().flatten() {
            tracker.tool.reset_state(now, kind, reason);
            tracker.in_flight = None;
            tracker.parked = None;
        }
    }

    /// One multiplexer tick: drains the session's events into the tools,
    /// then gives each stream a chance to send. Returns the work count.
    pub fn service(&mut self, now: Instant, session: &mut ConnectionSession) -> u32 {
        let mut work = 0;

        while let Some(event) = session.poll_event() {
            work += self.apply_event(now, session, event);
        }

        for index in 0..self.streams.len() {
            work += self.service_stream(now, session, index);
        }
        work
    }

    fn apply_event(
        &mut self,
        now: Instant,
        session: &mut ConnectionSession,
        event: SessionEvent,
    ) -> u32 {
        match event {
            SessionEvent::MessageReceived { stream, message } => {
                self.dispatch_inbound(now, session, stream, message);
                1
            }
            SessionEvent::MessageDelivered { stream, message } => {
                if let Some(tracker) = self
                    .streams
                    .get_mut(usize::from(stream.0))
                    .and_then(Option::as_mut)
                {
                    if tracker.in_flight == Some(message) {
                        tracker.in_flight = None;
                    }
                }
                1
            }
            SessionEvent::MessageFailed {
                stream,
                message,
                reason,
            } => {
                let kind = match self.side {
                    Side::Client => ToolResetKind::ClientMessageDeliveryFailure,
                    Side::Server => ToolResetKind::ServerMessageDeliveryFailure,
                };
                if let Some(tracker) = self
                    .streams
                    .get_mut(usize::from(stream.0))
                    .and_then(Option::as_mut)
                {
                    if tracker.in_flight == Some(message) {
                        tracker.in_flight = None;
                    }
                    tracker.tool.reset_state(now, kind, &reason);
                }
                1
            }
            SessionEvent::Terminated { ref reason } => {
                let kind = match reason {
                    TerminationReason::PeerTerminated(_) => ToolResetKind::SessionTerminated,
                    _ => ToolResetKind::SessionLost,
                };
                self.reset_all(now, kind, &reason.to_string());
                1
            }
            SessionEvent::Closed => {
                self.reset_all(now, ToolResetKind::SessionClosed, "session closed");
                1
            }
            _ => 0,
        }
    }

    fn service_stream(
        &mut self,
        now: Instant,
        session: &mut ConnectionSession,
        index: usize,
    ) -> u32 {
        let Some(tracker) = self.streams.get_mut(index).and_then(Option::as_mut) else {
            return 0;
        };
        if tracker.in_flight.is_some() {
            return tracker.tool.service(now);
        }
        let message = match tracker.parked.take() {
            Some(message) => Some(message),
            None => {
                let generated = tracker
                    .tool
                    .service_and_generate_next_message(now, session.pool_mut());
                if let Some(mut message) = generated {
                    if tracker.setup_pending {
                        message.or_flags(FrameFlags::MESSAGE_CONTAINS_STREAM_SETUP);
                    }
                    Some(message)
                } else {
                    None
                }
            }
        };
        let Some(message) = message else {
            return tracker.tool.service(now);
        };
        if !session.can_queue(message.buffer_count()) {
            // back-pressure: hold the message and retry next tick
            tracker.parked = Some(message);
            return 0;
        }
        match session.queue_message(now, message) {
            Ok(id) => {
                tracker.in_flight = Some(id);
                tracker.setup_pending = false;
                1
            }
            Err(err) => {
                warn!(%err, "failed to queue stream message");
                0
            }
        }
    }

    /// Delivers a reassembled message to its stream's tool, creating the
    /// tool first if this is a server-side stream setup. A message for an
    /// unknown stream without the setup flag is dropped and recorded as a
    /// protocol warning.
    fn dispatch_inbound(
        &mut self,
        now: Instant,
        session: &mut ConnectionSession,
        stream: StreamId,
        message: Message,
    ) {
        let index = usize::from(stream.0);
        let known = self
            .streams
            .get(index)
            .is_some_and(Option::is_some);
        if !known {
            let has_setup = message.buffers().first().is_some_and(|buf| {
                buf.header()
                    .flags
                    .contains(FrameFlags::MESSAGE_CONTAINS_STREAM_SETUP)
            });
            if self.side != Side::Server || !has_setup {
                warn!(%stream, has_setup, "dropping message for unknown stream");
                session.note_protocol_warning();
                session.recycle_message(now, message);
                return;
            }
            let Some(tracker) = self.tracker_from_setup(now, stream, &message) else {
                session.note_protocol_warning();
                session.recycle_message(now, message);
                return;
            };
            if self.streams.len() <= index {
                self.streams.resize_with(index + 1, || None);
            }
            self.streams[index] = Some(tracker);
            // the setup message's payload configured the tool; nothing more
            // to deliver
            session.recycle_message(now, message);
            return;
        }
        let Some(tracker) = self.streams.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        if let Some(done) = tracker.tool.handle_inbound_message(now, message) {
            session.recycle_message(now, done);
        }
    }

    fn tracker_from_setup(
        &self,
        now: Instant,
        stream: StreamId,
        message: &Message,
    ) -> Option<StreamTracker> {
        let params = serde_json::from_slice::<Value>(&message.to_vec()).ok()?;
        let type_str = params.get(TOOL_TYPE_KEY)?.as_str()?;
        let Some(kind) = ToolKind::from_type_str(type_str) else {
            warn!(%stream, type_str, "rejecting stream setup for unknown tool type");
            return None;
        };
        debug!(%stream, kind = kind.as_type_str(), "stream setup accepted");
        let ctx = ToolContext::new(stream, self.side, params);
        Some(StreamTracker::new(StreamTool::from_setup(now, kind, ctx), false))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::session::{SessionConfig, test_util::connected_client};

    fn now() -> Instant {
        Instant::now()
    }

    /// Moves every available frame from `from` into `to`.
    fn pump(from: &mut ConnectionSession, to: &mut ConnectionSession, at: Instant) -> usize {
        let mut count = 0;
        while let Some(frame) = from.poll_outbound(at) {
            to.recv_frame(at, &frame);
            count += 1;
        }
        count
    }

    fn mux_pair() -> (StreamMux, StreamMux) {
        (StreamMux::client(), StreamMux::server(json!({"Version": "1"})))
    }

    #[test]
    fn server_info_reaches_client() {
        let at = now();
        let mut client = connected_client(at, SessionConfig::default());
        let mut server = connected_client(at, SessionConfig::default());
        let (mut client_mux, mut server_mux) = mux_pair();

        server_mux.service(at, &mut server);
        pump(&mut server, &mut client, at);
        client_mux.service(at, &mut client);

        assert_eq!(Some(&json!({"Version": "1"})), client_mux.base().peer_info());
    }

    #[test]
    fn base_stream_round_trip() {
        let at = now();
        let mut client = connected_client(at, SessionConfig::default());
        let mut server = connected_client(at, SessionConfig::default());
        let (mut client_mux, mut server_mux) = mux_pair();

        client_mux.base_mut().queue_send(vec![0xAB; 40]);
        client_mux.service(at, &mut client);
        pump(&mut client, &mut server, at);
        server_mux.service(at, &mut server);

        let received = server_mux
            .base_mut()
            .take_received()
            .expect("payload should arrive");
        assert_eq!(vec![0xAB; 40], received.to_vec());
        server.recycle_message(at, received);

        // the ack flows back and the client's slot frees up
        server.service(at + SessionConfig::default().ack_coalesce_holdoff);
        pump(&mut server, &mut client, at);
        client_mux.service(at, &mut client);
        client_mux.base_mut().queue_send(vec![1]);
        assert!(client_mux.service(at, &mut client) >= 1);
    }

    #[test]
    fn stream_setup_creates_server_tool() {
        let at = now();
        let mut client = connected_client(at, SessionConfig::default());
        let mut server = connected_client(at, SessionConfig::default());
        let (mut client_mux, mut server_mux) = mux_pair();

        let stream = client_mux.open_stream(at, ToolKind::SetRelay, json!({"SetId": "alerts"}));
        assert_eq!(StreamId::new(1), stream);
        client_mux.service(at, &mut client);
        pump(&mut client, &mut server, at);
        server_mux.service(at, &mut server);

        let tool = server_mux.tool(stream).expect("stream should exist");
        assert_eq!(ToolKind::SetRelay, tool.kind());
        match tool {
            StreamTool::SetRelay(relay) => {
                assert_eq!(Some("alerts"), relay.config()["SetId"].as_str());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_tool_type_rejected() {
        let at = now();
        let mut client = connected_client(at, SessionConfig::default());
        let mut server = connected_client(at, SessionConfig::default());
        let (_client_mux, mut server_mux) = mux_pair();

        // hand-roll a setup payload naming a type the factory does not know
        let stream = StreamId::new(1);
        let mut message = crate::message::Message::new(stream);
        message
            .writer(client.pool_mut())
            .write(at, br#"{"ToolTypeStr":"Mystery"}"#)
            .unwrap();
        message.or_flags(FrameFlags::MESSAGE_CONTAINS_STREAM_SETUP);
        client.queue_message(at, message).unwrap();
        pump(&mut client, &mut server, at);
        server_mux.service(at, &mut server);

        assert!(server_mux.tool(stream).is_none());
        assert_eq!(1, server.stats().events.protocol_violations);
    }

    #[test]
    fn unknown_stream_without_setup_dropped() {
        let at = now();
        let mut client = connected_client(at, SessionConfig::default());
        let mut server = connected_client(at, SessionConfig::default());
        let (_, mut server_mux) = mux_pair();

        let stream = StreamId::new(5);
        let mut message = crate::message::Message::new(stream);
        message.writer(client.pool_mut()).write(at, &[1, 2]).unwrap();
        client.queue_message(at, message).unwrap();
        pump(&mut client, &mut server, at);
        server_mux.service(at, &mut server);

        assert!(server_mux.tool(stream).is_none());
        assert_eq!(1, server.stats().events.protocol_violations);
    }
}
