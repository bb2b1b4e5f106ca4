//! The contract between a session's stream multiplexer and the tools that
//! own its streams.
//!
//! The tool set is closed: [`ToolKind`] names every type a stream-setup
//! payload may ask for, and [`StreamTool`] is the tagged variant the
//! multiplexer stores and dispatches on. Every variant composes a
//! [`ToolContext`] for the shared bookkeeping (stream id, side, setup
//! parameters) and implements [`StreamToolCore`].
//!
//! Stream 0 always carries the [`BaseTool`], which pushes the server-info
//! name/value set to the client when a session connects and otherwise relays
//! opaque application messages. The relay tools satisfy the same contract;
//! their domain semantics live above this layer.

use std::{collections::VecDeque, fmt};

use serde_json::Value;
use tracing::{debug, warn};
use web_time::Instant;

use crate::{
    buffer::BufferPool,
    message::Message,
    session::Side,
    ty::{FrameFlags, StreamId},
};

/// Key in a stream-setup payload naming the tool type for the new stream.
pub const TOOL_TYPE_KEY: &str = "ToolTypeStr";

/// Key under which the base tool publishes the server's info set.
pub const SERVER_INFO_KEY: &str = "ServerInfo";

/// Observer notified the first time a session's server-info exchange
/// completes.
///
/// Installed on the client's [`BaseTool`] with
/// [`BaseTool::set_info_observer`]; any `FnMut(&Value)` closure qualifies.
/// The observer survives tool resets, and fires once per session: a reset
/// clears the stored info, so a re-opened or resumed-elsewhere session
/// notifies again on its own first exchange.
pub trait ServerInfoObserver {
    /// Called with the peer's info set.
    fn server_info_received(&mut self, info: &Value);
}

impl<F: FnMut(&Value)> ServerInfoObserver for F {
    fn server_info_received(&mut self, info: &Value) {
        self(info);
    }
}

/// Why a tool is being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolResetKind {
    /// The tool was just constructed.
    Construction,
    /// A message this client-side tool sent will never be delivered.
    ClientMessageDeliveryFailure,
    /// A message this server-side tool sent will never be delivered.
    ServerMessageDeliveryFailure,
    /// The session's transport was lost unexpectedly.
    SessionLost,
    /// The session closed gracefully.
    SessionClosed,
    /// The session terminated.
    SessionTerminated,
    /// The client host released the tool.
    ClientRelease,
}

/// The closed set of stream tool types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Server-info push plus opaque message relay; always present on
    /// stream 0.
    Base,
    /// Remote action relay.
    ActionRelay,
    /// Observable-set replication.
    SetRelay,
    /// Value-interconnect mirroring.
    IviRelay,
}

impl ToolKind {
    /// Looks up a kind by its stream-setup name.
    #[must_use]
    pub fn from_type_str(s: &str) -> Option<Self> {
        match s {
            "Base" => Some(Self::Base),
            "ActionRelay" => Some(Self::ActionRelay),
            "SetRelay" => Some(Self::SetRelay),
            "IVIRelay" => Some(Self::IviRelay),
            _ => None,
        }
    }

    /// The stream-setup name of this kind.
    #[must_use]
    pub const fn as_type_str(self) -> &'static str {
        match self {
            Self::Base => "Base",
            Self::ActionRelay => "ActionRelay",
            Self::SetRelay => "SetRelay",
            Self::IviRelay => "IVIRelay",
        }
    }
}

/// What every stream tool must provide to the multiplexer.
///
/// Tools must tolerate any of these being called in any state; the only
/// guarantee is that calls arrive one at a time from a single scheduler.
pub trait StreamToolCore {
    /// Makes the tool ready for a fresh session. Invoked on construction,
    /// delivery failure, session loss, close, termination and release.
    fn reset_state(&mut self, now: Instant, kind: ToolResetKind, reason: &str);

    /// Called for every fully reassembled message addressed to this tool's
    /// stream. Return the message to have its buffers recycled, or [`None`]
    /// to retain it.
    fn handle_inbound_message(&mut self, now: Instant, message: Message) -> Option<Message>;

    /// Gives the tool a chance to produce its next outbound message.
    fn service_and_generate_next_message(
        &mut self,
        now: Instant,
        pool: &mut BufferPool,
    ) -> Option<Message>;

    /// Housekeeping; returns a work count for adaptive sleeping.
    fn service(&mut self, now: Instant) -> u32;
}

/// Bookkeeping shared by every tool variant.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The stream this tool owns.
    pub stream: StreamId,
    /// Which endpoint this tool lives on.
    pub side: Side,
    /// Tool-specific parameters from the stream-setup payload.
    pub config: Value,
}

impl ToolContext {
    /// Creates a context for a tool owning `stream`.
    #[must_use]
    pub const fn new(stream: StreamId, side: Side, config: Value) -> Self {
        Self {
            stream,
            side,
            config,
        }
    }
}

/// Shared relay mechanics: an outbox of opaque payloads to send and an inbox
/// of retained inbound messages for the host to drain.
#[derive(Debug)]
struct RelayCore {
    ctx: ToolContext,
    outbox: VecDeque<(Vec<u8>, FrameFlags)>,
    inbox: VecDeque<Message>,
}

impl RelayCore {
    fn new(ctx: ToolContext) -> Self {
        Self {
            ctx,
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.outbox.clear();
        self.inbox.clear();
    }

    fn queue_send(&mut self, payload: Vec<u8>, flags: FrameFlags) {
        self.outbox.push_back((payload, flags));
    }

    fn next_message(&mut self, now: Instant, pool: &mut BufferPool) -> Option<Message> {
        let (payload, flags) = self.outbox.pop_front()?;
        let mut message = Message::new(self.ctx.stream);
        if message.writer(pool).write(now, &payload).is_err() {
            warn!(stream = %self.ctx.stream, "pool exhausted; dropping outbound payload");
            return None;
        }
        message.or_flags(flags);
        Some(message)
    }
}

/// The tool on stream 0: pushes the server-info set on connect, and relays
/// opaque application messages in both directions.
pub struct BaseTool {
    core: RelayCore,
    server_info: Value,
    peer_info: Option<Value>,
    info_sent: bool,
    info_observer: Option<Box<dyn ServerInfoObserver>>,
}

impl fmt::Debug for BaseTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseTool")
            .field("core", &self.core)
            .field("server_info", &self.server_info)
            .field("peer_info", &self.peer_info)
            .field("info_sent", &self.info_sent)
            .field("has_info_observer", &self.info_observer.is_some())
            .finish()
    }
}

impl BaseTool {
    /// Creates the client-side base tool.
    #[must_use]
    pub fn client() -> Self {
        Self {
            core: RelayCore::new(ToolContext::new(StreamId::BASE, Side::Client, Value::Null)),
            server_info: Value::Null,
            peer_info: None,
            info_sent: false,
            info_observer: None,
        }
    }

    /// Creates the server-side base tool, advertising `server_info` to every
    /// session that connects.
    #[must_use]
    pub fn server(server_info: Value) -> Self {
        Self {
            core: RelayCore::new(ToolContext::new(StreamId::BASE, Side::Server, Value::Null)),
            server_info,
            peer_info: None,
            info_sent: false,
            info_observer: None,
        }
    }

    /// Installs the observer fired on the first successful server-info
    /// exchange of each session. Replaces any previously installed one.
    pub fn set_info_observer(&mut self, observer: impl ServerInfoObserver + 'static) {
        self.info_observer = Some(Box::new(observer));
    }

    /// The info set received from the peer, once the exchange has happened.
    #[must_use]
    pub const fn peer_info(&self) -> Option<&Value> {
        self.peer_info.as_ref()
    }

    /// Queues an opaque payload for transmission on the base stream.
    pub fn queue_send(&mut self, payload: Vec<u8>) {
        self.core.queue_send(payload, FrameFlags::empty());
    }

    /// Drains one retained inbound message. The host should hand it back to
    /// the session for recycling when done.
    pub fn take_received(&mut self) -> Option<Message> {
        self.core.inbox.pop_front()
    }
}

impl StreamToolCore for BaseTool {
    fn reset_state(&mut self, _now: Instant, kind: ToolResetKind, reason: &str) {
        debug!(?kind, reason, "base tool reset");
        self.core.reset();
        self.peer_info = None;
        self.info_sent = false;
    }

    fn handle_inbound_message(&mut self, _now: Instant, message: Message) -> Option<Message> {
        let is_nvs = message
            .buffers()
            .first()
            .is_some_and(|buf| {
                buf.header()
                    .flags
                    .contains(FrameFlags::MESSAGE_CONTAINS_JSON_NVS)
            });
        if is_nvs {
            if let Ok(nvs) = serde_json::from_slice::<Value>(&message.to_vec()) {
                if let Some(info) = nvs.get(SERVER_INFO_KEY) {
                    if self.peer_info.is_none() {
                        if let Some(observer) = &mut self.info_observer {
                            observer.server_info_received(info);
                        }
                    }
                    self.peer_info = Some(info.clone());
                    return Some(message);
                }
            }
        }
        self.core.inbox.push_back(message);
        None
    }

    fn service_and_generate_next_message(
        &mut self,
        now: Instant,
        pool: &mut BufferPool,
    ) -> Option<Message> {
        if self.core.ctx.side == Side::Server && !self.info_sent {
            let nvs = serde_json::json!({ SERVER_INFO_KEY: self.server_info });
            let payload = serde_json::to_vec(&nvs).ok()?;
            let mut message = Message::new(StreamId::BASE);
            if message.writer(pool).write(now, &payload).is_err() {
                return None;
            }
            message.or_flags(FrameFlags::MESSAGE_CONTAINS_JSON_NVS);
            self.info_sent = true;
            return Some(message);
        }
        self.core.next_message(now, pool)
    }

    fn service(&mut self, _now: Instant) -> u32 {
        u32::try_from(self.core.outbox.len()).unwrap_or(u32::MAX)
    }
}

macro_rules! relay_tool {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            core: RelayCore,
        }

        impl $name {
            /// Creates the tool from its stream-setup context.
            #[must_use]
            pub fn new(ctx: ToolContext) -> Self {
                Self {
                    core: RelayCore::new(ctx),
                }
            }

            /// Tool-specific parameters from the stream-setup payload.
            #[must_use]
            pub const fn config(&self) -> &Value {
                &self.core.ctx.config
            }

            /// Queues an opaque payload for transmission on this stream.
            pub fn queue_send(&mut self, payload: Vec<u8>) {
                self.core.queue_send(payload, FrameFlags::empty());
            }

            /// Drains one retained inbound message.
            pub fn take_received(&mut self) -> Option<Message> {
                self.core.inbox.pop_front()
            }
        }

        impl StreamToolCore for $name {
            fn reset_state(&mut self, _now: Instant, kind: ToolResetKind, reason: &str) {
                debug!(tool = stringify!($name), ?kind, reason, "tool reset");
                self.core.reset();
            }

            fn handle_inbound_message(
                &mut self,
                _now: Instant,
                message: Message,
            ) -> Option<Message> {
                self.core.inbox.push_back(message);
                None
            }

            fn service_and_generate_next_message(
                &mut self,
                now: Instant,
                pool: &mut BufferPool,
            ) -> Option<Message> {
                self.core.next_message(now, pool)
            }

            fn service(&mut self, _now: Instant) -> u32 {
                u32::try_from(self.core.outbox.len()).unwrap_or(u32::MAX)
            }
        }
    };
}

relay_tool! {
    /// Relays remote action requests and their progress/results as opaque
    /// payloads.
    ActionRelayTool
}

relay_tool! {
    /// Relays observable-set deltas as opaque payloads.
    SetRelayTool
}

relay_tool! {
    /// Relays value-interconnect updates as opaque payloads.
    IviRelayTool
}

/// A stream tool of any kind. The multiplexer stores these and dispatches by
/// matching; the set is closed on purpose.
#[derive(Debug)]
pub enum StreamTool {
    /// See [`BaseTool`].
    Base(BaseTool),
    /// See [`ActionRelayTool`].
    ActionRelay(ActionRelayTool),
    /// See [`SetRelayTool`].
    SetRelay(SetRelayTool),
    /// See [`IviRelayTool`].
    IviRelay(IviRelayTool),
}

impl StreamTool {
    /// Which kind this tool is.
    #[must_use]
    pub const fn kind(&self) -> ToolKind {
        match self {
            Self::Base(_) => ToolKind::Base,
            Self::ActionRelay(_) => ToolKind::ActionRelay,
            Self::SetRelay(_) => ToolKind::SetRelay,
            Self::IviRelay(_) => ToolKind::IviRelay,
        }
    }

    /// The factory behind the stream-setup pathway: builds the tool a setup
    /// payload asked for.
    #[must_use]
    pub fn from_setup(now: Instant, kind: ToolKind, ctx: ToolContext) -> Self {
        let mut tool = match kind {
            ToolKind::Base => {
                if ctx.side == Side::Server {
                    Self::Base(BaseTool::server(Value::Null))
                } else {
                    Self::Base(BaseTool::client())
                }
            }
            ToolKind::ActionRelay => Self::ActionRelay(ActionRelayTool::new(ctx)),
            ToolKind::SetRelay => Self::SetRelay(SetRelayTool::new(ctx)),
            ToolKind::IviRelay => Self::IviRelay(IviRelayTool::new(ctx)),
        };
        tool.reset_state(now, ToolResetKind::Construction, "constructed");
        tool
    }

    /// The base tool, if this is one.
    #[must_use]
    pub const fn as_base(&self) -> Option<&BaseTool> {
        match self {
            Self::Base(tool) => Some(tool),
            _ => None,
        }
    }

    /// The base tool, mutably, if this is one.
    pub const fn as_base_mut(&mut self) -> Option<&mut BaseTool> {
        match self {
            Self::Base(tool) => Some(tool),
            _ => None,
        }
    }
}

impl StreamToolCore for StreamTool {
    fn reset_state(&mut self, now: Instant, kind: ToolResetKind, reason: &str) {
        match self {
            Self::Base(tool) => tool.reset_state(now, kind, reason),
            Self::ActionRelay(tool) => tool.reset_state(now, kind, reason),
            Self::SetRelay(tool) => tool.reset_state(now, kind, reason),
            Self::IviRelay(tool) => tool.reset_state(now, kind, reason),
        }
    }

    fn handle_inbound_message(&mut self, now: Instant, message: Message) -> Option<Message> {
        match self {
            Self::Base(tool) => tool.handle_inbound_message(now, message),
            Self::ActionRelay(tool) => tool.handle_inbound_message(now, message),
            Self::SetRelay(tool) => tool.handle_inbound_message(now, message),
            Self::IviRelay(tool) => tool.handle_inbound_message(now, message),
        }
    }

    fn service_and_generate_next_message(
        &mut self,
        now: Instant,
        pool: &mut BufferPool,
    ) -> Option<Message> {
        match self {
            Self::Base(tool) => tool.service_and_generate_next_message(now, pool),
            Self::ActionRelay(tool) => tool.service_and_generate_next_message(now, pool),
            Self::SetRelay(tool) => tool.service_and_generate_next_message(now, pool),
            Self::IviRelay(tool) => tool.service_and_generate_next_message(now, pool),
        }
    }

    fn service(&mut self, now: Instant) -> u32 {
        match self {
            Self::Base(tool) => tool.service(now),
            Self::ActionRelay(tool) => tool.service(now),
            Self::SetRelay(tool) => tool.service(now),
            Self::IviRelay(tool) => tool.service(now),
        }
    }
}
