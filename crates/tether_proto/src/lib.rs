//! Sans-IO core of the tether messaging layer: reliable, session-oriented,
//! multi-stream messaging over an arbitrary packet transport.
//!
//! A client endpoint establishes a session with a server endpoint; over that
//! session both sides multiplex independent logical streams, each owned by a
//! stream tool. Application messages may be larger than the transport frame
//! size: the session fragments them into fixed-size buffers, numbers them,
//! acknowledges them cumulatively, retransmits lost ones, and reassembles
//! them in order per stream.
//!
//! The crate performs no I/O. Frames are [`bytes::Bytes`] going in and out
//! of a [`session::ConnectionSession`]; a [`transport::Transport`]
//! implementation (such as `tether_channel`) moves them, and the host's
//! service loop drives everything from a single thread using
//! [`service::ServiceGate`] for its adaptive wait.
//!
//! Start with [`ty`] for the wire format, then [`session`] for the behavior.

pub mod buffer;
pub mod header;
pub mod manager;
pub mod message;
pub mod mgmt;
pub mod mux;
pub mod service;
pub mod session;
pub mod stats;
pub mod tool;
pub mod transport;
pub mod ty;

pub use bytes;
