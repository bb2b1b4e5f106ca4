//! The contract between the session layer and a packet transport.
//!
//! The core never performs I/O itself: a [`Transport`] implementation owns
//! the socket, shared-memory segment, or in-process channel, and surfaces
//! everything to the service thread as non-blocking operations. Inbound
//! frames may be produced on a foreign thread; implementations queue them
//! internally and hand them over when [`Transport::poll`] is drained on the
//! service thread.

use bytes::Bytes;

/// Something a transport observed since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport finished connecting and can carry frames.
    Connected,
    /// A raw frame arrived from the peer.
    Frame(Bytes),
    /// The transport lost its connection.
    Disconnected {
        /// Why the connection was lost.
        reason: String,
    },
}

/// An abstract packet transport consumed by the session layer.
///
/// All methods are non-blocking; none may be called while holding session
/// state across a wait.
pub trait Transport {
    /// Error produced by transport operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Starts connecting. Completion is surfaced as
    /// [`TransportEvent::Connected`] from [`Transport::poll`].
    ///
    /// # Errors
    ///
    /// Errors if a connection attempt cannot even be started.
    fn connect(&mut self) -> Result<(), Self::Error>;

    /// Hands one frame to the transport for transmission.
    ///
    /// # Errors
    ///
    /// Errors if the transport is not connected or the peer is gone. Frame
    /// loss after a successful return is allowed; reliability lives in the
    /// session layer.
    fn send_frame(&mut self, frame: Bytes) -> Result<(), Self::Error>;

    /// Drains one queued event, or [`None`] when nothing is pending.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Tears the connection down, making a best-effort attempt to convey
    /// `reason` to the peer.
    fn disconnect(&mut self, reason: &str);
}
