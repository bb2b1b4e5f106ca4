//! In-memory packet transport for tether, built on MPSC channels.
//!
//! [`ChannelTransport::open`] returns two linked endpoints; frames sent on
//! one come out of the other's [`poll`](tether_proto::transport::Transport::poll).
//! Useful for tests and for wiring a client and server living in the same
//! process. Frames are never lost or reordered by this transport; loss and
//! reordering tests inject at the session layer instead.
//!
//! The channels are thread-safe, so one endpoint may live on another thread;
//! each endpoint itself must stay on its owner's service thread.

use bytes::Bytes;
use tether_proto::transport::{Transport, TransportEvent};
use tracing::trace;

/// The peer endpoint is gone or the transport was never connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel transport disconnected")]
pub struct ChannelDisconnected;

/// One endpoint of an in-memory transport pair.
#[derive(Debug)]
pub struct ChannelTransport {
    send_frame: flume::Sender<Bytes>,
    recv_frame: flume::Receiver<Bytes>,
    send_dc: flume::Sender<String>,
    recv_dc: flume::Receiver<String>,
    connect_pending: bool,
    connected: bool,
    closed: bool,
}

impl ChannelTransport {
    /// Creates a linked pair of endpoints.
    #[must_use]
    pub fn open() -> (Self, Self) {
        let (send_a, recv_a) = flume::unbounded::<Bytes>();
        let (send_b, recv_b) = flume::unbounded::<Bytes>();
        let (send_dc_a, recv_dc_a) = flume::bounded::<String>(1);
        let (send_dc_b, recv_dc_b) = flume::bounded::<String>(1);
        (
            Self::new(send_a, recv_b, send_dc_a, recv_dc_b),
            Self::new(send_b, recv_a, send_dc_b, recv_dc_a),
        )
    }

    fn new(
        send_frame: flume::Sender<Bytes>,
        recv_frame: flume::Receiver<Bytes>,
        send_dc: flume::Sender<String>,
        recv_dc: flume::Receiver<String>,
    ) -> Self {
        Self {
            send_frame,
            recv_frame,
            send_dc,
            recv_dc,
            connect_pending: false,
            connected: false,
            closed: false,
        }
    }

    /// Whether this endpoint has connected and not yet disconnected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected && !self.closed
    }
}

impl Transport for ChannelTransport {
    type Error = ChannelDisconnected;

    fn connect(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Err(ChannelDisconnected);
        }
        // in-memory: connecting always completes by the next poll
        self.connect_pending = true;
        Ok(())
    }

    fn send_frame(&mut self, frame: Bytes) -> Result<(), Self::Error> {
        if self.closed || !self.connected {
            return Err(ChannelDisconnected);
        }
        trace!(len = frame.len(), "channel frame out");
        self.send_frame.send(frame).map_err(|_| ChannelDisconnected)
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if self.connect_pending {
            self.connect_pending = false;
            self.connected = true;
            return Some(TransportEvent::Connected);
        }
        // frames queued before a disconnect are still delivered first
        match self.recv_frame.try_recv() {
            Ok(frame) => return Some(TransportEvent::Frame(frame)),
            Err(flume::TryRecvError::Empty | flume::TryRecvError::Disconnected) => {}
        }
        if self.closed || !self.connected {
            return None;
        }
        if let Ok(reason) = self.recv_dc.try_recv() {
            self.closed = true;
            return Some(TransportEvent::Disconnected { reason });
        }
        if self.recv_frame.is_disconnected() {
            self.closed = true;
            return Some(TransportEvent::Disconnected {
                reason: "peer endpoint dropped".to_owned(),
            });
        }
        None
    }

    fn disconnect(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.send_dc.try_send(reason.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn connected_pair() -> (ChannelTransport, ChannelTransport) {
        let (mut a, mut b) = ChannelTransport::open();
        a.connect().unwrap();
        b.connect().unwrap();
        assert_matches!(a.poll(), Some(TransportEvent::Connected));
        assert_matches!(b.poll(), Some(TransportEvent::Connected));
        (a, b)
    }

    #[test]
    fn frames_cross_in_order() {
        let (mut a, mut b) = connected_pair();
        a.send_frame(Bytes::from_static(&[1])).unwrap();
        a.send_frame(Bytes::from_static(&[2])).unwrap();
        assert_matches!(b.poll(), Some(TransportEvent::Frame(frame)) if frame[..] == [1]);
        assert_matches!(b.poll(), Some(TransportEvent::Frame(frame)) if frame[..] == [2]);
        assert_matches!(b.poll(), None);
    }

    #[test]
    fn send_before_connect_fails() {
        let (mut a, _b) = ChannelTransport::open();
        assert_matches!(
            a.send_frame(Bytes::from_static(&[1])),
            Err(ChannelDisconnected)
        );
    }

    #[test]
    fn disconnect_reaches_peer_after_frames() {
        let (mut a, mut b) = connected_pair();
        a.send_frame(Bytes::from_static(&[9])).unwrap();
        a.disconnect("going away");
        assert_matches!(b.poll(), Some(TransportEvent::Frame(_)));
        assert_matches!(
            b.poll(),
            Some(TransportEvent::Disconnected { reason }) if reason == "going away"
        );
        assert_matches!(b.poll(), None);
    }

    #[test]
    fn dropped_peer_surfaces_disconnect() {
        let (mut a, b) = connected_pair();
        drop(b);
        assert_matches!(a.poll(), Some(TransportEvent::Disconnected { .. }));
        assert_matches!(a.poll(), None);
    }
}
