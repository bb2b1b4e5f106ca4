//! End-to-end scenarios driving a client session and a server manager
//! against each other, with direct frame injection where loss or reordering
//! needs to be staged, and the channel transport for the fully wired case.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use bytes::Bytes;
use serde_json::{Value, json};
use tether_channel::ChannelTransport;
use tether_proto::{
    manager::{ConnId, SessionManager},
    mgmt::{Management, ManagementType},
    mux::StreamMux,
    service::ServiceGate,
    session::{ConnState, ConnectionSession, SessionConfig, SessionStateCode, TerminationReason},
    transport::{Transport, TransportEvent},
    ty::{FrameFlags, FrameHeader, Purpose},
};
use web_time::{Duration, Instant};

struct Link {
    client: ConnectionSession,
    cmux: StreamMux,
    manager: SessionManager,
    conn: ConnId,
    c2s: VecDeque<Bytes>,
    s2c: VecDeque<Bytes>,
}

impl Link {
    fn new(client_config: SessionConfig, server_config: SessionConfig) -> Self {
        let at = Instant::now();
        Self {
            client: ConnectionSession::client(at, "scenario", client_config),
            cmux: StreamMux::client(),
            manager: SessionManager::new(server_config, json!({"Build": "test"})),
            conn: 1,
            c2s: VecDeque::new(),
            s2c: VecDeque::new(),
        }
    }

    /// Runs both sides' service loops and collects their outbound frames
    /// without delivering anything.
    fn collect(&mut self, at: Instant) {
        self.cmux.service(at, &mut self.client);
        self.client.service(at);
        while let Some(frame) = self.client.poll_outbound(at) {
            self.c2s.push_back(frame);
        }
        self.manager.service(at);
        while let Some((_, frame)) = self.manager.poll_outbound() {
            self.s2c.push_back(frame);
        }
    }

    fn deliver_c2s(&mut self, at: Instant) {
        while let Some(frame) = self.c2s.pop_front() {
            self.manager.handle_frame(at, self.conn, &frame);
        }
    }

    fn deliver_s2c(&mut self, at: Instant) {
        while let Some(frame) = self.s2c.pop_front() {
            self.client.recv_frame(at, &frame);
        }
    }

    /// Collects and delivers in both directions until nothing moves.
    fn settle(&mut self, at: Instant) {
        for _ in 0..10 {
            self.collect(at);
            if self.c2s.is_empty() && self.s2c.is_empty() {
                break;
            }
            self.deliver_c2s(at);
            self.deliver_s2c(at);
        }
    }

    fn connect(at: Instant, client_config: SessionConfig, server_config: SessionConfig) -> Self {
        let mut link = Self::new(client_config, server_config);
        link.client.go_online(at);
        link.client.transport_connected(at);
        link.settle(at);
        assert_eq!(SessionStateCode::Active, link.client.state());
        link
    }

    fn server_received(&mut self) -> Option<Vec<u8>> {
        let uuid = self.client.session_uuid();
        let mux = self.manager.mux_mut(uuid)?;
        let message = mux.base_mut().take_received()?;
        let bytes = message.to_vec();
        if let Some(session) = self.manager.session_mut(uuid) {
            session.recycle_message(Instant::now(), message);
        }
        Some(bytes)
    }
}

fn header_of(frame: &Bytes) -> FrameHeader {
    FrameHeader::decode(&mut &frame[..]).expect("frame should carry a valid header")
}

fn take_data_frames(queue: &mut VecDeque<Bytes>) -> Vec<Bytes> {
    let mut data = Vec::new();
    queue.retain(|frame| {
        if header_of(frame).purpose.is_data() {
            data.push(frame.clone());
            false
        } else {
            true
        }
    });
    data
}

#[test]
fn s1_tiny_message_single_frame() {
    let at = Instant::now();
    let mut link = Link::new(SessionConfig::default(), SessionConfig::default());
    link.client.go_online(at);
    link.client.transport_connected(at);
    link.collect(at);
    link.deliver_c2s(at);
    link.collect(at);

    // take the acceptance, but hold the server's info push back so the
    // client's first data frame goes out before it has anything to ack
    let accept = link.s2c.pop_front().expect("acceptance should be queued");
    assert_eq!(Purpose::Management, header_of(&accept).purpose);
    link.client.recv_frame(at, &accept);
    assert_eq!(SessionStateCode::Active, link.client.state());

    let payload: Vec<u8> = (0x00..0x0A).collect();
    link.cmux.base_mut().queue_send(payload.clone());
    link.cmux.service(at, &mut link.client);
    while let Some(frame) = link.client.poll_outbound(at) {
        link.c2s.push_back(frame);
    }

    let data = take_data_frames(&mut link.c2s);
    assert_eq!(1, data.len());
    let frame = &data[0];
    let header = header_of(frame);
    assert_eq!(0xDE47_EA16, header.purpose.magic());
    assert_eq!(1, header.seq_num.0);
    assert_eq!(0, header.ack_seq_num.0);
    assert_eq!(0, header.message_stream.0);
    assert_eq!(26, header.length);
    assert_eq!(&payload, &frame[FrameHeader::LEN..]);

    for frame in data {
        link.manager.handle_frame(at, link.conn, &frame);
    }
    link.collect(at);
    assert_eq!(Some(payload), link.server_received());
    assert_eq!(None, link.server_received());
}

#[test]
fn s2_three_buffer_message() {
    let at = Instant::now();
    let mut link = Link::connect(at, SessionConfig::default(), SessionConfig::default());

    let payload = vec![0xA5; 2500];
    link.cmux.base_mut().queue_send(payload.clone());
    link.collect(at);

    let data = take_data_frames(&mut link.c2s);
    assert_eq!(3, data.len());
    let magics: Vec<u32> = data.iter().map(|f| header_of(f).purpose.magic()).collect();
    assert_eq!(vec![0xDE47_EA13, 0xDE47_EA14, 0xDE47_EA15], magics);
    let seqs: Vec<u64> = data.iter().map(|f| header_of(f).seq_num.0).collect();
    assert_eq!(vec![1, 2, 3], seqs);

    for frame in data {
        link.manager.handle_frame(at, link.conn, &frame);
    }
    link.collect(at);
    assert_eq!(Some(payload), link.server_received());
    assert_eq!(None, link.server_received());
}

#[test]
fn s3_reordered_delivery() {
    let at = Instant::now();
    let mut link = Link::connect(at, SessionConfig::default(), SessionConfig::default());

    let payload = vec![0xA5; 2500];
    link.cmux.base_mut().queue_send(payload.clone());
    link.collect(at);
    let data = take_data_frames(&mut link.c2s);
    assert_eq!(3, data.len());

    // deliver 2, 1, 3
    link.manager.handle_frame(at, link.conn, &data[1]);
    link.collect(at);
    assert_eq!(None, link.server_received());

    link.manager.handle_frame(at, link.conn, &data[0]);
    link.manager.handle_frame(at, link.conn, &data[2]);
    link.collect(at);
    assert_eq!(Some(payload), link.server_received());
    assert_eq!(None, link.server_received());

    let uuid = link.client.session_uuid();
    let stats = link
        .manager
        .session_mut(uuid)
        .expect("session should exist")
        .stats();
    assert_eq!(1, stats.events.out_of_order_recv);
}

#[test]
fn s4_lost_frame_retransmitted() {
    let at = Instant::now();
    let config = SessionConfig::default();
    let holdoff = config.retransmit_holdoff;
    let mut link = Link::connect(at, config, SessionConfig::default());

    let payload = vec![0xA5; 2500];
    link.cmux.base_mut().queue_send(payload.clone());
    link.collect(at);
    let data = take_data_frames(&mut link.c2s);
    assert_eq!(3, data.len());

    // frame 2 is lost in transit
    link.manager.handle_frame(at, link.conn, &data[0]);
    link.manager.handle_frame(at, link.conn, &data[2]);
    link.collect(at);
    assert_eq!(None, link.server_received());

    // past the holdoff, the client retransmits what the server has not acked
    let later = at + holdoff + Duration::from_millis(1);
    link.collect(later);
    link.deliver_s2c(later);
    link.collect(later);
    let resent = take_data_frames(&mut link.c2s);
    assert!(!resent.is_empty());
    for frame in &resent {
        assert!(
            header_of(frame)
                .flags
                .contains(FrameFlags::BUFFER_IS_BEING_RESENT)
        );
    }
    assert!(resent.iter().any(|frame| header_of(frame).seq_num.0 == 2));

    for frame in resent {
        link.manager.handle_frame(later, link.conn, &frame);
    }
    link.collect(later);
    assert_eq!(Some(payload), link.server_received());
    assert_eq!(None, link.server_received());
}

#[test]
fn s5_resume_replays_unacked_frames() {
    let at = Instant::now();
    let client_config = SessionConfig {
        auto_reconnect_holdoff: Some(Duration::from_millis(10)),
        ..SessionConfig::default()
    };
    let mut link = Link::connect(at, client_config, SessionConfig::default());

    let payload: Vec<u8> = (0..=255u8).cycle().take(4500).collect();
    link.cmux.base_mut().queue_send(payload.clone());
    link.collect(at);
    let data = take_data_frames(&mut link.c2s);
    assert_eq!(5, data.len());

    // only the first three frames arrive before the transport dies
    for frame in &data[..3] {
        link.manager.handle_frame(at, link.conn, frame);
    }
    let acked = at + Duration::from_millis(25);
    link.collect(acked);
    link.deliver_s2c(acked);
    assert_eq!(vec![4, 5], link.client.held_seq_nums());

    link.client.transport_disconnected(acked, "link down");
    link.manager.transport_disconnected(acked, link.conn, "link down");
    assert_eq!(SessionStateCode::RequestTransportConnect, link.client.state());
    assert!(link.client.auto_reconnect_at().is_some());

    // reconnect on a fresh connection and resume
    let resumed = acked + Duration::from_millis(20);
    link.conn = 2;
    link.client.transport_connected(resumed);
    link.collect(resumed);
    let resume_frame = link.c2s.pop_front().expect("resume request should be queued");
    let resume = Management::decode(&resume_frame[FrameHeader::LEN..]).unwrap();
    assert_eq!(ManagementType::RequestResumeSession, resume.ty);
    link.manager.handle_frame(resumed, link.conn, &resume_frame);
    link.collect(resumed);

    // the acceptance reports the server's highest contiguous sequence: 3
    let accept = link.s2c.pop_front().expect("acceptance should be queued");
    let accept_mgmt = Management::decode(&accept[FrameHeader::LEN..]).unwrap();
    assert_eq!(ManagementType::SessionRequestAccepted, accept_mgmt.ty);
    assert_eq!(Some(3), accept_mgmt.last_recv_seq);
    link.client.recv_frame(resumed, &accept);
    assert_eq!(SessionStateCode::Active, link.client.state());

    link.collect(resumed);
    let replayed = take_data_frames(&mut link.c2s);
    assert_eq!(2, replayed.len());
    for frame in &replayed {
        let header = header_of(frame);
        assert!(header.flags.contains(FrameFlags::BUFFER_IS_BEING_RESENT));
        assert!(header.seq_num.0 == 4 || header.seq_num.0 == 5);
    }

    for frame in replayed {
        link.manager.handle_frame(resumed, link.conn, &frame);
    }
    link.collect(resumed);
    assert_eq!(Some(payload), link.server_received());
    assert_eq!(None, link.server_received());
}

#[test]
fn s6_buffer_size_mismatch_fails_without_reconnect() {
    let at = Instant::now();
    let client_config = SessionConfig {
        auto_reconnect_holdoff: Some(Duration::from_millis(10)),
        ..SessionConfig::default()
    };
    let server_config = SessionConfig {
        buffer_size: 2048,
        ..SessionConfig::default()
    };
    let mut link = Link::new(client_config, server_config);
    link.client.go_online(at);
    link.client.transport_connected(at);
    link.settle(at);

    assert_eq!(SessionStateCode::Terminated, link.client.state());
    assert_eq!(
        Some(&TerminationReason::BufferSizesDoNotMatch),
        link.client.termination()
    );
    assert_eq!(ConnState::ConnectionFailed, link.client.conn_state(at));
    // auto-reconnect is configured but must not fire
    assert_eq!(None, link.client.auto_reconnect_at());
    assert_eq!(0, link.manager.session_count());
}

/// The fully wired case: client and manager talking through real channel
/// transports, driven the way a host's service loop would.
#[test]
fn wired_round_trip_over_channel_transport() {
    let at = Instant::now();
    let (mut client_tp, mut server_tp) = ChannelTransport::open();
    client_tp.connect().expect("fresh transport should connect");
    server_tp.connect().expect("fresh transport should connect");

    let mut client = ConnectionSession::client(at, "wired", SessionConfig::default());
    let mut cmux = StreamMux::client();
    let mut manager = SessionManager::new(SessionConfig::default(), json!({"Build": "wired"}));
    let mut gate = ServiceGate::new();

    let observed_info = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&observed_info);
    cmux.base_mut()
        .set_info_observer(move |info: &Value| *sink.borrow_mut() = Some(info.clone()));

    client.go_online(at);
    cmux.base_mut().queue_send(vec![0xC3; 1500]);

    let mut server_payload = None;
    for _ in 0..50 {
        let mut work = 0;
        while let Some(event) = client_tp.poll() {
            work += 1;
            match event {
                TransportEvent::Connected => client.transport_connected(at),
                TransportEvent::Frame(frame) => client.recv_frame(at, &frame),
                TransportEvent::Disconnected { reason } => {
                    client.transport_disconnected(at, &reason);
                }
            }
        }
        work += cmux.service(at, &mut client);
        work += client.service(at);
        while let Some(frame) = client.poll_outbound(at) {
            if client_tp.send_frame(frame).is_err() {
                client.note_transport_error();
            }
            work += 1;
        }

        while let Some(event) = server_tp.poll() {
            work += 1;
            match event {
                TransportEvent::Frame(frame) => manager.handle_frame(at, 1, &frame),
                TransportEvent::Disconnected { reason } => {
                    manager.transport_disconnected(at, 1, &reason);
                }
                TransportEvent::Connected => {}
            }
        }
        work += manager.service(at);
        while let Some((_, frame)) = manager.poll_outbound() {
            server_tp.send_frame(frame).expect("transport should be up");
            work += 1;
        }

        gate.note_work(work);
        let _limit = gate.next_wait(Duration::from_millis(100));

        if server_payload.is_none() {
            let uuid = client.session_uuid();
            server_payload = manager
                .mux_mut(uuid)
                .and_then(|mux| mux.base_mut().take_received())
                .map(|message| message.to_vec());
        }
        if server_payload.is_some() && cmux.base().peer_info().is_some() {
            break;
        }
    }

    assert_eq!(SessionStateCode::Active, client.state());
    assert_eq!(Some(vec![0xC3; 1500]), server_payload);
    assert_eq!(Some(&json!({"Build": "wired"})), cmux.base().peer_info());
    // the installed observer was notified on the first exchange
    assert_eq!(Some(json!({"Build": "wired"})), *observed_info.borrow());
}
