//! Receive thread driven over a raw router channel and a UDP sender.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use frame_receiver::decoder::{DummyConfig, DummyDecoder, PacketizedConfig, PacketizedDecoder};
use frame_receiver::frame_ipc::{ChannelType, IpcChannel, IpcMessage, MsgType, MsgVal};
use frame_receiver::frame_pool::SharedBufferPool;
use frame_receiver::{
    DecoderConfig, ReceiverConfig, ReceiverError, RxState, RxThread, RxThreadHandle,
};
use serde_json::json;
use std::io;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

mod common;
use common::ScriptedSource;

const IDENTITY: &str = "rx-test";
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    router: IpcChannel,
    handle: Option<RxThreadHandle>,
    pool: SharedBufferPool,
    sender: UdpSocket,
    next_count: u64,
}

impl Harness {
    /// Start a thread and answer its initial precharge request with `granted`.
    fn start(endpoint: &str, decoder: DecoderConfig, buffers: usize, granted: usize) -> Self {
        let mut harness = Self::start_silent(endpoint, decoder, buffers);
        assert_eq!(harness.recv().msg_val(), &MsgVal::Identity);
        harness.grant(granted);
        // Commands are handled in order, so the grant has been applied once
        // this round trip completes.
        harness.status();
        harness
    }

    /// Start a thread without reading anything from it.
    fn start_silent(endpoint: &str, decoder: DecoderConfig, buffers: usize) -> Self {
        Self::launch(config(endpoint, decoder), buffers, None)
    }

    /// Start a thread on `config`, reading from `source` when given.
    fn launch(config: ReceiverConfig, buffers: usize, source: Option<ScriptedSource>) -> Self {
        let decoder = config.decoder.build().unwrap();
        let pool = SharedBufferPool::new(buffers, decoder.buffer_size_for_frame()).unwrap();

        let mut router = IpcChannel::new(ChannelType::Router);
        router.bind(&config.ctrl_endpoint).unwrap();

        let thread = RxThread::new(&config, pool.clone(), decoder).with_identity(IDENTITY);
        let thread = match source {
            Some(source) => thread.with_source(source),
            None => thread,
        };
        let handle = thread.start().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(handle.local_addr()).unwrap();

        Self {
            router,
            handle: Some(handle),
            pool,
            sender,
            next_count: 100,
        }
    }

    fn handle(&self) -> &RxThreadHandle {
        self.handle.as_ref().unwrap()
    }

    fn recv(&mut self) -> IpcMessage {
        let (identity, msg) = self
            .router
            .recv_message_timeout(WAIT)
            .unwrap()
            .expect("receive thread sent nothing");
        assert_eq!(identity, IDENTITY);
        msg
    }

    /// Next message with the given type and value, skipping others.
    fn recv_matching(&mut self, msg_type: MsgType, msg_val: &MsgVal) -> IpcMessage {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let msg = self.recv();
            if msg.msg_type() == msg_type && msg.msg_val() == msg_val {
                return msg;
            }
        }
        panic!("no {} {} received", msg_type, msg_val);
    }

    fn grant(&mut self, granted: usize) {
        let request = self.recv_matching(MsgType::Command, &MsgVal::BufferPrechargeRequest);
        let ack = IpcMessage::ack_for(&request).with_param("granted", granted);
        self.router.send_message_to(IDENTITY, &ack).unwrap();
    }

    fn command(&mut self, msg: IpcMessage) -> IpcMessage {
        let val = msg.msg_val().clone();
        self.router.send_message_to(IDENTITY, &msg).unwrap();
        self.recv_matching(MsgType::Acknowledgement, &val)
    }

    fn status(&mut self) -> IpcMessage {
        let count = self.next_count;
        self.next_count += 1;
        let ack = self.command(IpcMessage::command(MsgVal::Status).with_param("count", count));
        assert_eq!(ack.get_param::<u64>("count").unwrap(), count);
        ack
    }

    fn counter(&mut self, name: &str) -> u64 {
        self.status().get_param::<u64>(name).unwrap()
    }

    /// Poll status until `name` reaches `value`.
    fn wait_counter(&mut self, name: &str, value: u64) {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.counter(name) >= value {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("{} never reached {}", name, value);
    }

    fn send(&self, packet: &[u8]) {
        self.sender.send(packet).unwrap();
    }

    fn stop(&mut self, drain_timeout_ms: Option<u64>) -> IpcMessage {
        let mut stop = IpcMessage::command(MsgVal::Stop);
        if let Some(ms) = drain_timeout_ms {
            stop.set_param("drain_timeout_ms", ms);
        }
        self.command(stop)
    }

    fn join(&mut self) {
        let handle = self.handle.take().unwrap();
        assert!(handle.wait_for_state(RxState::Stopped, WAIT));
        handle.join().unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.handle.is_some() && !std::thread::panicking() {
            let _ = self.router.send_message_to(IDENTITY, &IpcMessage::command(MsgVal::Stop));
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn config(endpoint: &str, decoder: DecoderConfig) -> ReceiverConfig {
    ReceiverConfig {
        rx_address: "127.0.0.1".parse().unwrap(),
        rx_port: 0,
        ctrl_endpoint: format!("inproc://{}", endpoint),
        precharge_count: 2,
        poll_interval_ms: 10,
        drain_timeout_ms: 300,
        decoder,
        ..Default::default()
    }
}

fn dummy() -> DecoderConfig {
    DecoderConfig::Dummy(DummyConfig {
        max_payload_size: 64,
        frame_timeout_ms: 1000,
    })
}

fn packetized(packets_per_frame: u32, frame_timeout_ms: u64) -> DecoderConfig {
    DecoderConfig::Packetized(PacketizedConfig {
        payload_size: 4,
        packets_per_frame,
        frame_timeout_ms,
    })
}

fn packetizer(packets_per_frame: u32) -> PacketizedDecoder {
    PacketizedDecoder::new(PacketizedConfig {
        payload_size: 4,
        packets_per_frame,
        frame_timeout_ms: 1000,
    })
    .unwrap()
}

#[test]
fn test_identity_then_precharge_before_packets() {
    let mut h = Harness::start_silent("rx_startup", dummy(), 4);
    // Queued before the thread reads anything
    h.send(&DummyDecoder::encode_packet(0, b"early"));

    let first = h.recv();
    assert_eq!(first.msg_type(), MsgType::Notification);
    assert_eq!(first.msg_val(), &MsgVal::Identity);
    assert_eq!(first.get_param::<String>("identity").unwrap(), IDENTITY);
    assert_eq!(
        first.get_param::<String>("rx_address").unwrap(),
        h.handle().local_addr().to_string()
    );

    let second = h.recv();
    assert_eq!(second.msg_type(), MsgType::Command);
    assert_eq!(second.msg_val(), &MsgVal::BufferPrechargeRequest);
    assert_eq!(second.get_param::<u64>("count").unwrap(), 2);

    let third = h.recv();
    assert_eq!(third.msg_val(), &MsgVal::FrameReady);
    assert_eq!(third.get_param::<u64>("frame").unwrap(), 0);
}

#[test]
fn test_precharge_fills_reserve() {
    let mut h = Harness::start("rx_precharge", dummy(), 4, 2);
    h.wait_counter("empty_buffers", 2);
    assert_eq!(h.pool.assigned_count(), 2);
    assert_eq!(h.counter("precharge_requests"), 1);

    h.stop(None);
    h.join();
    assert_eq!(h.pool.free_count(), 4);
}

#[test]
fn test_status_echoes_count() {
    let mut h = Harness::start("rx_status", dummy(), 4, 0);
    for count in [0u64, 7, 123_456] {
        let ack = h.command(IpcMessage::command(MsgVal::Status).with_param("count", count));
        assert_eq!(ack.msg_type(), MsgType::Acknowledgement);
        assert_eq!(ack.get_param::<u64>("count").unwrap(), count);
        assert_eq!(ack.get_param::<String>("identity").unwrap(), IDENTITY);
        assert!(ack.has_param("packets_received"));
    }
}

#[test]
fn test_single_packet_frames_each_get_a_buffer() {
    let mut h = Harness::start("rx_frames", dummy(), 16, 2);
    let frames = 10u32;
    for frame in 0..frames {
        h.send(&DummyDecoder::encode_packet(frame, format!("frame-{}", frame).as_bytes()));
    }

    let mut buffers = Vec::new();
    for expected in 0..frames {
        let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
        assert_eq!(notify.get_param::<u32>("frame").unwrap(), expected);
        assert!(notify.get_param::<bool>("complete").unwrap());
        assert_eq!(notify.get_param::<u32>("packets").unwrap(), 1);

        let buffer_id = notify.get_param::<usize>("buffer_id").unwrap();
        let handle = h.pool.get(buffer_id).unwrap();
        assert_eq!(notify.get_param::<usize>("length").unwrap(), handle.len());
        assert_eq!(&*handle.read().unwrap(), format!("frame-{}", expected).as_bytes());
        buffers.push(buffer_id);
    }
    buffers.sort_unstable();
    buffers.dedup();
    assert_eq!(buffers.len(), frames as usize);
    assert_eq!(h.pool.ready_count(), frames as usize);
    assert_eq!(h.counter("frames_completed"), u64::from(frames));
}

#[test]
fn test_stop_mid_frame_forces_completion() {
    let mut h = Harness::start("rx_stop_forced", packetized(4, 10_000), 4, 1);
    let encoder = packetizer(4);
    h.send(&encoder.encode_packet(1, 0, b"aaaa"));
    h.send(&encoder.encode_packet(1, 1, b"bbbb"));
    h.wait_counter("packets_received", 2);

    let ack = h.stop(Some(50));
    assert_eq!(ack.get_param::<u64>("frames_forced").unwrap(), 1);
    assert_eq!(ack.get_param::<u64>("frames_drained").unwrap(), 0);
    assert_eq!(ack.get_param::<u64>("frames_timed_out").unwrap(), 1);
    h.join();

    // Nothing follows the acknowledgement
    assert!(h.router.recv_timeout(Duration::from_millis(50)).unwrap().is_none());
    assert_eq!(h.pool.assigned_count(), 0);
    assert_eq!(h.pool.ready_count(), 1);
}

#[test]
fn test_stop_drains_in_flight_frame() {
    let mut h = Harness::start("rx_stop_drain", packetized(4, 10_000), 4, 0);
    let encoder = packetizer(4);
    h.send(&encoder.encode_packet(3, 0, b"aaaa"));
    h.send(&encoder.encode_packet(3, 1, b"bbbb"));
    h.wait_counter("frames_in_flight", 1);

    h.router
        .send_message_to(
            IDENTITY,
            &IpcMessage::command(MsgVal::Stop).with_param("drain_timeout_ms", 2000),
        )
        .unwrap();
    assert!(h.handle().wait_for_state(RxState::Stopping, WAIT));
    h.send(&encoder.encode_packet(3, 2, b"cccc"));
    h.send(&encoder.encode_packet(3, 3, b"dddd"));

    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert_eq!(notify.get_param::<u64>("frame").unwrap(), 3);
    assert!(notify.get_param::<bool>("complete").unwrap());
    let handle = h.pool.get(notify.get_param("buffer_id").unwrap()).unwrap();
    assert_eq!(&*handle.read().unwrap(), b"aaaabbbbccccdddd");

    let ack = h.recv_matching(MsgType::Acknowledgement, &MsgVal::Stop);
    assert_eq!(ack.get_param::<u64>("frames_drained").unwrap(), 1);
    assert_eq!(ack.get_param::<u64>("frames_forced").unwrap(), 0);
    h.join();
    assert_eq!(h.pool.assigned_count(), 0);
}

#[test]
fn test_no_messages_after_stop_ack() {
    let mut h = Harness::start("rx_stop_quiet", dummy(), 4, 2);
    h.stop(None);
    h.join();
    assert!(h.router.recv_timeout(Duration::from_millis(50)).unwrap().is_none());
}

#[test]
fn test_unsupported_command_acknowledged_with_error() {
    let mut h = Harness::start("rx_unsupported", dummy(), 4, 0);

    let ack = h.command(IpcMessage::command(MsgVal::from("calibrate")).with_param("count", 5));
    assert_eq!(ack.msg_val().as_str(), "calibrate");
    assert!(ack.get_param::<bool>("unsupported").unwrap());
    assert!(ack.has_param("error"));
    assert_eq!(ack.get_param::<u64>("count").unwrap(), 5);

    // A known value that is not a command the thread accepts
    let ack = h.command(IpcMessage::command(MsgVal::FrameReady));
    assert!(ack.get_param::<bool>("unsupported").unwrap());

    assert!(!h.handle().state().is_terminal());
}

#[test]
fn test_undecodable_envelope_answered_illegal() {
    let mut h = Harness::start("rx_illegal", dummy(), 4, 0);
    h.router.send_to(IDENTITY, b"{not json").unwrap();

    let ack = h.recv_matching(MsgType::Acknowledgement, &MsgVal::Illegal);
    assert!(ack.has_param("error"));
    // Still serving commands
    h.status();
}

#[test]
fn test_mistyped_stop_parameter_keeps_running() {
    let mut h = Harness::start("rx_bad_param", dummy(), 4, 0);
    let ack = h.command(IpcMessage::command(MsgVal::Stop).with_param("drain_timeout_ms", "soon"));
    assert!(ack.has_param("error"));
    assert!(!ack.has_param("unsupported"));

    assert!(!h.handle().state().is_terminal());
    h.status();
}

#[test]
fn test_exhaustion_drops_whole_frame_and_requests_precharge() {
    let mut h = Harness::start("rx_exhausted", dummy(), 2, 0);
    for frame in 0..3 {
        h.send(&DummyDecoder::encode_packet(frame, b"x"));
    }

    let first = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    let request = h.recv_matching(MsgType::Command, &MsgVal::BufferPrechargeRequest);
    assert_eq!(h.counter("frames_dropped"), 1);
    assert_eq!(h.counter("packets_lost"), 1);
    assert_eq!(h.counter("precharge_requests"), 2);

    // Consumer frees a buffer, owner grants it
    h.pool.release(first.get_param("buffer_id").unwrap()).unwrap();
    let ack = IpcMessage::ack_for(&request).with_param("granted", 1);
    h.router.send_message_to(IDENTITY, &ack).unwrap();

    // A retransmission of the dropped frame stays dropped
    h.send(&DummyDecoder::encode_packet(2, b"x"));
    h.wait_counter("packets_lost", 2);

    h.send(&DummyDecoder::encode_packet(3, b"y"));
    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert_eq!(notify.get_param::<u64>("frame").unwrap(), 3);
    assert_eq!(h.counter("frames_dropped"), 1);
}

#[test]
fn test_incomplete_frame_times_out() {
    let mut h = Harness::start("rx_timeout", packetized(4, 50), 4, 0);
    let encoder = packetizer(4);
    h.send(&encoder.encode_packet(7, 0, b"aaaa"));
    h.send(&encoder.encode_packet(7, 1, b"bbbb"));

    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert_eq!(notify.get_param::<u64>("frame").unwrap(), 7);
    assert!(!notify.get_param::<bool>("complete").unwrap());
    assert_eq!(notify.get_param::<u32>("packets").unwrap(), 2);
    assert_eq!(notify.get_param::<usize>("length").unwrap(), 8);
    assert_eq!(h.counter("frames_timed_out"), 1);

    // Stragglers for the published frame are late, not a new frame
    h.send(&encoder.encode_packet(7, 2, b"cccc"));
    h.wait_counter("packets_late", 1);
    assert_eq!(h.counter("frames_in_flight"), 0);
}

#[test]
fn test_duplicate_packet_last_write_wins() {
    let mut h = Harness::start("rx_duplicate", packetized(2, 10_000), 4, 0);
    let encoder = packetizer(2);
    h.send(&encoder.encode_packet(1, 0, b"aaaa"));
    h.send(&encoder.encode_packet(1, 0, b"bbbb"));
    h.send(&encoder.encode_packet(1, 1, b"cccc"));

    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert!(notify.get_param::<bool>("complete").unwrap());
    assert_eq!(notify.get_param::<u32>("packets").unwrap(), 2);
    let handle = h.pool.get(notify.get_param("buffer_id").unwrap()).unwrap();
    assert_eq!(&*handle.read().unwrap(), b"bbbbcccc");
}

#[test]
fn test_malformed_packets_counted() {
    let mut h = Harness::start("rx_malformed", dummy(), 4, 0);
    h.send(&[1, 2]);
    h.send(&DummyDecoder::encode_packet(1, &[0u8; 200]));
    h.wait_counter("packets_malformed", 2);
    assert_eq!(h.counter("packets_received"), 2);
    assert_eq!(h.counter("frames_completed"), 0);
    assert_eq!(h.pool.ready_count(), 0);
}

#[test]
fn test_reset_statistics_keeps_gauges() {
    let mut h = Harness::start("rx_reset", dummy(), 4, 2);
    h.send(&DummyDecoder::encode_packet(0, b"a"));
    h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    h.wait_counter("empty_buffers", 1);

    let ack = h.command(IpcMessage::command(MsgVal::ResetStatistics));
    assert!(!ack.has_param("error"));
    let status = h.status();
    assert_eq!(status.get_param::<u64>("packets_received").unwrap(), 0);
    assert_eq!(status.get_param::<u64>("frames_completed").unwrap(), 0);
    assert_eq!(status.get_param::<u64>("empty_buffers").unwrap(), 1);
}

#[test]
fn test_request_configuration_reports_geometry() {
    let mut h = Harness::start("rx_configuration", packetized(8, 500), 3, 0);
    let ack = h.command(IpcMessage::command(MsgVal::RequestConfiguration));
    assert_eq!(ack.get_param::<String>("decoder").unwrap(), "packetized");
    assert_eq!(ack.get_param::<u64>("frame_size").unwrap(), 32);
    assert_eq!(ack.get_param::<u64>("packets_per_frame").unwrap(), 8);
    assert_eq!(ack.get_param::<u64>("buffer_count").unwrap(), 3);
    assert_eq!(ack.get_param::<u64>("frame_timeout_ms").unwrap(), 500);
    assert_eq!(
        ack.get_param::<String>("ctrl_endpoint").unwrap(),
        "inproc://rx_configuration"
    );
}

#[test]
fn test_pool_smaller_than_frame_rejected() {
    let config = ReceiverConfig {
        rx_address: "127.0.0.1".parse().unwrap(),
        rx_port: 0,
        ctrl_endpoint: "inproc://rx_small_pool".to_string(),
        decoder: packetized(4, 100),
        ..Default::default()
    };
    let pool = SharedBufferPool::new(2, 8).unwrap();
    let result = RxThread::new(&config, pool, config.decoder.build().unwrap()).start();
    assert!(matches!(result, Err(ReceiverError::Configuration(_))));
}

#[test]
fn test_max_packet_size_below_decoder_rejected() {
    // Dummy packets are up to 4 + 64 bytes
    let config = ReceiverConfig {
        max_packet_size: 10,
        ..config("rx_small_max_packet", dummy())
    };
    let pool = SharedBufferPool::new(2, 64).unwrap();
    let result = RxThread::new(&config, pool, config.decoder.build().unwrap()).start();
    assert!(matches!(result, Err(ReceiverError::Configuration(_))));
}

#[test]
fn test_datagram_over_max_packet_size_is_malformed() {
    let config = ReceiverConfig {
        max_packet_size: 68,
        ..config("rx_max_packet", dummy())
    };
    let mut h = Harness::launch(config, 4, None);
    assert_eq!(h.recv().msg_val(), &MsgVal::Identity);
    h.grant(0);

    // One byte over, and far over (truncated by the receive buffer)
    h.send(&DummyDecoder::encode_packet(1, &[1u8; 65]));
    h.send(&DummyDecoder::encode_packet(2, &[2u8; 4000]));
    h.wait_counter("packets_malformed", 2);
    assert_eq!(h.counter("frames_completed"), 0);

    h.send(&DummyDecoder::encode_packet(3, &[3u8; 64]));
    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert_eq!(notify.get_param::<u64>("frame").unwrap(), 3);
    assert_eq!(notify.get_param::<usize>("length").unwrap(), 64);
    assert!(notify.get_param::<bool>("complete").unwrap());
}

#[test]
fn test_source_failure_reports_thread_error_and_releases_buffers() {
    let (packets, source) = ScriptedSource::new();
    let mut h = Harness::launch(config("rx_source_error", packetized(4, 10_000)), 6, Some(source));
    assert_eq!(h.recv().msg_val(), &MsgVal::Identity);
    h.grant(2);
    h.wait_counter("empty_buffers", 2);

    let encoder = packetizer(4);
    packets.send(Ok(encoder.encode_packet(5, 0, b"aaaa"))).unwrap();
    h.wait_counter("frames_in_flight", 1);

    packets
        .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "link down")))
        .unwrap();
    let notify = h.recv_matching(MsgType::Notification, &MsgVal::ThreadError);
    assert_eq!(notify.get_param::<String>("identity").unwrap(), IDENTITY);
    assert!(notify.get_param::<String>("error").unwrap().contains("link down"));

    let forced = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert_eq!(forced.get_param::<u64>("frame").unwrap(), 5);
    assert!(!forced.get_param::<bool>("complete").unwrap());

    h.join();
    assert_eq!(h.pool.assigned_count(), 0);
    assert_eq!(h.pool.ready_count(), 1);
    // No stop was requested, so nothing is acknowledged
    assert!(h.router.recv_timeout(Duration::from_millis(50)).unwrap().is_none());
}

#[test]
fn test_wait_for_state_keeps_idle_and_receiving_apart() {
    let (packets, source) = ScriptedSource::new();
    let mut h = Harness::launch(config("rx_wait_state", dummy()), 4, Some(source));
    assert_eq!(h.recv().msg_val(), &MsgVal::Identity);
    h.grant(0);

    assert!(h.handle().wait_for_state(RxState::Idle, WAIT));
    assert!(!h.handle().wait_for_state(RxState::Receiving, Duration::from_millis(50)));

    h.stop(None);
    assert!(h.handle().wait_for_state(RxState::Receiving, Duration::ZERO));
    drop(packets);
    h.join();
}

#[test]
fn test_configure_applies_settings() {
    let mut h = Harness::start("rx_configure", packetized(4, 10_000), 4, 0);
    let ack = h.command(
        IpcMessage::command(MsgVal::Configure)
            .with_param("frame_timeout_ms", 50)
            .with_param("precharge_count", 3)
            .with_param("bogus", true),
    );
    assert!(!ack.has_param("error"));
    assert_eq!(
        ack.get_param::<serde_json::Value>("applied").unwrap(),
        json!(["frame_timeout_ms", "precharge_count"])
    );
    assert_eq!(ack.get_param::<serde_json::Value>("ignored").unwrap(), json!(["bogus"]));

    let configuration = h.command(IpcMessage::command(MsgVal::RequestConfiguration));
    assert_eq!(configuration.get_param::<u64>("frame_timeout_ms").unwrap(), 50);
    assert_eq!(configuration.get_param::<u64>("precharge_count").unwrap(), 3);

    // The shorter timeout now forces out a partial frame
    h.send(&packetizer(4).encode_packet(2, 0, b"aaaa"));
    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert!(!notify.get_param::<bool>("complete").unwrap());
    assert_eq!(h.counter("frames_timed_out"), 1);
}

#[test]
fn test_configure_is_all_or_nothing() {
    let mut h = Harness::start("rx_configure_bad", dummy(), 4, 0);
    for bad in [
        json!({"precharge_count": 3, "poll_interval_ms": 0}),
        json!({"precharge_count": 99}),
        json!({"drain_timeout_ms": "soon"}),
        json!({"decoder": {"kind": "excalibur"}}),
    ] {
        let mut request = IpcMessage::command(MsgVal::Configure);
        for (name, value) in bad.as_object().unwrap() {
            request.set_param(name.clone(), value.clone());
        }
        let ack = h.command(request);
        assert!(ack.has_param("error"), "accepted {}", bad);
    }

    let configuration = h.command(IpcMessage::command(MsgVal::RequestConfiguration));
    assert_eq!(configuration.get_param::<u64>("precharge_count").unwrap(), 2);
    assert_eq!(configuration.get_param::<u64>("poll_interval_ms").unwrap(), 10);
    assert_eq!(configuration.get_param::<String>("decoder").unwrap(), "dummy");
}

#[test]
fn test_configure_replaces_decoder() {
    // Dummy frames are 64 bytes; a 4 x 4 byte packetized frame fits the pool
    let mut h = Harness::start("rx_configure_decoder", dummy(), 4, 0);

    let too_big = h.command(
        IpcMessage::command(MsgVal::Configure)
            .with_param("decoder", json!({"kind": "dummy", "max_payload_size": 4096})),
    );
    assert!(too_big.get_param::<String>("error").unwrap().contains("cannot hold"));

    let ack = h.command(IpcMessage::command(MsgVal::Configure).with_param(
        "decoder",
        json!({"kind": "packetized", "payload_size": 4, "packets_per_frame": 4}),
    ));
    assert!(!ack.has_param("error"));

    let configuration = h.command(IpcMessage::command(MsgVal::RequestConfiguration));
    assert_eq!(configuration.get_param::<String>("decoder").unwrap(), "packetized");
    assert_eq!(configuration.get_param::<u64>("packets_per_frame").unwrap(), 4);
    assert_eq!(configuration.get_param::<u64>("frame_size").unwrap(), 16);

    let encoder = packetizer(4);
    for (packet, payload) in [b"aaaa", b"bbbb", b"cccc", b"dddd"].iter().enumerate() {
        h.send(&encoder.encode_packet(9, packet as u32, *payload));
    }
    let notify = h.recv_matching(MsgType::Notification, &MsgVal::FrameReady);
    assert!(notify.get_param::<bool>("complete").unwrap());
    let handle = h.pool.get(notify.get_param("buffer_id").unwrap()).unwrap();
    assert_eq!(&*handle.read().unwrap(), b"aaaabbbbccccdddd");
}
