//! The receive loop.
//!
//! One iteration drains pending control messages, waits at most one poll
//! interval for a datagram, places it, then force-completes any frame older
//! than the decoder's frame timeout. Neither source can block the other for
//! longer than the poll interval.
//!
//! `configure` is all-or-nothing: every recognised parameter is validated
//! before any is applied.

use super::counters::RxCounters;
use super::decoder_params;
use super::frames::{FrameHistory, FrameTracker, WriteOutcome};
use super::source::PacketSource;
use super::state::{RxState, SharedState};
use crate::decoder::{DecodeError, DecoderConfig, FrameDecoder, FrameId};
use frame_ipc::{IpcChannel, IpcMessage, MsgType, MsgVal, ParamError};
use frame_pool::{AssignedBuffer, PoolError, SharedBufferPool};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Everything the receive thread owns.
pub(crate) struct RxWorker {
    pub(crate) identity: String,
    pub(crate) source: Box<dyn PacketSource>,
    pub(crate) channel: IpcChannel,
    pub(crate) pool: SharedBufferPool,
    pub(crate) decoder: Box<dyn FrameDecoder>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) precharge_count: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) drain_timeout: Duration,
    /// Longest datagram accepted; longer ones count as malformed.
    pub(crate) max_packet: usize,
    /// `max_packet` was set in configuration rather than taken from the decoder.
    pub(crate) max_packet_fixed: bool,
    /// `request_configuration` reply body, kept current by `configure`.
    pub(crate) configuration: Map<String, Value>,
}

/// A `stop` command accepted for execution.
struct StopRequest {
    request: IpcMessage,
    drain_timeout: Duration,
}

/// Per-run bookkeeping, borrowed separately from the owned resources.
struct LoopState {
    frames: FrameTracker,
    reserve: VecDeque<AssignedBuffer>,
    counters: RxCounters,
    precharge_pending: bool,
}

/// Validated `configure` parameters, not yet applied.
#[derive(Default)]
struct Reconfigure {
    precharge_count: Option<usize>,
    poll_interval_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    frame_timeout_ms: Option<u64>,
    decoder: Option<Box<dyn FrameDecoder>>,
    ignored: Vec<String>,
}

/// `true` for 1, 2, 4, 8, ...: used to log repeated conditions sparsely.
fn sparse(count: u64) -> bool {
    count.is_power_of_two()
}

impl RxWorker {
    /// Run until stopped or the packet source fails.
    pub(crate) fn run(mut self) {
        let span = info_span!("frame_rx", identity = %self.identity);
        let _entered = span.enter();

        let mut ls = LoopState {
            frames: FrameTracker::new(
                self.decoder.expected_packets_per_frame(),
                self.decoder.frame_timeout(),
            ),
            reserve: VecDeque::new(),
            counters: RxCounters::default(),
            precharge_pending: false,
        };

        self.state.advance(RxState::Listening);
        info!(
            addr = %self.local_addr,
            decoder = self.decoder.name(),
            "Receive thread listening"
        );

        let announce = IpcMessage::notify(MsgVal::Identity)
            .with_param("identity", self.identity.as_str())
            .with_param("rx_address", self.local_addr.to_string());
        self.send(&announce);
        self.request_precharge(&mut ls);

        // One spare byte so an oversized datagram is seen as oversized rather
        // than silently truncated.
        let mut recv_buf = vec![0u8; self.max_packet + 1];
        loop {
            if let Some(stop) = self.service_control(&mut ls) {
                self.drain_and_stop(&mut ls, &mut recv_buf, Some(stop));
                return;
            }
            if recv_buf.len() != self.max_packet + 1 {
                recv_buf.resize(self.max_packet + 1, 0);
            }

            match self.source.recv(&mut recv_buf, self.poll_interval) {
                Ok(Some(len)) => {
                    self.state.advance(RxState::Receiving);
                    self.handle_packet(&mut ls, &recv_buf[..len], true);
                }
                Ok(None) => {
                    self.state.advance(RxState::Idle);
                }
                Err(e) => {
                    error!(error = %e, "Fatal packet source error");
                    let notify = IpcMessage::notify(MsgVal::ThreadError)
                        .with_param("identity", self.identity.as_str())
                        .with_param("error", e.to_string());
                    self.send(&notify);
                    self.drain_and_stop(&mut ls, &mut recv_buf, None);
                    return;
                }
            }

            if !ls.frames.is_empty() {
                self.expire_frames(&mut ls, Instant::now());
            }
        }
    }

    fn send(&self, msg: &IpcMessage) {
        if let Err(e) = self.channel.send_message(msg) {
            warn!(msg_val = %msg.msg_val(), error = %e, "Failed to send control message");
        }
    }

    // =========================================================================
    // Packet path
    // =========================================================================

    fn handle_packet(&self, ls: &mut LoopState, packet: &[u8], accept_new: bool) {
        ls.counters.packets_received += 1;

        if packet.len() > self.max_packet {
            ls.counters.packets_malformed += 1;
            if sparse(ls.counters.packets_malformed) {
                let e = DecodeError::Oversized {
                    len: packet.len(),
                    max: self.max_packet,
                };
                warn!(
                    error = %e,
                    packets_malformed = ls.counters.packets_malformed,
                    "Dropping malformed packet"
                );
            }
            return;
        }

        let placement = match self.decoder.identify_destination(packet) {
            Ok(placement) => placement,
            Err(e) => {
                ls.counters.packets_malformed += 1;
                if sparse(ls.counters.packets_malformed) {
                    warn!(
                        error = %e,
                        packets_malformed = ls.counters.packets_malformed,
                        "Dropping malformed packet"
                    );
                }
                return;
            }
        };

        let id = placement.frame_id;
        if !ls.frames.contains(id) {
            match ls.frames.history(id) {
                FrameHistory::Dropped => {
                    ls.counters.packets_lost += 1;
                    trace!(frame = id, "Packet for dropped frame");
                    return;
                }
                FrameHistory::Completed => {
                    ls.counters.packets_late += 1;
                    debug!(frame = id, "Packet for already completed frame");
                    return;
                }
                FrameHistory::New => {}
            }

            if !accept_new {
                ls.counters.packets_lost += 1;
                trace!(frame = id, "Ignoring new frame while draining");
                return;
            }

            match self.acquire_buffer(ls) {
                Some(buffer) => {
                    debug!(frame = id, buffer_id = buffer.id(), "Frame started");
                    ls.frames.begin(id, buffer, Instant::now());
                }
                None => {
                    ls.counters.frames_dropped += 1;
                    ls.counters.packets_lost += 1;
                    ls.frames.record_dropped(id);
                    if sparse(ls.counters.frames_dropped) {
                        warn!(
                            frame = id,
                            frames_dropped = ls.counters.frames_dropped,
                            "No empty buffer, dropping frame"
                        );
                    }
                    self.request_precharge(ls);
                    return;
                }
            }
        }

        let payload = packet
            .get(self.decoder.packet_header_size()..)
            .unwrap_or_default();
        match ls.frames.write(id, placement.buffer_offset, payload) {
            Some(Ok(outcome)) => {
                if placement.is_final || outcome == WriteOutcome::Full {
                    self.publish(ls, id, false);
                }
            }
            Some(Err(e)) => {
                ls.counters.packets_malformed += 1;
                if sparse(ls.counters.packets_malformed) {
                    warn!(frame = id, error = %e, "Packet does not fit frame buffer");
                }
            }
            None => {}
        }
    }

    fn acquire_buffer(&self, ls: &mut LoopState) -> Option<AssignedBuffer> {
        if let Some(buffer) = ls.reserve.pop_front() {
            return Some(buffer);
        }
        match self.pool.allocate() {
            Ok(buffer) => Some(buffer),
            Err(PoolError::Exhausted { .. }) => None,
            Err(e) => {
                error!(error = %e, "Buffer allocation failed");
                None
            }
        }
    }

    fn publish(&self, ls: &mut LoopState, id: FrameId, forced: bool) {
        match ls.frames.complete(id, forced) {
            Some(Ok(done)) => {
                ls.counters.frames_completed += 1;
                debug!(
                    frame = done.frame_id,
                    buffer_id = done.handle.id(),
                    len = done.handle.len(),
                    packets = done.packets,
                    complete = done.complete,
                    "Frame ready"
                );
                let notify = IpcMessage::notify(MsgVal::FrameReady)
                    .with_param("frame", done.frame_id)
                    .with_param("buffer_id", done.handle.id())
                    .with_param("length", done.handle.len())
                    .with_param("packets", done.packets)
                    .with_param("complete", done.complete);
                self.send(&notify);
            }
            Some(Err(e)) => error!(frame = id, error = %e, "Failed to publish frame buffer"),
            None => {}
        }
    }

    fn expire_frames(&self, ls: &mut LoopState, now: Instant) {
        for id in ls.frames.expired(now) {
            ls.counters.frames_timed_out += 1;
            warn!(frame = id, "Frame timed out incomplete");
            self.publish(ls, id, true);
        }
    }

    // =========================================================================
    // Control path
    // =========================================================================

    fn request_precharge(&self, ls: &mut LoopState) {
        if ls.precharge_pending {
            return;
        }
        let request = IpcMessage::command(MsgVal::BufferPrechargeRequest)
            .with_param("count", self.precharge_count);
        self.send(&request);
        ls.precharge_pending = true;
        ls.counters.precharge_requests += 1;
        debug!(count = self.precharge_count, "Requested buffer precharge");
    }

    /// Handle every queued control message. Returns an accepted stop request.
    fn service_control(&mut self, ls: &mut LoopState) -> Option<StopRequest> {
        loop {
            let envelope = match self.channel.try_recv() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return None,
                Err(e) => {
                    debug!(error = %e, "Control channel receive failed");
                    return None;
                }
            };

            let msg = match IpcMessage::decode(&envelope.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Undecodable control message");
                    let reply = IpcMessage::ack(MsgVal::Illegal).with_param("error", e.to_string());
                    self.send(&reply);
                    continue;
                }
            };

            if let Some(stop) = self.dispatch(ls, msg) {
                return Some(stop);
            }
        }
    }

    fn dispatch(&mut self, ls: &mut LoopState, msg: IpcMessage) -> Option<StopRequest> {
        trace!(msg = %msg, "Control message");
        match (msg.msg_type(), msg.msg_val()) {
            (MsgType::Command, MsgVal::Status) => {
                let reply = self.status_reply(ls, &msg);
                self.send(&reply);
            }
            (MsgType::Command, MsgVal::Stop) => match msg.get_param::<u64>("drain_timeout_ms") {
                Ok(ms) => {
                    return Some(StopRequest {
                        request: msg,
                        drain_timeout: Duration::from_millis(ms),
                    })
                }
                Err(ParamError::Missing(_)) => {
                    return Some(StopRequest {
                        request: msg,
                        drain_timeout: self.drain_timeout,
                    })
                }
                Err(e) => self.send(&error_reply(&msg, e.to_string(), false)),
            },
            (MsgType::Command, MsgVal::RequestConfiguration) => {
                let mut reply = IpcMessage::ack_for(&msg);
                for (name, value) in &self.configuration {
                    reply.set_param(name.clone(), value.clone());
                }
                self.send(&reply);
            }
            (MsgType::Command, MsgVal::ResetStatistics) => {
                ls.counters.reset();
                info!("Statistics reset");
                self.send(&IpcMessage::ack_for(&msg));
            }
            (MsgType::Command, MsgVal::Configure) => {
                let reply = match self.parse_configure(ls, &msg) {
                    Ok(update) => self.apply_configure(ls, &msg, update),
                    Err(error) => {
                        warn!(error = %error, "Configuration rejected");
                        error_reply(&msg, error, false)
                    }
                };
                self.send(&reply);
            }
            (MsgType::Command, other) => {
                warn!(msg_val = %other, "Unsupported command");
                self.send(&error_reply(
                    &msg,
                    format!("unsupported command '{}'", other),
                    true,
                ));
            }
            (MsgType::Acknowledgement, MsgVal::BufferPrechargeRequest) => {
                self.on_precharge_ack(ls, &msg);
            }
            (msg_type, msg_val) => {
                debug!(%msg_type, %msg_val, "Ignoring control message");
            }
        }
        None
    }

    fn status_reply(&self, ls: &mut LoopState, request: &IpcMessage) -> IpcMessage {
        refresh_gauges(ls);
        let mut reply = IpcMessage::ack_for(request)
            .with_param("identity", self.identity.as_str())
            .with_param("state", self.state.get().as_str());
        ls.counters.write_params(&mut reply);
        reply
    }

    fn parse_configure(&self, ls: &LoopState, msg: &IpcMessage) -> Result<Reconfigure, String> {
        let mut update = Reconfigure::default();
        for name in msg.params().keys() {
            match name.as_str() {
                "precharge_count" => {
                    let count = msg.get_param::<usize>(name).map_err(|e| e.to_string())?;
                    let buffers = self.pool.buffer_count();
                    if count == 0 || count > buffers {
                        return Err(format!("precharge_count must be between 1 and {}", buffers));
                    }
                    update.precharge_count = Some(count);
                }
                "poll_interval_ms" => update.poll_interval_ms = Some(positive_millis(msg, name)?),
                "drain_timeout_ms" => update.drain_timeout_ms = Some(positive_millis(msg, name)?),
                "frame_timeout_ms" => update.frame_timeout_ms = Some(positive_millis(msg, name)?),
                "decoder" => {
                    let value = msg.get_param::<Value>(name).map_err(|e| e.to_string())?;
                    let config: DecoderConfig = serde_json::from_value(value)
                        .map_err(|e| format!("invalid decoder configuration: {}", e))?;
                    let decoder = config.build().map_err(|e| e.to_string())?;
                    self.check_decoder(ls, &*decoder)?;
                    update.decoder = Some(decoder);
                }
                "count" => {}
                other => update.ignored.push(other.to_string()),
            }
        }
        Ok(update)
    }

    fn check_decoder(&self, ls: &LoopState, decoder: &dyn FrameDecoder) -> Result<(), String> {
        if !ls.frames.is_empty() {
            return Err(format!(
                "cannot replace the decoder with {} frames in flight",
                ls.frames.len()
            ));
        }
        let frame_size = decoder.buffer_size_for_frame();
        if frame_size > self.pool.buffer_size() {
            return Err(format!(
                "pool buffers of {} bytes cannot hold a {} byte {} frame",
                self.pool.buffer_size(),
                frame_size,
                decoder.name()
            ));
        }
        if self.max_packet_fixed && self.max_packet < decoder.max_packet_size() {
            return Err(format!(
                "max_packet_size ({}) is below the {} byte {} packet maximum",
                self.max_packet,
                decoder.max_packet_size(),
                decoder.name()
            ));
        }
        Ok(())
    }

    fn apply_configure(
        &mut self,
        ls: &mut LoopState,
        msg: &IpcMessage,
        update: Reconfigure,
    ) -> IpcMessage {
        let mut applied: Vec<&str> = Vec::new();

        if let Some(decoder) = update.decoder {
            ls.frames.set_expected_packets(decoder.expected_packets_per_frame());
            ls.frames.set_timeout(decoder.frame_timeout());
            if !self.max_packet_fixed {
                self.max_packet = decoder.max_packet_size();
            }
            decoder_params(&mut self.configuration, &*decoder);
            info!(
                from = self.decoder.name(),
                to = decoder.name(),
                max_packet = self.max_packet,
                "Decoder replaced"
            );
            self.decoder = decoder;
            applied.push("decoder");
        }
        if let Some(ms) = update.frame_timeout_ms {
            ls.frames.set_timeout(Duration::from_millis(ms));
            self.configuration.insert("frame_timeout_ms".to_string(), ms.into());
            applied.push("frame_timeout_ms");
        }
        if let Some(count) = update.precharge_count {
            self.precharge_count = count;
            self.configuration.insert("precharge_count".to_string(), count.into());
            applied.push("precharge_count");
        }
        if let Some(ms) = update.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
            self.configuration.insert("poll_interval_ms".to_string(), ms.into());
            applied.push("poll_interval_ms");
        }
        if let Some(ms) = update.drain_timeout_ms {
            self.drain_timeout = Duration::from_millis(ms);
            self.configuration.insert("drain_timeout_ms".to_string(), ms.into());
            applied.push("drain_timeout_ms");
        }

        info!(applied = ?applied, ignored = ?update.ignored, "Configuration updated");
        let mut reply = IpcMessage::ack_for(msg).with_param("applied", applied);
        if !update.ignored.is_empty() {
            reply.set_param("ignored", update.ignored);
        }
        reply
    }

    fn on_precharge_ack(&self, ls: &mut LoopState, msg: &IpcMessage) {
        ls.precharge_pending = false;
        if let Ok(error) = msg.get_param::<String>("error") {
            warn!(error = %error, "Precharge refused");
        }
        let granted = match msg
            .get_param::<usize>("granted")
            .or_else(|_| msg.get_param::<usize>("count"))
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!(error = %e, "Precharge acknowledgement without a count");
                return;
            }
        };

        let mut taken = 0;
        for _ in 0..granted {
            match self.pool.allocate() {
                Ok(buffer) => {
                    ls.reserve.push_back(buffer);
                    taken += 1;
                }
                Err(PoolError::Exhausted { .. }) => break,
                Err(e) => {
                    warn!(error = %e, "Precharge allocation failed");
                    break;
                }
            }
        }
        refresh_gauges(ls);
        debug!(granted, taken, empty_buffers = ls.reserve.len(), "Buffers precharged");
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Drain in-flight frames, publish what remains, release the reserve.
    ///
    /// With a stop request, keeps reading packets for in-flight frames until
    /// they complete or the drain timeout passes, and acknowledges the stop
    /// last. Without one (source failure) nothing more is read.
    fn drain_and_stop(
        &mut self,
        ls: &mut LoopState,
        recv_buf: &mut [u8],
        stop: Option<StopRequest>,
    ) {
        self.state.advance(RxState::Stopping);
        let in_flight_at_stop = ls.frames.len();
        info!(frames_in_flight = in_flight_at_stop, "Receive thread stopping");

        if let Some(stop) = &stop {
            let deadline = Instant::now() + stop.drain_timeout;
            while !ls.frames.is_empty() {
                let now = Instant::now();
                let remaining = deadline.saturating_duration_since(now);
                if remaining.is_zero() {
                    break;
                }
                let wait = remaining.min(self.poll_interval);
                match self.source.recv(recv_buf, wait) {
                    Ok(Some(len)) => self.handle_packet(ls, &recv_buf[..len], false),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Socket error while draining");
                        break;
                    }
                }
                self.expire_frames(ls, Instant::now());
            }
        }

        let forced = ls.frames.len();
        for id in ls.frames.ids() {
            ls.counters.frames_timed_out += 1;
            self.publish(ls, id, true);
        }

        let mut released = 0usize;
        for buffer in ls.reserve.drain(..) {
            match buffer.release() {
                Ok(()) => released += 1,
                Err(e) => warn!(error = %e, "Failed to release reserve buffer"),
            }
        }
        refresh_gauges(ls);

        self.state.advance(RxState::Stopped);
        info!(
            frames_drained = in_flight_at_stop.saturating_sub(forced),
            frames_forced = forced,
            reserve_released = released,
            frames_completed = ls.counters.frames_completed,
            "Receive thread stopped"
        );

        if let Some(stop) = stop {
            let mut ack = IpcMessage::ack_for(&stop.request)
                .with_param("frames_drained", in_flight_at_stop.saturating_sub(forced))
                .with_param("frames_forced", forced)
                .with_param("reserve_released", released);
            ls.counters.write_params(&mut ack);
            self.send(&ack);
        }
    }
}

fn refresh_gauges(ls: &mut LoopState) {
    ls.counters.frames_in_flight = ls.frames.len() as u64;
    ls.counters.empty_buffers = ls.reserve.len() as u64;
}

fn positive_millis(msg: &IpcMessage, name: &str) -> Result<u64, String> {
    match msg.get_param::<u64>(name) {
        Ok(0) => Err(format!("{} must be > 0", name)),
        Ok(ms) => Ok(ms),
        Err(e) => Err(e.to_string()),
    }
}

fn error_reply(request: &IpcMessage, error: String, unsupported: bool) -> IpcMessage {
    let mut reply = IpcMessage::ack_for(request).with_param("error", error);
    if unsupported {
        reply.set_param("unsupported", true);
    }
    reply
}
