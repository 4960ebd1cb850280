//! UDP receive thread.
//!
//! A receive thread owns one packet source (normally a UDP socket) and one
//! dealer end of the control channel. It announces its identity, asks its
//! owner for empty buffers, then assembles datagrams until told to stop:
//!
//! 1. `notify identity` then `cmd buffer_precharge_request {count}`, before any
//!    packet is read.
//! 2. Packets are placed by the decoder; the first packet of a new frame takes
//!    a buffer from the precharged reserve or straight from the pool.
//! 3. A completed frame is marked `Ready` and announced with
//!    `notify frame_ready {frame, buffer_id, length, packets, complete}`.
//! 4. `cmd stop` drains in-flight frames (bounded), releases unused buffers and
//!    is acknowledged last.
//!
//! Commands understood: `status`, `stop`, `request_configuration`,
//! `reset_statistics`, `configure`. Anything else is acknowledged with an `error` and
//! `unsupported = true`; undecodable envelopes get an `ack illegal`.

mod counters;
mod frames;
mod source;
mod state;
mod worker;

pub use counters::{RxCounters, RxStatus};
pub use source::{PacketSource, UdpSource};
pub use state::RxState;

use crate::config::ReceiverConfig;
use crate::decoder::FrameDecoder;
use crate::error::{ReceiverError, ReceiverResult};
use frame_ipc::{ChannelType, IpcChannel};
use frame_pool::SharedBufferPool;
use serde_json::{Map, Value};
use state::SharedState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::info;
use worker::RxWorker;

/// A configured, not yet running receive thread.
pub struct RxThread {
    config: ReceiverConfig,
    pool: SharedBufferPool,
    decoder: Box<dyn FrameDecoder>,
    identity: String,
    source: Option<Box<dyn PacketSource>>,
}

impl RxThread {
    /// Prepare a receive thread with a fresh random identity.
    pub fn new(
        config: &ReceiverConfig,
        pool: SharedBufferPool,
        decoder: Box<dyn FrameDecoder>,
    ) -> Self {
        Self {
            config: config.clone(),
            pool,
            decoder,
            identity: uuid::Uuid::new_v4().to_string(),
            source: None,
        }
    }

    /// Use a specific control-channel identity.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Read datagrams from `source` instead of binding `rx_address:rx_port`.
    #[must_use]
    pub fn with_source(mut self, source: impl PacketSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Identity the thread will announce.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Bind the socket, connect the control channel and spawn the thread.
    ///
    /// Binding happens on the caller's thread so address and endpoint errors
    /// are returned here rather than reported asynchronously.
    pub fn start(mut self) -> ReceiverResult<RxThreadHandle> {
        let frame_size = self.decoder.buffer_size_for_frame();
        if self.pool.buffer_size() < frame_size {
            return Err(ReceiverError::Configuration(format!(
                "pool buffers of {} bytes cannot hold a {} byte {} frame",
                self.pool.buffer_size(),
                frame_size,
                self.decoder.name()
            )));
        }
        let decoder_max = self.decoder.max_packet_size();
        if self.config.max_packet_size != 0 && self.config.max_packet_size < decoder_max {
            return Err(ReceiverError::Configuration(format!(
                "max_packet_size ({}) is below the {} byte {} packet maximum",
                self.config.max_packet_size,
                decoder_max,
                self.decoder.name()
            )));
        }

        let source: Box<dyn PacketSource> = match self.source.take() {
            Some(source) => source,
            None => Box::new(
                UdpSource::bind(self.config.rx_socket_addr()).map_err(ReceiverError::Socket)?,
            ),
        };
        let local_addr = source.local_addr().map_err(ReceiverError::Socket)?;

        let mut channel = IpcChannel::new(ChannelType::Dealer);
        channel.set_identity(self.identity.clone())?;
        channel.connect(&self.config.ctrl_endpoint)?;

        let max_packet = match self.config.max_packet_size {
            0 => decoder_max,
            configured => configured,
        };

        info!(
            identity = %self.identity,
            addr = %local_addr,
            endpoint = %self.config.ctrl_endpoint,
            recv_buffer_size = self.config.rx_recv_buffer_size,
            max_packet,
            "Starting receive thread"
        );

        let state = Arc::new(SharedState::new());
        let configuration =
            configuration_params(&self.config, &*self.decoder, &self.pool, local_addr);
        let worker = RxWorker {
            identity: self.identity.clone(),
            source,
            channel,
            pool: self.pool,
            decoder: self.decoder,
            state: Arc::clone(&state),
            local_addr,
            precharge_count: self.config.precharge_count,
            poll_interval: self.config.poll_interval(),
            drain_timeout: self.config.drain_timeout(),
            max_packet,
            max_packet_fixed: self.config.max_packet_size != 0,
            configuration,
        };

        let thread = std::thread::Builder::new()
            .name("frame-rx".to_string())
            .spawn(move || worker.run())
            .map_err(|e| ReceiverError::Thread(format!("failed to spawn receive thread: {}", e)))?;

        Ok(RxThreadHandle {
            identity: self.identity,
            local_addr,
            state,
            thread: Some(thread),
        })
    }
}

fn configuration_params(
    config: &ReceiverConfig,
    decoder: &dyn FrameDecoder,
    pool: &SharedBufferPool,
    local_addr: SocketAddr,
) -> Map<String, Value> {
    let mut params = Map::new();
    decoder_params(&mut params, decoder);
    let mut put = |name: &str, value: Value| {
        params.insert(name.to_string(), value);
    };
    put("buffer_count", pool.buffer_count().into());
    put("buffer_size", pool.buffer_size().into());
    if let Some(name) = pool.name() {
        put("shared_buffer_name", name.into());
    }
    put("rx_address", local_addr.to_string().into());
    put("ctrl_endpoint", config.ctrl_endpoint.clone().into());
    put("precharge_count", config.precharge_count.into());
    put("poll_interval_ms", config.poll_interval_ms.into());
    put("drain_timeout_ms", config.drain_timeout_ms.into());
    params
}

/// Write the decoder's geometry into a `request_configuration` reply.
fn decoder_params(params: &mut Map<String, Value>, decoder: &dyn FrameDecoder) {
    params.insert("decoder".to_string(), decoder.name().into());
    params.insert("packet_header_size".to_string(), decoder.packet_header_size().into());
    params.insert("frame_size".to_string(), decoder.buffer_size_for_frame().into());
    params.insert("max_packet_size".to_string(), decoder.max_packet_size().into());
    params.insert(
        "frame_timeout_ms".to_string(),
        (decoder.frame_timeout().as_millis() as u64).into(),
    );
    match decoder.expected_packets_per_frame() {
        Some(packets) => params.insert("packets_per_frame".to_string(), packets.into()),
        None => params.remove("packets_per_frame"),
    };
}

/// Handle to a running receive thread.
///
/// Stopping is done over the control channel (`cmd stop`); the handle only
/// observes state and joins.
#[derive(Debug)]
pub struct RxThreadHandle {
    identity: String,
    local_addr: SocketAddr,
    state: Arc<SharedState>,
    thread: Option<JoinHandle<()>>,
}

impl RxThreadHandle {
    /// Control-channel identity of the thread.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Address the UDP socket is bound to (with the real port when 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RxState {
        self.state.get()
    }

    /// `true` once the thread function has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait until the thread reaches `target` or a later lifecycle stage,
    /// polling every 5 ms. `Receiving` and `Idle` do not satisfy each other.
    pub fn wait_for_state(&self, target: RxState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state().has_reached(target) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Wait for the thread to exit.
    pub fn join(mut self) -> ReceiverResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ReceiverError::Thread("receive thread panicked".to_string())),
            None => Ok(()),
        }
    }
}
