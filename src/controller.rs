//! Owning-process side of a receive pipeline.
//!
//! [`FrameReceiverController`] builds the decoder and buffer pool from a
//! [`ReceiverConfig`], binds the router end of the control channel and runs
//! one receive thread behind it. Inbound control traffic is handled in
//! [`FrameReceiverController::service`]:
//!
//! - `cmd buffer_precharge_request {count}` is granted `min(count, free)`.
//! - `notify frame_ready` becomes a [`FrameReady`] event on a crossbeam channel
//!   and, with `frame_ready_endpoint` set, is republished on a PUB socket.
//! - `notify thread_error` is recorded and reported by [`thread_error`].
//! - Commands from any other control client (a REQ or DEALER socket on the
//!   same endpoint) are relayed to the receive thread and its acknowledgement
//!   is routed back, so external tools see the thread's own replies.
//! - Acknowledgements are held until a request waiting on them collects them.
//!
//! Consumers own every [`FrameReady::handle`] they receive and must release it.
//!
//! [`thread_error`]: FrameReceiverController::thread_error

use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, ReceiverResult};
use crate::decoder::DecoderConfig;
use crate::rx_thread::{PacketSource, RxState, RxStatus, RxThread, RxThreadHandle};
use crossbeam::channel::{unbounded, Receiver, Sender};
use frame_ipc::{ChannelType, IpcChannel, IpcError, IpcMessage, MsgType, MsgVal, ParamError};
use frame_pool::{BufferHandle, SharedBufferPool};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extra time allowed for the stop acknowledgement beyond the drain timeout.
const STOP_MARGIN: Duration = Duration::from_millis(500);

/// A completed frame handed to downstream consumers.
#[derive(Debug, Clone)]
pub struct FrameReady {
    /// Frame number from the packet headers.
    pub frame: u64,
    /// Read handle on the `Ready` buffer holding the frame.
    pub handle: BufferHandle,
    /// Packets written into the frame.
    pub packets: u32,
    /// `false` when the frame was force-completed by timeout or drain.
    pub complete: bool,
}

/// A command from another control client, in flight to the receive thread.
struct Relay {
    client: String,
    /// The client's own `count`, restored on the acknowledgement.
    count: Option<Value>,
    request: IpcMessage,
}

/// Runs one receive thread and answers its control traffic.
pub struct FrameReceiverController {
    config: ReceiverConfig,
    pool: SharedBufferPool,
    router: IpcChannel,
    publisher: Option<IpcChannel>,
    rx: Option<RxThreadHandle>,
    rx_identity: Option<String>,
    events_tx: Sender<FrameReady>,
    events_rx: Receiver<FrameReady>,
    /// Acknowledgements not yet collected by a waiting request.
    replies: VecDeque<IpcMessage>,
    /// Relayed commands keyed by the `count` they were forwarded with.
    relays: HashMap<u64, Relay>,
    next_count: u64,
    thread_error: Option<String>,
}

impl FrameReceiverController {
    /// Validate `config`, create the pool and bind the control endpoint.
    pub fn new(config: ReceiverConfig) -> ReceiverResult<Self> {
        config.validate()?;
        let decoder = config.decoder.build()?;
        let frame_size = decoder.buffer_size_for_frame();
        let buffer_size = config.effective_buffer_size(frame_size);
        let buffer_count = config.effective_buffer_count(frame_size);

        let pool = match &config.shared_buffer_name {
            Some(name) => SharedBufferPool::with_name(name, buffer_count, buffer_size)?,
            None => SharedBufferPool::new(buffer_count, buffer_size)?,
        };

        let mut router = IpcChannel::new(ChannelType::Router);
        router.bind(&config.ctrl_endpoint)?;
        let publisher = match &config.frame_ready_endpoint {
            Some(endpoint) => {
                let mut publisher = IpcChannel::new(ChannelType::Publisher);
                publisher.bind(endpoint)?;
                info!(
                    endpoint = publisher.endpoint().unwrap_or(endpoint.as_str()),
                    "Publishing frame_ready"
                );
                Some(publisher)
            }
            None => None,
        };

        let (events_tx, events_rx) = unbounded();
        info!(
            endpoint = router.endpoint().unwrap_or(config.ctrl_endpoint.as_str()),
            decoder = decoder.name(),
            buffer_count,
            buffer_size,
            "Frame receiver controller created"
        );

        Ok(Self {
            config,
            pool,
            router,
            publisher,
            rx: None,
            rx_identity: None,
            events_tx,
            events_rx,
            replies: VecDeque::new(),
            relays: HashMap::new(),
            next_count: 1,
            thread_error: None,
        })
    }

    /// Spawn the receive thread and wait for its identity announcement.
    pub fn start(&mut self) -> ReceiverResult<()> {
        let thread = self.prepare()?;
        self.launch(thread)
    }

    /// Like [`start`](Self::start), reading datagrams from `source` instead
    /// of binding the configured UDP address.
    pub fn start_with_source(
        &mut self,
        source: impl PacketSource + 'static,
    ) -> ReceiverResult<()> {
        let thread = self.prepare()?.with_source(source);
        self.launch(thread)
    }

    fn prepare(&self) -> ReceiverResult<RxThread> {
        if self.rx.is_some() {
            return Err(ReceiverError::Thread("receive thread already started".to_string()));
        }
        let decoder = self.config.decoder.build()?;
        // The thread connects to the resolved endpoint so `tcp://host:*` works.
        let mut config = self.config.clone();
        if let Some(endpoint) = self.router.endpoint() {
            config.ctrl_endpoint = endpoint.to_string();
        }
        Ok(RxThread::new(&config, self.pool.clone(), decoder))
    }

    fn launch(&mut self, thread: RxThread) -> ReceiverResult<()> {
        self.thread_error = None;
        let handle = thread.start()?;
        let identity = handle.identity().to_string();
        self.rx = Some(handle);

        let deadline = Instant::now() + self.config.status_timeout();
        while self.rx_identity.as_deref() != Some(identity.as_str()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReceiverError::Timeout(format!(
                    "identity announcement from {}",
                    identity
                )));
            }
            self.service(remaining)?;
        }
        Ok(())
    }

    /// Handle control traffic for up to `timeout`.
    ///
    /// Waits for the first message, then handles everything already queued.
    /// Returns the number of messages handled.
    pub fn service(&mut self, timeout: Duration) -> ReceiverResult<usize> {
        let mut handled = 0;
        let mut wait = timeout;
        loop {
            let envelope = match self.router.recv_timeout(wait) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Ok(handled),
                Err(IpcError::Framing(e)) => {
                    warn!(error = %e, "Dropping badly framed control message");
                    handled += 1;
                    wait = Duration::ZERO;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            handled += 1;
            wait = Duration::ZERO;

            match IpcMessage::decode(&envelope.payload) {
                Ok(msg) => self.handle(&envelope.identity, msg),
                Err(e) => {
                    warn!(identity = %envelope.identity, error = %e, "Undecodable control message");
                    if !self.is_rx(&envelope.identity) {
                        let reply =
                            IpcMessage::ack(MsgVal::Illegal).with_param("error", e.to_string());
                        self.reply_to(&envelope.identity, &reply);
                    }
                }
            }
        }
    }

    fn is_rx(&self, identity: &str) -> bool {
        self.rx.as_ref().is_some_and(|rx| rx.identity() == identity)
    }

    fn handle(&mut self, identity: &str, msg: IpcMessage) {
        let from_rx = self.is_rx(identity);
        let msg_val = msg.msg_val().clone();
        match (msg.msg_type(), msg_val) {
            (MsgType::Notification, MsgVal::Identity) if from_rx => {
                let rx_address = msg.get_param_or("rx_address", String::new());
                info!(identity, %rx_address, "Receive thread announced");
                self.rx_identity = Some(identity.to_string());
            }
            (MsgType::Command, MsgVal::BufferPrechargeRequest) => {
                self.grant_precharge(identity, &msg)
            }
            (MsgType::Notification, MsgVal::FrameReady) if from_rx => {
                self.publish_frame(&msg);
                self.forward_frame(&msg);
            }
            (MsgType::Notification, MsgVal::ThreadError) if from_rx => {
                let reason = msg.get_param_or("error", "unknown error".to_string());
                error!(identity, error = %reason, "Receive thread failed");
                self.thread_error = Some(reason);
            }
            (MsgType::Acknowledgement, _) if from_rx => self.on_ack(msg),
            (MsgType::Command, _) if !from_rx => self.relay(identity, msg),
            (msg_type, msg_val) => {
                debug!(identity, %msg_type, %msg_val, "Ignoring control message");
            }
        }
    }

    fn reply_to(&self, identity: &str, msg: &IpcMessage) {
        if let Err(e) = self.router.send_message_to(identity, msg) {
            warn!(
                identity,
                msg_val = %msg.msg_val(),
                error = %e,
                "Failed to reply to control client"
            );
        }
    }

    /// Forward a command from another control client to the receive thread.
    fn relay(&mut self, client: &str, mut request: IpcMessage) {
        let Some(rx_identity) = self.rx_identity.clone() else {
            let reply = IpcMessage::ack_for(&request)
                .with_param("error", "receive thread not running");
            self.reply_to(client, &reply);
            return;
        };

        let count = self.next_count;
        self.next_count += 1;
        let client_count = request.remove_param("count");
        request.set_param("count", count);
        match self.router.send_message_to(&rx_identity, &request) {
            Ok(()) => {
                debug!(client, msg_val = %request.msg_val(), count, "Relaying command");
                self.relays.insert(
                    count,
                    Relay {
                        client: client.to_string(),
                        count: client_count,
                        request,
                    },
                );
            }
            Err(e) => {
                let mut reply = IpcMessage::ack_for(&request).with_param("error", e.to_string());
                restore_count(&mut reply, client_count);
                self.reply_to(client, &reply);
            }
        }
    }

    fn on_ack(&mut self, mut msg: IpcMessage) {
        let relay = msg
            .get_param::<u64>("count")
            .ok()
            .and_then(|count| self.relays.remove(&count));
        let Some(relay) = relay else {
            self.replies.push_back(msg);
            return;
        };
        self.note_configured(&relay.request, &msg);
        restore_count(&mut msg, relay.count);
        self.reply_to(&relay.client, &msg);
    }

    /// Answer every relayed command still waiting on a thread that has gone.
    fn fail_relays(&mut self) {
        let relays = std::mem::take(&mut self.relays);
        for relay in relays.into_values() {
            let mut reply = IpcMessage::ack_for(&relay.request)
                .with_param("error", "receive thread stopped");
            restore_count(&mut reply, relay.count);
            self.reply_to(&relay.client, &reply);
        }
    }

    /// Keep the controller's view of thread settings in step with an
    /// accepted `configure`.
    fn note_configured(&mut self, request: &IpcMessage, reply: &IpcMessage) {
        if *request.msg_val() != MsgVal::Configure || reply.has_param("error") {
            return;
        }
        let applied = reply.get_param_or("applied", Value::Null);
        let applied = applied.as_array().map(Vec::as_slice).unwrap_or_default();
        for name in applied.iter().filter_map(Value::as_str) {
            match name {
                "precharge_count" => {
                    if let Ok(count) = request.get_param::<usize>(name) {
                        self.config.precharge_count = count;
                    }
                }
                "poll_interval_ms" => {
                    if let Ok(ms) = request.get_param::<u64>(name) {
                        self.config.poll_interval_ms = ms;
                    }
                }
                "drain_timeout_ms" => {
                    if let Ok(ms) = request.get_param::<u64>(name) {
                        self.config.drain_timeout_ms = ms;
                    }
                }
                "decoder" => {
                    let decoder = request
                        .get_param::<Value>(name)
                        .ok()
                        .and_then(|value| serde_json::from_value::<DecoderConfig>(value).ok());
                    if let Some(decoder) = decoder {
                        self.config.decoder = decoder;
                    }
                }
                _ => {}
            }
        }
    }

    fn publish_frame(&self, msg: &IpcMessage) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.send_message(msg) {
                warn!(error = %e, "Failed to publish frame_ready");
            }
        }
    }

    fn grant_precharge(&self, identity: &str, request: &IpcMessage) {
        let reply = match request.get_param::<usize>("count") {
            Ok(count) => {
                let granted = count.min(self.pool.free_count());
                debug!(identity, count, granted, "Granting buffer precharge");
                IpcMessage::ack_for(request).with_param("granted", granted)
            }
            Err(e) => {
                warn!(identity, error = %e, "Bad precharge request");
                IpcMessage::ack_for(request)
                    .with_param("granted", 0)
                    .with_param("error", e.to_string())
            }
        };
        if let Err(e) = self.router.send_message_to(identity, &reply) {
            warn!(identity, error = %e, "Failed to answer precharge request");
        }
    }

    fn forward_frame(&self, msg: &IpcMessage) {
        let (frame, buffer_id, packets, complete) = match frame_fields(msg) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(error = %e, "Malformed frame_ready notification");
                return;
            }
        };
        let handle = match self.pool.get(buffer_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(frame, buffer_id, error = %e, "frame_ready for a buffer that is not ready");
                return;
            }
        };
        if self
            .events_tx
            .send(FrameReady {
                frame,
                handle,
                packets,
                complete,
            })
            .is_err()
        {
            debug!(frame, "No frame consumer");
        }
    }

    /// Send `request` to the receive thread and wait for its acknowledgement.
    ///
    /// The acknowledgement is matched on message value and the `count`
    /// parameter, which is filled with a fresh value here.
    fn request(
        &mut self,
        mut request: IpcMessage,
        timeout: Duration,
    ) -> ReceiverResult<IpcMessage> {
        let identity = self
            .rx_identity
            .clone()
            .ok_or_else(|| ReceiverError::Thread("receive thread not started".to_string()))?;
        let count = self.next_count;
        self.next_count += 1;
        request.set_param("count", count);
        let val = request.msg_val().clone();
        self.router.send_message_to(&identity, &request)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.replies.iter().position(|reply| {
                *reply.msg_val() == val && reply.get_param::<u64>("count").ok() == Some(count)
            }) {
                if let Some(reply) = self.replies.remove(pos) {
                    return Ok(reply);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReceiverError::Timeout(format!("{} acknowledgement", val)));
            }
            self.service(remaining)?;
        }
    }

    fn checked(reply: IpcMessage) -> ReceiverResult<IpcMessage> {
        match reply.get_param::<String>("error") {
            Ok(error) => Err(ReceiverError::Protocol(error)),
            Err(_) => Ok(reply),
        }
    }

    /// Query the receive thread's counters.
    pub fn status(&mut self) -> ReceiverResult<RxStatus> {
        let reply =
            self.request(IpcMessage::command(MsgVal::Status), self.config.status_timeout())?;
        RxStatus::from_message(&Self::checked(reply)?)
            .map_err(|e| ReceiverError::Protocol(format!("bad status reply: {}", e)))
    }

    /// Fetch the receive thread's decoder, pool and endpoint configuration.
    pub fn request_configuration(&mut self) -> ReceiverResult<Map<String, Value>> {
        let reply = self.request(
            IpcMessage::command(MsgVal::RequestConfiguration),
            self.config.status_timeout(),
        )?;
        Ok(Self::checked(reply)?.params().clone())
    }

    /// Change receive thread settings at runtime.
    ///
    /// Accepted parameters are `precharge_count`, `poll_interval_ms`,
    /// `drain_timeout_ms`, `frame_timeout_ms` and `decoder` (a decoder table
    /// as in the configuration file). Either all are applied or none; the
    /// acknowledgement lists them under `applied` and any unrecognised names
    /// under `ignored`.
    pub fn configure(
        &mut self,
        params: Map<String, Value>,
    ) -> ReceiverResult<Map<String, Value>> {
        let mut request = IpcMessage::command(MsgVal::Configure);
        for (name, value) in params {
            request.set_param(name, value);
        }
        let reply = self.request(request.clone(), self.config.status_timeout())?;
        let reply = Self::checked(reply)?;
        self.note_configured(&request, &reply);
        Ok(reply.params().clone())
    }

    /// Zero the receive thread's counters.
    pub fn reset_statistics(&mut self) -> ReceiverResult<()> {
        let reply = self.request(
            IpcMessage::command(MsgVal::ResetStatistics),
            self.config.status_timeout(),
        )?;
        Self::checked(reply).map(|_| ())
    }

    /// Stop the receive thread, wait for its acknowledgement and join it.
    ///
    /// Returns the stop acknowledgement's parameters (drain counts and final
    /// counters), or an empty map if the thread had already stopped.
    pub fn stop(&mut self) -> ReceiverResult<Map<String, Value>> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(Map::new());
        };
        let timeout = self.config.drain_timeout() + STOP_MARGIN;
        if rx.state().is_terminal() || rx.is_finished() {
            // Already stopping on its own (socket failure or a relayed stop).
            let deadline = Instant::now() + timeout;
            while !self.rx.as_ref().map_or(true, RxThreadHandle::is_finished) {
                if Instant::now() >= deadline {
                    return Err(ReceiverError::Timeout("receive thread exit".to_string()));
                }
                self.service(Duration::from_millis(10))?;
            }
            self.service(Duration::ZERO)?;
            self.join()?;
            return Ok(Map::new());
        }

        let reply = self.request(IpcMessage::command(MsgVal::Stop), timeout)?;
        self.join()?;
        let reply = Self::checked(reply)?;
        info!(
            frames_drained = reply.get_param_or("frames_drained", 0u64),
            frames_forced = reply.get_param_or("frames_forced", 0u64),
            "Receive thread stopped"
        );
        Ok(reply.params().clone())
    }

    /// Join the receive thread if it is running.
    pub fn join(&mut self) -> ReceiverResult<()> {
        let joined = match self.rx.take() {
            Some(rx) => rx.join(),
            None => Ok(()),
        };
        self.fail_relays();
        joined
    }

    /// Completed frames, in the order the receive thread published them.
    pub fn frame_ready_events(&self) -> Receiver<FrameReady> {
        self.events_rx.clone()
    }

    /// The buffer pool shared with the receive thread.
    pub fn pool(&self) -> &SharedBufferPool {
        &self.pool
    }

    /// Identity announced by the receive thread.
    pub fn identity(&self) -> Option<&str> {
        self.rx_identity.as_deref()
    }

    /// UDP address of the running receive thread.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.rx.as_ref().map(RxThreadHandle::local_addr)
    }

    /// Receive thread state, if one was started and not yet joined.
    pub fn rx_state(&self) -> Option<RxState> {
        self.rx.as_ref().map(RxThreadHandle::state)
    }

    /// Reason reported by a `thread_error` notification.
    pub fn thread_error(&self) -> Option<&str> {
        self.thread_error.as_deref()
    }

    /// The configuration in use, including accepted `configure` changes.
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Control endpoint as bound, with a wildcard TCP port resolved.
    pub fn ctrl_endpoint(&self) -> &str {
        self.router.endpoint().unwrap_or(self.config.ctrl_endpoint.as_str())
    }

    /// Endpoint `frame_ready` notifications are republished on, if any.
    pub fn frame_ready_endpoint(&self) -> Option<&str> {
        self.publisher.as_ref().and_then(IpcChannel::endpoint)
    }
}

fn restore_count(msg: &mut IpcMessage, count: Option<Value>) {
    match count {
        Some(count) => msg.set_param("count", count),
        None => {
            msg.remove_param("count");
        }
    }
}

fn frame_fields(msg: &IpcMessage) -> Result<(u64, usize, u32, bool), ParamError> {
    Ok((
        msg.get_param("frame")?,
        msg.get_param("buffer_id")?,
        msg.get_param("packets")?,
        msg.get_param("complete")?,
    ))
}

impl Drop for FrameReceiverController {
    fn drop(&mut self) {
        if self.rx.is_some() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Receive thread did not stop cleanly");
            }
        }
    }
}
