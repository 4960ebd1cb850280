//! Identity-addressed control channels on ZeroMQ sockets.
//!
//! A router binds an endpoint; dealers connect to it under an identity.
//! Everything a dealer sends arrives at the router tagged with that identity,
//! and the router replies by naming it. REQ clients are served too: their
//! empty delimiter frame is remembered per peer and put back on replies.
//!
//! Publishers bind and broadcast single-frame messages; subscribers connect and
//! receive all of them.
//!
//! All channels created with [`IpcChannel::new`] share one process-wide
//! context, so `inproc://` endpoints work across threads and a dealer may
//! connect before its router binds.

use crate::{IpcError, IpcMessage, IpcResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Endpoint schemes accepted by [`IpcChannel::bind`] and [`IpcChannel::connect`].
pub const SUPPORTED_SCHEMES: [&str; 3] = ["tcp://", "ipc://", "inproc://"];

static CONTEXT: Lazy<zmq::Context> = Lazy::new(zmq::Context::new);

/// Check that `endpoint` names a transport this crate can bind or connect.
pub fn validate_endpoint(endpoint: &str) -> IpcResult<()> {
    let supported = SUPPORTED_SCHEMES.iter().any(|scheme| {
        endpoint
            .strip_prefix(scheme)
            .is_some_and(|address| !address.is_empty())
    });
    if supported {
        Ok(())
    } else {
        Err(IpcError::InvalidEndpoint(endpoint.to_string()))
    }
}

/// Role of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Binds an endpoint and talks to many identified peers.
    Router,
    /// Connects to a router under one identity.
    Dealer,
    /// Binds an endpoint and broadcasts to every subscriber.
    Publisher,
    /// Connects to a publisher and receives everything it sends.
    Subscriber,
}

impl ChannelType {
    fn socket_type(self) -> zmq::SocketType {
        match self {
            ChannelType::Router => zmq::ROUTER,
            ChannelType::Dealer => zmq::DEALER,
            ChannelType::Publisher => zmq::PUB,
            ChannelType::Subscriber => zmq::SUB,
        }
    }

    fn binds(self) -> bool {
        matches!(self, ChannelType::Router | ChannelType::Publisher)
    }
}

/// A received payload and the identity it is associated with.
///
/// On a router this is the sending peer. On other channels it is the
/// channel's own identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Peer identity.
    pub identity: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Routing details of a peer a router has heard from.
struct Peer {
    raw: Vec<u8>,
    /// The peer framed its request with an empty delimiter (a REQ socket).
    delimited: bool,
}

/// Printable form of a routing identity. Generated ZeroMQ identities are
/// binary and are shown as hex.
fn identity_string(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) if !text.is_empty() && !text.chars().any(char::is_control) => text.to_string(),
        _ => {
            let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
            format!("0x{}", hex)
        }
    }
}

fn bind_error(endpoint: &str, err: zmq::Error) -> IpcError {
    match err {
        zmq::Error::EADDRINUSE => IpcError::AddressInUse(endpoint.to_string()),
        zmq::Error::EINVAL | zmq::Error::EPROTONOSUPPORT | zmq::Error::ENOENT => {
            IpcError::InvalidEndpoint(endpoint.to_string())
        }
        other => other.into(),
    }
}

/// One end of a control channel.
///
/// A channel is owned by a single thread; it is `Send` but not shared.
pub struct IpcChannel {
    kind: ChannelType,
    context: zmq::Context,
    identity: String,
    /// Endpoint as resolved by ZeroMQ (a wildcard TCP port is filled in).
    endpoint: Option<String>,
    socket: Option<zmq::Socket>,
    peers: HashMap<String, Peer>,
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl IpcChannel {
    /// Create an unconnected channel on the shared context, with a random identity.
    pub fn new(kind: ChannelType) -> Self {
        Self::with_context(kind, &CONTEXT)
    }

    /// Create an unconnected channel on a specific context.
    ///
    /// `inproc://` endpoints only reach channels on the same context.
    pub fn with_context(kind: ChannelType, context: &zmq::Context) -> Self {
        Self {
            kind,
            context: context.clone(),
            identity: uuid::Uuid::new_v4().to_string(),
            endpoint: None,
            socket: None,
            peers: HashMap::new(),
        }
    }

    /// Channel role.
    pub fn kind(&self) -> ChannelType {
        self.kind
    }

    /// Identity this channel presents (meaningful for dealers).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Endpoint this channel is bound or connected to.
    ///
    /// After binding `tcp://host:*` this carries the port actually chosen, so
    /// it can be handed to peers that connect.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Replace the identity. Only allowed before [`connect`](Self::connect).
    pub fn set_identity(&mut self, identity: impl Into<String>) -> IpcResult<()> {
        if self.socket.is_some() {
            return Err(IpcError::WrongChannelType {
                operation: "set_identity after connect",
                kind: self.kind,
            });
        }
        self.identity = identity.into();
        Ok(())
    }

    fn open_socket(&self) -> IpcResult<zmq::Socket> {
        let socket = self.context.socket(self.kind.socket_type())?;
        socket.set_linger(0)?;
        match self.kind {
            ChannelType::Router => socket.set_router_mandatory(true)?,
            ChannelType::Dealer => socket.set_identity(self.identity.as_bytes())?,
            ChannelType::Subscriber => socket.set_subscribe(b"")?,
            ChannelType::Publisher => {}
        }
        Ok(socket)
    }

    /// Bind a router or publisher to `endpoint`.
    pub fn bind(&mut self, endpoint: &str) -> IpcResult<()> {
        if !self.kind.binds() {
            return Err(IpcError::WrongChannelType {
                operation: "bind",
                kind: self.kind,
            });
        }
        validate_endpoint(endpoint)?;
        self.close();

        let socket = self.open_socket()?;
        socket.bind(endpoint).map_err(|e| bind_error(endpoint, e))?;
        let resolved = match socket.get_last_endpoint() {
            Ok(Ok(last)) if !last.is_empty() => last,
            _ => endpoint.to_string(),
        };
        debug!(endpoint = %resolved, kind = ?self.kind, "Channel bound");
        self.endpoint = Some(resolved);
        self.socket = Some(socket);
        Ok(())
    }

    /// Connect a dealer or subscriber to `endpoint`.
    pub fn connect(&mut self, endpoint: &str) -> IpcResult<()> {
        if self.kind.binds() {
            return Err(IpcError::WrongChannelType {
                operation: "connect",
                kind: self.kind,
            });
        }
        validate_endpoint(endpoint)?;
        self.close();

        let socket = self.open_socket()?;
        socket
            .connect(endpoint)
            .map_err(|e| bind_error(endpoint, e))?;
        debug!(endpoint, identity = %self.identity, kind = ?self.kind, "Channel connected");
        self.endpoint = Some(endpoint.to_string());
        self.socket = Some(socket);
        Ok(())
    }

    fn socket(&self) -> IpcResult<&zmq::Socket> {
        self.socket.as_ref().ok_or(IpcError::NotConnected)
    }

    /// Send from a dealer to its router, or from a publisher to its subscribers.
    pub fn send(&self, payload: &[u8]) -> IpcResult<()> {
        match self.kind {
            ChannelType::Dealer | ChannelType::Publisher => {
                self.socket()?.send(payload, 0)?;
                Ok(())
            }
            kind => Err(IpcError::WrongChannelType {
                operation: "send without identity",
                kind,
            }),
        }
    }

    /// Send from a router to the peer connected as `identity`.
    pub fn send_to(&self, identity: &str, payload: &[u8]) -> IpcResult<()> {
        if self.kind != ChannelType::Router {
            return Err(IpcError::WrongChannelType {
                operation: "send_to",
                kind: self.kind,
            });
        }
        let socket = self.socket()?;
        let (raw, delimited) = match self.peers.get(identity) {
            Some(peer) => (peer.raw.as_slice(), peer.delimited),
            None => (identity.as_bytes(), false),
        };

        let mut frames: Vec<&[u8]> = vec![raw];
        if delimited {
            frames.push(&[]);
        }
        frames.push(payload);
        socket.send_multipart(frames, 0).map_err(|e| match e {
            zmq::Error::EHOSTUNREACH => IpcError::UnknownPeer(identity.to_string()),
            other => other.into(),
        })
    }

    /// Encode and send `msg` from a dealer or publisher.
    pub fn send_message(&self, msg: &IpcMessage) -> IpcResult<()> {
        let encoded = msg.encode()?;
        trace!(msg = %encoded, "Sending");
        self.send(encoded.as_bytes())
    }

    /// Encode and send `msg` from a router to `identity`.
    pub fn send_message_to(&self, identity: &str, msg: &IpcMessage) -> IpcResult<()> {
        let encoded = msg.encode()?;
        trace!(identity, msg = %encoded, "Sending");
        self.send_to(identity, encoded.as_bytes())
    }

    /// Wait up to `timeout` for a message without consuming it.
    pub fn poll(&self, timeout: Duration) -> IpcResult<bool> {
        let socket = self.socket()?;
        let millis = match timeout.as_millis() {
            0 if !timeout.is_zero() => 1,
            ms => i64::try_from(ms).unwrap_or(i64::MAX),
        };
        let mut items = [socket.as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, millis)?;
        Ok(items[0].is_readable())
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> IpcResult<Option<Envelope>> {
        self.recv_timeout(Duration::ZERO)
    }

    /// Wait up to `timeout` for the next message.
    pub fn recv_timeout(&mut self, timeout: Duration) -> IpcResult<Option<Envelope>> {
        if !self.poll(timeout)? {
            return Ok(None);
        }
        let mut frames = match self.socket()?.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if self.kind != ChannelType::Router {
            let payload = frames.pop().unwrap_or_default();
            return Ok(Some(Envelope {
                identity: self.identity.clone(),
                payload,
            }));
        }

        if frames.len() < 2 {
            return Err(IpcError::Framing(format!(
                "expected identity and payload, got {} frame(s)",
                frames.len()
            )));
        }
        let raw = frames.remove(0);
        let delimited = frames.len() >= 2 && frames[0].is_empty();
        let payload = frames.pop().unwrap_or_default();
        let identity = identity_string(&raw);
        self.peers.insert(identity.clone(), Peer { raw, delimited });
        Ok(Some(Envelope { identity, payload }))
    }

    /// Wait up to `timeout` for the next message and decode it.
    ///
    /// A payload that is not a valid message is consumed and reported as
    /// [`IpcError::Json`].
    pub fn recv_message_timeout(
        &mut self,
        timeout: Duration,
    ) -> IpcResult<Option<(String, IpcMessage)>> {
        match self.recv_timeout(timeout)? {
            Some(envelope) => {
                let msg = IpcMessage::decode(&envelope.payload)?;
                Ok(Some((envelope.identity, msg)))
            }
            None => Ok(None),
        }
    }

    /// Unbind or disconnect. Queued but unreceived messages are discarded.
    pub fn close(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        if let Some(endpoint) = self.endpoint.take() {
            // The context reaps closed sockets asynchronously; unbind now.
            let released = if self.kind.binds() {
                socket.unbind(&endpoint)
            } else {
                socket.disconnect(&endpoint)
            };
            if let Err(e) = released {
                trace!(endpoint = %endpoint, error = %e, "Endpoint already released");
            }
            debug!(endpoint = %endpoint, kind = ?self.kind, "Channel closed");
        }
        self.peers.clear();
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MsgVal;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_millis(500);

    fn pair(name: &str, identity: &str) -> (IpcChannel, IpcChannel) {
        let mut router = IpcChannel::new(ChannelType::Router);
        router.bind(name).unwrap();
        let mut dealer = IpcChannel::new(ChannelType::Dealer);
        dealer.set_identity(identity).unwrap();
        dealer.connect(router.endpoint().unwrap()).unwrap();
        (router, dealer)
    }

    #[test]
    fn test_round_trip_by_identity() {
        let (mut router, mut dealer) = pair("inproc://test_round_trip", "rx");
        dealer.send(b"hello").unwrap();

        let got = router.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(got.identity, "rx");
        assert_eq!(got.payload, b"hello");

        router.send_to(&got.identity, b"world").unwrap();
        let reply = dealer.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(reply.payload, b"world");
    }

    #[test]
    fn test_tcp_wildcard_port_is_resolved() {
        let (mut router, dealer) = pair("tcp://127.0.0.1:*", "tcp-client");
        let endpoint = router.endpoint().unwrap().to_string();
        assert!(endpoint.starts_with("tcp://127.0.0.1:"));
        assert!(!endpoint.ends_with('*'));

        dealer.send(b"over tcp").unwrap();
        let got = router.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(got.identity, "tcp-client");
        assert_eq!(got.payload, b"over tcp");
    }

    #[test]
    fn test_req_client_gets_delimited_reply() {
        let mut router = IpcChannel::new(ChannelType::Router);
        router.bind("inproc://test_req_client").unwrap();

        let req = CONTEXT.socket(zmq::REQ).unwrap();
        req.connect("inproc://test_req_client").unwrap();
        req.send("ping", 0).unwrap();

        let got = router.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"ping");
        assert!(got.identity.starts_with("0x"));
        router.send_to(&got.identity, b"pong").unwrap();

        let mut items = [req.as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, 500).unwrap();
        assert!(items[0].is_readable());
        assert_eq!(req.recv_bytes(0).unwrap(), b"pong");
    }

    #[test]
    fn test_router_addresses_multiple_dealers() {
        let (mut router, mut a) = pair("inproc://test_multi", "a");
        let mut b = IpcChannel::new(ChannelType::Dealer);
        b.set_identity("b").unwrap();
        b.connect("inproc://test_multi").unwrap();
        for dealer in [&a, &b] {
            dealer.send(b"hello").unwrap();
            router.recv_timeout(WAIT).unwrap().unwrap();
        }

        router.send_to("b", b"for-b").unwrap();
        router.send_to("a", b"for-a").unwrap();
        assert_eq!(a.recv_timeout(WAIT).unwrap().unwrap().payload, b"for-a");
        assert_eq!(b.recv_timeout(WAIT).unwrap().unwrap().payload, b"for-b");
        assert!(router.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_connect_before_bind() {
        let mut dealer = IpcChannel::new(ChannelType::Dealer);
        dealer.connect("inproc://test_early").unwrap();
        dealer.send(b"queued").unwrap();

        let mut router = IpcChannel::new(ChannelType::Router);
        router.bind("inproc://test_early").unwrap();
        let got = router.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(got.payload, b"queued");
        assert_eq!(got.identity, dealer.identity());
    }

    #[test]
    fn test_per_sender_ordering() {
        let (mut router, dealer) = pair("inproc://test_order", "rx");
        for i in 0u8..50 {
            dealer.send(&[i]).unwrap();
        }
        for i in 0u8..50 {
            assert_eq!(router.recv_timeout(WAIT).unwrap().unwrap().payload, vec![i]);
        }
    }

    #[test]
    fn test_poll_does_not_consume() {
        let (mut router, dealer) = pair("inproc://test_poll", "rx");
        assert!(!router.poll(Duration::ZERO).unwrap());

        dealer.send(b"x").unwrap();
        assert!(router.poll(WAIT).unwrap());
        assert!(router.poll(Duration::ZERO).unwrap());
        assert_eq!(router.try_recv().unwrap().unwrap().payload, b"x");
        assert!(!router.poll(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_bind_conflicts_and_rebind_after_close() {
        let mut first = IpcChannel::new(ChannelType::Router);
        first.bind("inproc://test_rebind").unwrap();

        let mut second = IpcChannel::new(ChannelType::Router);
        assert!(matches!(
            second.bind("inproc://test_rebind"),
            Err(IpcError::AddressInUse(_))
        ));

        first.close();
        second.bind("inproc://test_rebind").unwrap();
    }

    #[test]
    fn test_publisher_reaches_subscriber() {
        let mut publisher = IpcChannel::new(ChannelType::Publisher);
        publisher.bind("inproc://test_pub").unwrap();
        let mut subscriber = IpcChannel::new(ChannelType::Subscriber);
        subscriber.connect("inproc://test_pub").unwrap();

        // Subscriptions propagate asynchronously; publish until one lands
        let deadline = Instant::now() + Duration::from_secs(2);
        let got = loop {
            publisher
                .send_message(&IpcMessage::notify(MsgVal::FrameReady).with_param("frame", 1))
                .unwrap();
            if let Some((_, msg)) = subscriber
                .recv_message_timeout(Duration::from_millis(20))
                .unwrap()
            {
                break msg;
            }
            assert!(Instant::now() < deadline, "subscriber never received");
        };
        assert_eq!(got.msg_val(), &MsgVal::FrameReady);
        assert_eq!(got.get_param::<u64>("frame").unwrap(), 1);
    }

    #[test]
    fn test_endpoint_validation() {
        for ok in ["tcp://127.0.0.1:5000", "ipc:///tmp/frame_rx", "inproc://rx_channel"] {
            assert!(validate_endpoint(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "inproc://", "udp://127.0.0.1:5000", "rx_channel"] {
            assert!(
                matches!(validate_endpoint(bad), Err(IpcError::InvalidEndpoint(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_errors() {
        let mut router = IpcChannel::new(ChannelType::Router);
        assert!(matches!(router.bind("inproc://"), Err(IpcError::InvalidEndpoint(_))));
        assert!(matches!(router.try_recv(), Err(IpcError::NotConnected)));
        assert!(matches!(
            router.connect("inproc://x"),
            Err(IpcError::WrongChannelType { .. })
        ));

        router.bind("inproc://test_errors").unwrap();
        assert!(matches!(router.send_to("ghost", b"?"), Err(IpcError::UnknownPeer(_))));
        assert!(matches!(router.send(b"?"), Err(IpcError::WrongChannelType { .. })));

        let mut subscriber = IpcChannel::new(ChannelType::Subscriber);
        subscriber.connect("inproc://test_errors_pub").unwrap();
        assert!(matches!(subscriber.send(b"?"), Err(IpcError::WrongChannelType { .. })));
    }

    #[test]
    fn test_identity_string_for_binary_ids() {
        assert_eq!(identity_string(b"rx-0"), "rx-0");
        assert_eq!(identity_string(&[0, 0x80, 0x01]), "0x008001");
    }

    #[test]
    fn test_message_helpers() {
        let (mut router, mut dealer) = pair("inproc://test_helpers", "rx");
        dealer
            .send_message(&IpcMessage::notify(MsgVal::Identity))
            .unwrap();
        let (identity, msg) = router.recv_message_timeout(WAIT).unwrap().unwrap();
        assert_eq!(identity, "rx");
        assert_eq!(msg.msg_val(), &MsgVal::Identity);

        router
            .send_message_to("rx", &IpcMessage::ack_for(&msg))
            .unwrap();
        assert!(dealer.recv_message_timeout(WAIT).unwrap().is_some());

        dealer.send(b"{broken").unwrap();
        assert!(matches!(
            router.recv_message_timeout(WAIT),
            Err(IpcError::Json(_))
        ));
    }
}
