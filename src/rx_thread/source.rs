//! Where the receive thread reads datagrams from.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::trace;

/// Smallest read timeout handed to the socket; `set_read_timeout` rejects zero.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// A datagram source polled by the receive thread.
///
/// Any error returned from [`recv`](PacketSource::recv) is fatal to the
/// thread: it reports `thread_error` and stops.
pub trait PacketSource: Send {
    /// Wait up to `timeout` for one datagram and copy it into `buf`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. A datagram longer than
    /// `buf` is truncated to `buf.len()`.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Address datagrams are received on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A bound UDP socket.
#[derive(Debug)]
pub struct UdpSource {
    socket: UdpSocket,
    timeout: Option<Duration>,
}

impl UdpSource {
    /// Bind a UDP socket on `addr` (port 0 picks an ephemeral port).
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr)?,
            timeout: None,
        })
    }
}

impl PacketSource for UdpSource {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let timeout = timeout.max(MIN_TIMEOUT);
        if self.timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.timeout = Some(timeout);
        }
        match self.socket.recv_from(buf) {
            Ok((len, from)) => {
                trace!(len, %from, "Packet received");
                Ok(Some(len))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
