//! Shared test utilities for the receive pipeline tests.

#![allow(dead_code)]

use crossbeam::channel::{unbounded, Receiver, Sender};
use frame_receiver::PacketSource;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Datagrams and failures fed to the receive thread from the test.
///
/// Once the sender is dropped `recv` returns `Ok(None)` without waiting.
pub struct ScriptedSource {
    packets: Receiver<io::Result<Vec<u8>>>,
}

impl ScriptedSource {
    pub fn new() -> (Sender<io::Result<Vec<u8>>>, Self) {
        let (tx, rx) = unbounded();
        (tx, Self { packets: rx })
    }
}

impl PacketSource for ScriptedSource {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.packets.recv_timeout(timeout) {
            Ok(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(Some(len))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
    }
}
