//! Error types for the frame receiver.
//!
//! `ReceiverError` consolidates the failures of every layer:
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and
//!   semantic validation failures of [`ReceiverConfig`](crate::config::ReceiverConfig).
//! - **`Pool`**: shared buffer pool errors, including `Exhausted`.
//! - **`Ipc`**: control-channel transport and envelope errors.
//! - **`Decode`**: a packet the decoder cannot place (`MalformedPacket`).
//! - **`Socket`**: UDP socket failures. These are the only errors that are
//!   fatal to a receive thread.
//! - **`Protocol`**: well-formed messages with unexpected content.
//! - **`Thread`**: spawn, join or lifecycle failures of the receive thread.
//!
//! **Recovery Strategy**: packet- and allocation-level errors are absorbed by
//! the receive loop and surface only as counters; [`ReceiverError::is_recoverable`]
//! reports which side of that line an error falls on.

use crate::decoder::DecodeError;
use frame_ipc::IpcError;
use frame_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the receiver error type.
pub type ReceiverResult<T> = std::result::Result<T, ReceiverError>;

/// Primary error type for the frame receiver.
#[derive(Error, Debug)]
pub enum ReceiverError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Buffer pool error.
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Control channel error.
    #[error("Control channel error: {0}")]
    Ipc(#[from] IpcError),

    /// Packet could not be decoded.
    #[error("Malformed packet: {0}")]
    Decode(#[from] DecodeError),

    /// UDP socket error.
    #[error("UDP socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// Unexpected control message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Receive thread lifecycle error.
    #[error("Receive thread error: {0}")]
    Thread(String),

    /// A bounded wait elapsed.
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl ReceiverError {
    /// `true` if the receive loop can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReceiverError::Pool(_)
            | ReceiverError::Decode(_)
            | ReceiverError::Protocol(_)
            | ReceiverError::Timeout(_) => true,
            ReceiverError::Ipc(err) => matches!(
                err,
                IpcError::Json(_) | IpcError::Param(_) | IpcError::UnknownPeer(_)
            ),
            ReceiverError::Config(_)
            | ReceiverError::Configuration(_)
            | ReceiverError::Socket(_)
            | ReceiverError::Thread(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_ipc::ParamError;

    #[test]
    fn test_exhaustion_is_recoverable() {
        let err: ReceiverError = PoolError::Exhausted { buffer_count: 4 }.into();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_socket_error_is_fatal() {
        let err = ReceiverError::Socket(std::io::Error::from(std::io::ErrorKind::AddrInUse));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_protocol_errors_are_recoverable() {
        let err: ReceiverError = IpcError::from(ParamError::Missing("count".into())).into();
        assert!(err.is_recoverable());
        let err: ReceiverError = IpcError::Disconnected.into();
        assert!(!err.is_recoverable());
    }
}
