//! Error types for the control protocol.

use crate::ChannelType;
use thiserror::Error;

/// Convenience alias for protocol results.
pub type IpcResult<T> = std::result::Result<T, IpcError>;

/// Typed parameter lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// The parameter is not present in the message.
    #[error("missing parameter '{0}'")]
    Missing(String),

    /// The parameter exists but has a different type.
    #[error("parameter '{name}' is not a valid {expected}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// Expected type name.
        expected: &'static str,
    },
}

/// Errors raised while encoding, decoding or transporting control messages.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The envelope is not valid JSON or lacks a required field.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// A typed parameter lookup failed.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// The endpoint string is not a supported address.
    #[error("Invalid endpoint '{0}' (expected tcp://, ipc:// or inproc://)")]
    InvalidEndpoint(String),

    /// Another socket already bound this endpoint.
    #[error("Endpoint '{0}' is already bound")]
    AddressInUse(String),

    /// A router tried to address an identity that is not connected.
    #[error("No peer with identity '{0}'")]
    UnknownPeer(String),

    /// The channel has not been bound or connected yet (or was closed).
    #[error("Channel is not bound or connected")]
    NotConnected,

    /// The operation is not available for this channel type.
    #[error("{operation} is not supported on a {kind:?} channel")]
    WrongChannelType {
        /// Operation attempted.
        operation: &'static str,
        /// Channel type.
        kind: ChannelType,
    },

    /// A multipart message did not have the expected frames.
    #[error("Bad message framing: {0}")]
    Framing(String),

    /// Any other ZeroMQ failure.
    #[error("ZeroMQ error: {0}")]
    Transport(zmq::Error),

    /// The peer side of the channel has gone away.
    #[error("Channel disconnected")]
    Disconnected,
}

impl From<zmq::Error> for IpcError {
    fn from(err: zmq::Error) -> Self {
        match err {
            zmq::Error::ETERM => IpcError::Disconnected,
            other => IpcError::Transport(other),
        }
    }
}
