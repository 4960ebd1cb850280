//! Control message envelope.
//!
//! Wire form is a JSON object:
//!
//! ```json
//! {"msg_type":"cmd","msg_val":"status","params":{"count":3},"timestamp":"2026-01-01T00:00:00Z"}
//! ```
//!
//! `msg_type` and `msg_val` are required. `params` defaults to an empty object
//! and `timestamp` to the decode time when absent. Unrecognised `msg_val`
//! strings decode to [`MsgVal::Unknown`] so the receiver can answer them with
//! an error acknowledgement instead of dropping the request.

use crate::{IpcResult, ParamError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// Request that expects an acknowledgement.
    #[serde(rename = "cmd")]
    Command,
    /// Reply to a command.
    #[serde(rename = "ack")]
    Acknowledgement,
    /// Unsolicited event.
    #[serde(rename = "notify")]
    Notification,
}

impl MsgType {
    /// Wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Command => "cmd",
            MsgType::Acknowledgement => "ack",
            MsgType::Notification => "notify",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message value: what the command, ack or notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MsgVal {
    /// Announces the sender's channel identity.
    Identity,
    /// Asks the buffer owner for empty buffers (`count` param).
    BufferPrechargeRequest,
    /// Status query; the ack carries counters.
    Status,
    /// A frame buffer is complete and ready for the consumer.
    FrameReady,
    /// Orderly shutdown request.
    Stop,
    /// Asks for the active configuration.
    RequestConfiguration,
    /// Zeroes the statistics counters.
    ResetStatistics,
    /// Applies new receiver or decoder parameters.
    Configure,
    /// The receive thread hit a fatal error.
    ThreadError,
    /// Reply to a message that could not be decoded.
    Illegal,
    /// Any value this build does not recognise.
    Unknown(String),
}

impl MsgVal {
    /// Wire string for this value.
    pub fn as_str(&self) -> &str {
        match self {
            MsgVal::Identity => "identity",
            MsgVal::BufferPrechargeRequest => "buffer_precharge_request",
            MsgVal::Status => "status",
            MsgVal::FrameReady => "frame_ready",
            MsgVal::Stop => "stop",
            MsgVal::RequestConfiguration => "request_configuration",
            MsgVal::ResetStatistics => "reset_statistics",
            MsgVal::Configure => "configure",
            MsgVal::ThreadError => "thread_error",
            MsgVal::Illegal => "illegal",
            MsgVal::Unknown(raw) => raw,
        }
    }

    /// `false` only for [`MsgVal::Unknown`].
    pub fn is_recognized(&self) -> bool {
        !matches!(self, MsgVal::Unknown(_))
    }
}

impl From<&str> for MsgVal {
    fn from(raw: &str) -> Self {
        match raw {
            "identity" => MsgVal::Identity,
            "buffer_precharge_request" => MsgVal::BufferPrechargeRequest,
            "status" => MsgVal::Status,
            "frame_ready" => MsgVal::FrameReady,
            "stop" => MsgVal::Stop,
            "request_configuration" => MsgVal::RequestConfiguration,
            "reset_statistics" => MsgVal::ResetStatistics,
            "configure" => MsgVal::Configure,
            "thread_error" => MsgVal::ThreadError,
            "illegal" => MsgVal::Illegal,
            other => MsgVal::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MsgVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MsgVal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MsgVal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MsgVal::from(raw.as_str()))
    }
}

// =============================================================================
// Typed parameters
// =============================================================================

/// A Rust type that can be read out of a message parameter.
///
/// Integer conversions are range-checked: a negative JSON number read as
/// `u32` is a [`ParamError::WrongType`], not a wrapped value.
pub trait ParamValue: Sized {
    /// Name used in error messages.
    const TYPE_NAME: &'static str;

    /// Convert from JSON, or `None` if the value has another type.
    fn from_json(value: &Value) -> Option<Self>;
}

macro_rules! signed_param {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);
            fn from_json(value: &Value) -> Option<Self> {
                value.as_i64().and_then(|n| <$ty>::try_from(n).ok())
            }
        }
    )*};
}

macro_rules! unsigned_param {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);
            fn from_json(value: &Value) -> Option<Self> {
                value.as_u64().and_then(|n| <$ty>::try_from(n).ok())
            }
        }
    )*};
}

signed_param!(i32, i64);
unsigned_param!(u16, u32, u64, usize);

impl ParamValue for f64 {
    const TYPE_NAME: &'static str = "f64";
    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl ParamValue for bool {
    const TYPE_NAME: &'static str = "bool";
    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl ParamValue for String {
    const TYPE_NAME: &'static str = "string";
    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl ParamValue for Value {
    const TYPE_NAME: &'static str = "json";
    fn from_json(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

// =============================================================================
// Envelope
// =============================================================================

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    msg_type: MsgType,
    msg_val: MsgVal,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default = "now")]
    timestamp: DateTime<Utc>,
}

impl IpcMessage {
    /// Create a message with no parameters, stamped now.
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        Self {
            msg_type,
            msg_val,
            params: Map::new(),
            timestamp: now(),
        }
    }

    /// Shorthand for a [`MsgType::Command`].
    pub fn command(msg_val: MsgVal) -> Self {
        Self::new(MsgType::Command, msg_val)
    }

    /// Shorthand for a [`MsgType::Acknowledgement`].
    pub fn ack(msg_val: MsgVal) -> Self {
        Self::new(MsgType::Acknowledgement, msg_val)
    }

    /// Shorthand for a [`MsgType::Notification`].
    pub fn notify(msg_val: MsgVal) -> Self {
        Self::new(MsgType::Notification, msg_val)
    }

    /// Acknowledgement for `request`: same value, request params echoed.
    ///
    /// Echoing lets the requester correlate replies without a sequence number.
    pub fn ack_for(request: &IpcMessage) -> Self {
        Self {
            msg_type: MsgType::Acknowledgement,
            msg_val: request.msg_val.clone(),
            params: request.params.clone(),
            timestamp: now(),
        }
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> IpcResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> IpcResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Message value.
    pub fn msg_val(&self) -> &MsgVal {
        &self.msg_val
    }

    /// Timestamp set at construction (or as received).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// All parameters.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// `true` if `name` is present.
    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Typed parameter lookup.
    pub fn get_param<T: ParamValue>(&self, name: &str) -> Result<T, ParamError> {
        let value = self
            .params
            .get(name)
            .ok_or_else(|| ParamError::Missing(name.to_string()))?;
        T::from_json(value).ok_or_else(|| ParamError::WrongType {
            name: name.to_string(),
            expected: T::TYPE_NAME,
        })
    }

    /// Typed parameter lookup with a fallback for missing or mistyped values.
    pub fn get_param_or<T: ParamValue>(&self, name: &str, default: T) -> T {
        self.get_param(name).unwrap_or(default)
    }

    /// Set (or replace) a parameter.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(name.into(), value.into());
    }

    /// Remove a parameter, returning its value.
    pub fn remove_param(&mut self, name: &str) -> Option<Value> {
        self.params.remove(name)
    }

    /// Builder form of [`set_param`](Self::set_param).
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_param(name, value);
        self
    }
}

impl fmt::Display for IpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{} {}", self.msg_type, self.msg_val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcError;

    #[test]
    fn test_wire_form_field_names() {
        let msg = IpcMessage::command(MsgVal::Status).with_param("count", 3);
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["msg_type"], "cmd");
        assert_eq!(json["msg_val"], "status");
        assert_eq!(json["params"]["count"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_decode_minimal_message() {
        let msg = IpcMessage::decode(br#"{"msg_type":"notify","msg_val":"identity"}"#).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Notification);
        assert_eq!(msg.msg_val(), &MsgVal::Identity);
        assert!(msg.params().is_empty());
    }

    #[test]
    fn test_configure_with_nested_params() {
        let mut msg = IpcMessage::decode(
            br#"{"msg_type":"cmd","msg_val":"configure","params":{"test":{"list":true}}}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_val(), &MsgVal::Configure);
        assert_eq!(msg.get_param::<Value>("test").unwrap()["list"], true);
        assert!(msg.remove_param("test").is_some());
        assert!(!msg.has_param("test"));
    }

    #[test]
    fn test_unknown_value_is_preserved() {
        let msg = IpcMessage::decode(br#"{"msg_type":"cmd","msg_val":"reboot"}"#).unwrap();
        assert_eq!(msg.msg_val(), &MsgVal::Unknown("reboot".into()));
        assert!(!msg.msg_val().is_recognized());
        assert!(msg.encode().unwrap().contains("\"reboot\""));
    }

    #[test]
    fn test_decode_rejects_garbage_and_missing_fields() {
        assert!(matches!(IpcMessage::decode(b"not json"), Err(IpcError::Json(_))));
        assert!(matches!(
            IpcMessage::decode(br#"{"msg_val":"status"}"#),
            Err(IpcError::Json(_))
        ));
        assert!(matches!(
            IpcMessage::decode(br#"{"msg_type":"shout","msg_val":"status"}"#),
            Err(IpcError::Json(_))
        ));
    }

    #[test]
    fn test_typed_params() {
        let msg = IpcMessage::notify(MsgVal::FrameReady)
            .with_param("frame", 7u64)
            .with_param("complete", true)
            .with_param("name", "rx")
            .with_param("offset", -4);

        assert_eq!(msg.get_param::<u64>("frame").unwrap(), 7);
        assert_eq!(msg.get_param::<usize>("frame").unwrap(), 7);
        assert!(msg.get_param::<bool>("complete").unwrap());
        assert_eq!(msg.get_param::<String>("name").unwrap(), "rx");
        assert_eq!(msg.get_param::<i32>("offset").unwrap(), -4);

        assert_eq!(
            msg.get_param::<u32>("missing"),
            Err(ParamError::Missing("missing".into()))
        );
        assert!(matches!(
            msg.get_param::<u32>("name"),
            Err(ParamError::WrongType { expected: "u32", .. })
        ));
        assert!(matches!(
            msg.get_param::<u32>("offset"),
            Err(ParamError::WrongType { .. })
        ));
        assert_eq!(msg.get_param_or::<u32>("missing", 9), 9);
    }

    #[test]
    fn test_ack_for_echoes_params() {
        let request = IpcMessage::command(MsgVal::Status).with_param("count", 12);
        let ack = IpcMessage::ack_for(&request).with_param("packets_received", 0);
        assert_eq!(ack.msg_type(), MsgType::Acknowledgement);
        assert_eq!(ack.msg_val(), &MsgVal::Status);
        assert_eq!(ack.get_param::<i64>("count").unwrap(), 12);
        assert!(ack.has_param("packets_received"));
    }
}
