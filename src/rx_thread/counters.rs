//! Receive statistics reported in status acknowledgements.

use frame_ipc::IpcMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Counters owned by the receive thread.
///
/// Serialised field by field into the parameters of every `status`
/// acknowledgement, so the field names are part of the control protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxCounters {
    /// Datagrams read from the socket.
    pub packets_received: u64,
    /// Datagrams the decoder rejected or that fell outside their buffer.
    pub packets_malformed: u64,
    /// Datagrams discarded because their frame had no buffer.
    pub packets_lost: u64,
    /// Datagrams for a frame that had already been completed.
    pub packets_late: u64,
    /// Frames published, complete or not.
    pub frames_completed: u64,
    /// Frames force-completed by timeout or drain.
    pub frames_timed_out: u64,
    /// Frames discarded because the pool was exhausted.
    pub frames_dropped: u64,
    /// Frames currently being assembled.
    pub frames_in_flight: u64,
    /// Empty buffers held in reserve.
    pub empty_buffers: u64,
    /// Precharge requests sent to the owner.
    pub precharge_requests: u64,
}

impl RxCounters {
    /// Zero the statistics. Gauges (`frames_in_flight`, `empty_buffers`)
    /// describe current state and are kept.
    pub fn reset(&mut self) {
        *self = Self {
            frames_in_flight: self.frames_in_flight,
            empty_buffers: self.empty_buffers,
            ..Self::default()
        };
    }

    /// Add every counter to `msg` as a parameter.
    pub fn write_params(&self, msg: &mut IpcMessage) {
        if let Ok(Value::Object(fields)) = serde_json::to_value(self) {
            for (name, value) in fields {
                msg.set_param(name, value);
            }
        }
    }
}

/// Receive thread status as reported over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxStatus {
    /// Identity of the reporting thread.
    pub identity: String,
    /// Lifecycle state name.
    pub state: String,
    /// Statistics.
    #[serde(flatten)]
    pub counters: RxCounters,
}

impl RxStatus {
    /// Parse a `status` acknowledgement.
    pub fn from_message(msg: &IpcMessage) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(msg.params().clone()))
    }

    /// Parameters as a JSON map (for logging or re-publishing).
    pub fn to_params(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_ipc::MsgVal;

    #[test]
    fn test_counters_become_params() {
        let counters = RxCounters {
            packets_received: 10,
            frames_completed: 3,
            ..Default::default()
        };
        let mut ack = IpcMessage::ack(MsgVal::Status).with_param("count", 7);
        counters.write_params(&mut ack);

        assert_eq!(ack.get_param::<u64>("packets_received").unwrap(), 10);
        assert_eq!(ack.get_param::<u64>("frames_completed").unwrap(), 3);
        assert_eq!(ack.get_param::<u64>("packets_lost").unwrap(), 0);
        assert_eq!(ack.get_param::<i64>("count").unwrap(), 7);
    }

    #[test]
    fn test_status_parses_ack() {
        let counters = RxCounters {
            packets_malformed: 2,
            empty_buffers: 4,
            ..Default::default()
        };
        let mut ack = IpcMessage::ack(MsgVal::Status)
            .with_param("identity", "rx-1")
            .with_param("state", "idle")
            .with_param("count", 1);
        counters.write_params(&mut ack);

        let status = RxStatus::from_message(&ack).unwrap();
        assert_eq!(status.identity, "rx-1");
        assert_eq!(status.state, "idle");
        assert_eq!(status.counters, counters);
        assert_eq!(status.to_params()["packets_malformed"], 2);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let mut counters = RxCounters {
            packets_received: 5,
            frames_in_flight: 2,
            empty_buffers: 3,
            ..Default::default()
        };
        counters.reset();
        assert_eq!(counters.packets_received, 0);
        assert_eq!(counters.frames_in_flight, 2);
        assert_eq!(counters.empty_buffers, 3);
    }
}
