#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

//! Wire-format properties of the control envelope.

use frame_ipc::{IpcError, IpcMessage, MsgType, MsgVal};
use proptest::prelude::*;

fn msg_val_strategy() -> impl Strategy<Value = MsgVal> {
    prop_oneof![
        Just(MsgVal::Identity),
        Just(MsgVal::BufferPrechargeRequest),
        Just(MsgVal::Status),
        Just(MsgVal::FrameReady),
        Just(MsgVal::Stop),
        Just(MsgVal::ResetStatistics),
        Just(MsgVal::Configure),
        "[a-z_]{1,16}".prop_map(|s| MsgVal::from(s.as_str())),
    ]
}

fn msg_type_strategy() -> impl Strategy<Value = MsgType> {
    prop_oneof![
        Just(MsgType::Command),
        Just(MsgType::Acknowledgement),
        Just(MsgType::Notification),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        match IpcMessage::decode(&bytes) {
            Ok(_) | Err(IpcError::Json(_)) => {}
            Err(other) => prop_assert!(false, "unexpected error kind: {other}"),
        }
    }

    #[test]
    fn params_survive_the_wire(
        msg_type in msg_type_strategy(),
        msg_val in msg_val_strategy(),
        frame in any::<u64>(),
        offset in any::<i32>(),
        complete in any::<bool>(),
        note in "\\PC{0,32}",
    ) {
        let msg = IpcMessage::new(msg_type, msg_val.clone())
            .with_param("frame", frame)
            .with_param("offset", offset)
            .with_param("complete", complete)
            .with_param("note", note.clone());

        let decoded = IpcMessage::decode(msg.encode().unwrap().as_bytes()).unwrap();
        prop_assert_eq!(decoded.msg_type(), msg_type);
        prop_assert_eq!(decoded.msg_val(), &msg_val);
        prop_assert_eq!(decoded.get_param::<u64>("frame").unwrap(), frame);
        prop_assert_eq!(decoded.get_param::<i32>("offset").unwrap(), offset);
        prop_assert_eq!(decoded.get_param::<bool>("complete").unwrap(), complete);
        prop_assert_eq!(decoded.get_param::<String>("note").unwrap(), note);
        prop_assert_eq!(decoded.timestamp(), msg.timestamp());
    }
}
