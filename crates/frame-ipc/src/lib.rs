//! Control-plane protocol for frame receivers.
//!
//! Two pieces:
//!
//! - [`IpcMessage`]: a typed envelope (`cmd` / `ack` / `notify`, an enumerated
//!   value, and named parameters) encoded as JSON.
//! - [`IpcChannel`]: ZeroMQ ROUTER/DEALER and PUB/SUB sockets over `tcp://`,
//!   `ipc://` or `inproc://` endpoints. One router binds an endpoint; any
//!   number of dealers connect to it, each under its own identity, and the
//!   router addresses replies by that identity.
//!
//! # Example
//!
//! ```
//! use frame_ipc::{ChannelType, IpcChannel, IpcMessage, MsgType, MsgVal};
//! use std::time::Duration;
//!
//! let mut router = IpcChannel::new(ChannelType::Router);
//! router.bind("inproc://doc_example")?;
//!
//! let mut dealer = IpcChannel::new(ChannelType::Dealer);
//! dealer.set_identity("rx-0")?;
//! dealer.connect("inproc://doc_example")?;
//!
//! let status = IpcMessage::command(MsgVal::Status).with_param("count", 3);
//! dealer.send_message(&status)?;
//!
//! let (identity, request) = router
//!     .recv_message_timeout(Duration::from_millis(100))?
//!     .expect("message queued");
//! assert_eq!(identity, "rx-0");
//! assert_eq!(request.msg_type(), MsgType::Command);
//! assert_eq!(request.get_param::<i64>("count")?, 3);
//! # Ok::<(), frame_ipc::IpcError>(())
//! ```

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{validate_endpoint, ChannelType, Envelope, IpcChannel, SUPPORTED_SCHEMES};
pub use error::{IpcError, IpcResult, ParamError};
pub use message::{IpcMessage, MsgType, MsgVal, ParamValue};
