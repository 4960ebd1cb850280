//! # Frame Receiver
//!
//! Receives UDP packets from a detector, assembles them into frames inside a
//! shared buffer pool and hands completed frames to downstream consumers by
//! buffer ID, without copying.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ReceiverConfig`, loaded from TOML plus `FRAME_RX_`
//!   environment overrides with figment, and validated before use.
//! - **`controller`**: `FrameReceiverController`, the owning side of the
//!   control channel. It builds the pool, runs one receive thread, grants
//!   precharge requests, turns `frame_ready` notifications into events (and
//!   republishes them on a PUB socket) and relays other clients' commands.
//! - **`decoder`**: the `FrameDecoder` capability and its `dummy` and
//!   `packetized` variants, selected by `DecoderConfig`.
//! - **`error`**: `ReceiverError`, wrapping pool, IPC, decode and socket errors.
//! - **`rx_thread`**: the UDP receive thread, its state machine and counters.
//! - **`tracing_init`**: tracing-subscriber setup.
//!
//! The buffer pool lives in the `frame-pool` crate and the control envelope
//! and channel in `frame-ipc`; both are re-exported here.
//!
//! ## Example
//!
//! ```no_run
//! use frame_receiver::{FrameReceiverController, ReceiverConfig};
//! use std::time::Duration;
//!
//! let mut controller = FrameReceiverController::new(ReceiverConfig::default())?;
//! controller.start()?;
//! let events = controller.frame_ready_events();
//! loop {
//!     controller.service(Duration::from_millis(100))?;
//!     for frame in events.try_iter() {
//!         println!("frame {} in buffer {}", frame.frame, frame.handle.id());
//!         frame.handle.release()?;
//!     }
//! #   break;
//! }
//! controller.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod rx_thread;
pub mod tracing_init;

pub use config::ReceiverConfig;
pub use controller::{FrameReady, FrameReceiverController};
pub use decoder::{DecoderConfig, FrameDecoder, FrameId, PacketPlacement};
pub use error::{ReceiverError, ReceiverResult};
pub use rx_thread::{
    PacketSource, RxCounters, RxState, RxStatus, RxThread, RxThreadHandle, UdpSource,
};

pub use frame_ipc;
pub use frame_pool;
