//! Frame decoders: where each packet's payload belongs.
//!
//! A decoder inspects the header of every received datagram and answers three
//! questions: which frame it belongs to, where in the frame buffer its payload
//! goes, and whether it completes the frame. Decoders are pure with respect to
//! packets; all state (which frames are in flight, which buffers they use)
//! lives in the receive thread.
//!
//! Variants are a closed set selected by [`DecoderConfig`] and resolved once
//! with [`DecoderConfig::build`].

mod dummy;
mod packetized;

pub use dummy::{DummyConfig, DummyDecoder};
pub use packetized::{
    PacketizedConfig, PacketizedDecoder, FLAG_END_OF_FRAME, FLAG_START_OF_FRAME,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Frame numbers as reported by the source.
pub type FrameId = u64;

/// Where a packet's payload lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPlacement {
    /// Frame the packet belongs to.
    pub frame_id: FrameId,
    /// Byte offset of the payload within the frame buffer.
    pub buffer_offset: usize,
    /// The packet completes its frame.
    pub is_final: bool,
}

/// A packet the decoder cannot place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Datagram shorter than the packet header.
    #[error("packet of {len} bytes is shorter than the {header} byte header")]
    Truncated {
        /// Datagram length.
        len: usize,
        /// Header size.
        header: usize,
    },

    /// Datagram longer than any valid packet.
    #[error("packet of {len} bytes exceeds the {max} byte maximum")]
    Oversized {
        /// Datagram length.
        len: usize,
        /// Maximum packet size.
        max: usize,
    },

    /// Packet number outside the frame.
    #[error("packet {packet} is outside a {packets_per_frame} packet frame")]
    PacketOutOfRange {
        /// Packet number from the header.
        packet: u32,
        /// Packets per frame.
        packets_per_frame: u32,
    },

    /// Decoder configuration describes an empty or overflowing frame.
    #[error("invalid decoder geometry: {0}")]
    InvalidGeometry(String),
}

/// Packet placement contract implemented by each detector type.
pub trait FrameDecoder: Send {
    /// Short variant name used in logs and configuration replies.
    fn name(&self) -> &'static str;

    /// Bytes of header preceding the payload in every packet.
    fn packet_header_size(&self) -> usize;

    /// Buffer bytes needed to hold one complete frame.
    fn buffer_size_for_frame(&self) -> usize;

    /// Largest valid datagram, header included.
    fn max_packet_size(&self) -> usize;

    /// Locate a packet's payload. Must not mutate any shared state.
    fn identify_destination(&self, packet: &[u8]) -> Result<PacketPlacement, DecodeError>;

    /// How long a partially filled frame may stay in flight.
    fn frame_timeout(&self) -> Duration;

    /// Packets per complete frame, when the layout fixes it.
    fn expected_packets_per_frame(&self) -> Option<u32> {
        None
    }
}

/// Decoder selection, tagged by `kind` in configuration files.
///
/// ```toml
/// [decoder]
/// kind = "packetized"
/// payload_size = 8000
/// packets_per_frame = 64
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderConfig {
    /// One packet per frame; see [`DummyDecoder`].
    Dummy(DummyConfig),
    /// Fixed-size packets with a frame/packet/flags header; see [`PacketizedDecoder`].
    Packetized(PacketizedConfig),
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig::Dummy(DummyConfig::default())
    }
}

impl DecoderConfig {
    /// Construct the configured decoder.
    pub fn build(&self) -> Result<Box<dyn FrameDecoder>, DecodeError> {
        Ok(match self {
            DecoderConfig::Dummy(config) => Box::new(DummyDecoder::new(config.clone())?),
            DecoderConfig::Packetized(config) => {
                Box::new(PacketizedDecoder::new(config.clone())?)
            }
        })
    }
}
