//! Single-packet test decoder.
//!
//! Layout: a 4-byte little-endian frame number followed by the payload. Every
//! packet is a complete frame and its payload lands at offset 0.

use super::{DecodeError, FrameDecoder, PacketPlacement};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HEADER_SIZE: usize = 4;

/// Geometry for [`DummyDecoder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyConfig {
    /// Largest payload accepted; also the frame buffer size.
    pub max_payload_size: usize,
    /// Frame timeout. Frames complete on arrival, so this only bounds
    /// pathological cases.
    pub frame_timeout_ms: u64,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 8192,
            frame_timeout_ms: 1000,
        }
    }
}

/// One packet is one frame.
#[derive(Debug, Clone)]
pub struct DummyDecoder {
    config: DummyConfig,
}

impl DummyDecoder {
    /// Create a decoder, rejecting a zero payload size.
    pub fn new(config: DummyConfig) -> Result<Self, DecodeError> {
        if config.max_payload_size == 0 {
            return Err(DecodeError::InvalidGeometry(
                "max_payload_size must be > 0".to_string(),
            ));
        }
        Ok(Self { config })
    }

    /// Build a packet for `frame` carrying `payload`.
    pub fn encode_packet(frame: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
        packet.extend_from_slice(&frame.to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

impl FrameDecoder for DummyDecoder {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn packet_header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn buffer_size_for_frame(&self) -> usize {
        self.config.max_payload_size
    }

    fn max_packet_size(&self) -> usize {
        HEADER_SIZE + self.config.max_payload_size
    }

    fn identify_destination(&self, packet: &[u8]) -> Result<PacketPlacement, DecodeError> {
        let Some(header) = packet.get(..HEADER_SIZE) else {
            return Err(DecodeError::Truncated {
                len: packet.len(),
                header: HEADER_SIZE,
            });
        };
        if packet.len() > self.max_packet_size() {
            return Err(DecodeError::Oversized {
                len: packet.len(),
                max: self.max_packet_size(),
            });
        }
        let frame = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        Ok(PacketPlacement {
            frame_id: u64::from(frame),
            buffer_offset: 0,
            is_final: true,
        })
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.config.frame_timeout_ms)
    }

    fn expected_packets_per_frame(&self) -> Option<u32> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_packet_is_a_frame() {
        let decoder = DummyDecoder::new(DummyConfig::default()).unwrap();
        let placement = decoder
            .identify_destination(&DummyDecoder::encode_packet(42, b"payload"))
            .unwrap();
        assert_eq!(
            placement,
            PacketPlacement {
                frame_id: 42,
                buffer_offset: 0,
                is_final: true,
            }
        );
    }

    #[test]
    fn test_header_only_packet_is_valid() {
        let decoder = DummyDecoder::new(DummyConfig::default()).unwrap();
        assert!(decoder.identify_destination(&[1, 0, 0, 0]).is_ok());
    }

    #[test]
    fn test_rejects_short_and_long_packets() {
        let decoder = DummyDecoder::new(DummyConfig {
            max_payload_size: 8,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            decoder.identify_destination(&[1, 2]),
            Err(DecodeError::Truncated { len: 2, header: 4 })
        );
        assert!(matches!(
            decoder.identify_destination(&DummyDecoder::encode_packet(0, &[0; 9])),
            Err(DecodeError::Oversized { len: 13, max: 12 })
        ));
    }

    #[test]
    fn test_zero_payload_rejected() {
        assert!(DummyDecoder::new(DummyConfig {
            max_payload_size: 0,
            ..Default::default()
        })
        .is_err());
    }
}
