//! Multi-packet reference decoder.
//!
//! ```text
//! offset 0   frame number  (u32 LE)
//! offset 4   packet number (u32 LE), 0-based within the frame
//! offset 8   flags         (u32 LE), bit 31 start of frame, bit 30 end of frame
//! offset 12  payload, at most `payload_size` bytes
//! ```
//!
//! Packet `n` lands at `n * payload_size`. A packet flagged end-of-frame
//! completes the frame; so does receiving `packets_per_frame` packets.
//! A repeated packet number overwrites the earlier payload.

use super::{DecodeError, FrameDecoder, PacketPlacement};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HEADER_SIZE: usize = 12;

/// Header flag marking the first packet of a frame.
pub const FLAG_START_OF_FRAME: u32 = 1 << 31;

/// Header flag marking the last packet of a frame.
pub const FLAG_END_OF_FRAME: u32 = 1 << 30;

/// Geometry for [`PacketizedDecoder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketizedConfig {
    /// Payload bytes per full packet.
    pub payload_size: usize,
    /// Packets in one frame.
    pub packets_per_frame: u32,
    /// Time a partial frame may stay in flight before force-completion.
    pub frame_timeout_ms: u64,
}

impl Default for PacketizedConfig {
    fn default() -> Self {
        Self {
            payload_size: 8000,
            packets_per_frame: 64,
            frame_timeout_ms: 1000,
        }
    }
}

/// Fixed-size packets assembled by packet number.
#[derive(Debug, Clone)]
pub struct PacketizedDecoder {
    config: PacketizedConfig,
    frame_size: usize,
}

impl PacketizedDecoder {
    /// Create a decoder, rejecting empty or overflowing geometry.
    pub fn new(config: PacketizedConfig) -> Result<Self, DecodeError> {
        if config.payload_size == 0 || config.packets_per_frame == 0 {
            return Err(DecodeError::InvalidGeometry(format!(
                "payload_size ({}) and packets_per_frame ({}) must be > 0",
                config.payload_size, config.packets_per_frame
            )));
        }
        let frame_size = usize::try_from(config.packets_per_frame)
            .ok()
            .and_then(|n| n.checked_mul(config.payload_size))
            .ok_or_else(|| {
                DecodeError::InvalidGeometry(format!(
                    "{} packets of {} bytes overflow the address space",
                    config.packets_per_frame, config.payload_size
                ))
            })?;
        Ok(Self { config, frame_size })
    }

    /// Build a packet header.
    pub fn encode_header(frame: u32, packet: u32, flags: u32) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&frame.to_le_bytes());
        header[4..8].copy_from_slice(&packet.to_le_bytes());
        header[8..12].copy_from_slice(&flags.to_le_bytes());
        header
    }

    /// Build a complete packet, setting start/end flags from its position.
    pub fn encode_packet(&self, frame: u32, packet: u32, payload: &[u8]) -> Vec<u8> {
        let mut flags = 0;
        if packet == 0 {
            flags |= FLAG_START_OF_FRAME;
        }
        if packet == self.config.packets_per_frame - 1 {
            flags |= FLAG_END_OF_FRAME;
        }
        let mut bytes = Self::encode_header(frame, packet, flags).to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl FrameDecoder for PacketizedDecoder {
    fn name(&self) -> &'static str {
        "packetized"
    }

    fn packet_header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn buffer_size_for_frame(&self) -> usize {
        self.frame_size
    }

    fn max_packet_size(&self) -> usize {
        HEADER_SIZE + self.config.payload_size
    }

    fn identify_destination(&self, packet: &[u8]) -> Result<PacketPlacement, DecodeError> {
        if packet.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                len: packet.len(),
                header: HEADER_SIZE,
            });
        }
        if packet.len() > self.max_packet_size() {
            return Err(DecodeError::Oversized {
                len: packet.len(),
                max: self.max_packet_size(),
            });
        }

        let frame = read_u32(packet, 0);
        let packet_number = read_u32(packet, 4);
        let flags = read_u32(packet, 8);

        if packet_number >= self.config.packets_per_frame {
            return Err(DecodeError::PacketOutOfRange {
                packet: packet_number,
                packets_per_frame: self.config.packets_per_frame,
            });
        }

        // packet_number < packets_per_frame, and packets_per_frame * payload_size fits
        let buffer_offset = packet_number as usize * self.config.payload_size;

        Ok(PacketPlacement {
            frame_id: u64::from(frame),
            buffer_offset,
            is_final: flags & FLAG_END_OF_FRAME != 0,
        })
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.config.frame_timeout_ms)
    }

    fn expected_packets_per_frame(&self) -> Option<u32> {
        Some(self.config.packets_per_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> PacketizedDecoder {
        PacketizedDecoder::new(PacketizedConfig {
            payload_size: 16,
            packets_per_frame: 4,
            frame_timeout_ms: 50,
        })
        .unwrap()
    }

    #[test]
    fn test_offsets_follow_packet_number() {
        let d = decoder();
        for n in 0..4 {
            let placement = d.identify_destination(&d.encode_packet(9, n, &[0; 16])).unwrap();
            assert_eq!(placement.frame_id, 9);
            assert_eq!(placement.buffer_offset, n as usize * 16);
            assert_eq!(placement.is_final, n == 3);
        }
    }

    #[test]
    fn test_end_flag_completes_early() {
        let d = decoder();
        let mut packet = PacketizedDecoder::encode_header(1, 1, FLAG_END_OF_FRAME).to_vec();
        packet.extend_from_slice(&[7; 4]);
        let placement = d.identify_destination(&packet).unwrap();
        assert!(placement.is_final);
        assert_eq!(placement.buffer_offset, 16);
    }

    #[test]
    fn test_out_of_range_packet_is_malformed() {
        let d = decoder();
        assert_eq!(
            d.identify_destination(&PacketizedDecoder::encode_header(1, 4, 0)),
            Err(DecodeError::PacketOutOfRange {
                packet: 4,
                packets_per_frame: 4,
            })
        );
    }

    #[test]
    fn test_truncated_and_oversized() {
        let d = decoder();
        assert!(matches!(
            d.identify_destination(&[0; 11]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            d.identify_destination(&d.encode_packet(0, 0, &[0; 17])),
            Err(DecodeError::Oversized { .. })
        ));
    }

    #[test]
    fn test_geometry() {
        let d = decoder();
        assert_eq!(d.buffer_size_for_frame(), 64);
        assert_eq!(d.max_packet_size(), 28);
        assert_eq!(d.expected_packets_per_frame(), Some(4));
        assert_eq!(d.frame_timeout(), Duration::from_millis(50));
        assert!(PacketizedDecoder::new(PacketizedConfig {
            packets_per_frame: 0,
            ..Default::default()
        })
        .is_err());
    }
}
