//! Decoder placement properties over arbitrary input.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use frame_receiver::decoder::{DummyConfig, PacketizedConfig};
use frame_receiver::DecoderConfig;
use proptest::prelude::*;

proptest! {
    #[test]
    fn placement_stays_inside_frame(
        payload_size in 1usize..2048,
        packets_per_frame in 1u32..64,
        packet in proptest::collection::vec(any::<u8>(), 0..2200),
    ) {
        let decoder = DecoderConfig::Packetized(PacketizedConfig {
            payload_size,
            packets_per_frame,
            frame_timeout_ms: 100,
        })
        .build()
        .unwrap();

        if let Ok(placement) = decoder.identify_destination(&packet) {
            let payload = packet.len() - decoder.packet_header_size();
            prop_assert!(placement.buffer_offset + payload <= decoder.buffer_size_for_frame());
            prop_assert!(packet.len() <= decoder.max_packet_size());
        }
    }

    #[test]
    fn dummy_accepts_exactly_sized_packets(
        max_payload_size in 1usize..512,
        len in 0usize..600,
    ) {
        let decoder = DecoderConfig::Dummy(DummyConfig {
            max_payload_size,
            frame_timeout_ms: 100,
        })
        .build()
        .unwrap();
        let packet = vec![0u8; len];

        let accepted = decoder.identify_destination(&packet).is_ok();
        prop_assert_eq!(accepted, len >= 4 && len <= 4 + max_payload_size);
    }
}
