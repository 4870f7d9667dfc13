#![cfg(not(target_arch = "wasm32"))]

use core::net::{Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;
use tunnel_packetlib::checksum::{self, PseudoHeader};
use tunnel_packetlib::{Ipv4Header, Ipv6Header, TcpFlags, TcpHeader, TcpSegmentBuilder, UdpHeader};

/// Option bytes padded to whole 32-bit words, at most `max_words` of them.
fn word_aligned(max_words: usize) -> impl Strategy<Value = Vec<u8>> {
    (0..=max_words).prop_flat_map(|words| proptest::collection::vec(any::<u8>(), words * 4))
}

fn ipv4_headers() -> impl Strategy<Value = Ipv4Header> {
    (
        any::<u8>(),
        any::<u32>(),
        any::<u8>(),
        any::<u8>(),
        any::<u16>(),
        any::<[u8; 4]>(),
        any::<[u8; 4]>(),
        word_aligned(10),
        0usize..=64,
    )
        .prop_map(|(tos, id, ttl, protocol, csum, src, dst, options, payload)| Ipv4Header {
            type_of_service: tos,
            total_len: (20 + options.len() + payload) as u16,
            identification_flags_fragment: id,
            ttl,
            protocol,
            header_checksum: csum,
            source: Ipv4Addr::from(src),
            destination: Ipv4Addr::from(dst),
            options,
        })
}

fn ipv6_headers() -> impl Strategy<Value = Ipv6Header> {
    (
        any::<u8>(),
        0u32..=0x000f_ffff,
        0u16..=64,
        any::<u8>(),
        any::<u8>(),
        any::<[u8; 16]>(),
        any::<[u8; 16]>(),
    )
        .prop_map(|(tc, flow_label, payload_len, next_header, hop_limit, src, dst)| Ipv6Header {
            traffic_class: tc,
            flow_label,
            payload_len,
            next_header,
            hop_limit,
            source: Ipv6Addr::from(src),
            destination: Ipv6Addr::from(dst),
        })
}

fn tcp_headers() -> impl Strategy<Value = TcpHeader> {
    (
        any::<u16>(),
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
        0u8..=0x3f,
        any::<u16>(),
        any::<u16>(),
        any::<u16>(),
        word_aligned(10),
    )
        .prop_map(|(sport, dport, seq, ack, flags, window, csum, urg, options)| TcpHeader {
            source_port: sport,
            destination_port: dport,
            sequence_number: seq,
            acknowledgment_number: ack,
            flags: TcpFlags(flags),
            window,
            checksum: csum,
            urgent_pointer: urg,
            options,
        })
}

fn udp_headers() -> impl Strategy<Value = UdpHeader> {
    (any::<u16>(), any::<u16>(), 8u16..=64, any::<u16>()).prop_map(|(sport, dport, length, csum)| UdpHeader {
        source_port: sport,
        destination_port: dport,
        length,
        checksum: csum,
    })
}

fn pseudo_headers() -> impl Strategy<Value = PseudoHeader> {
    prop_oneof![
        (any::<[u8; 4]>(), any::<[u8; 4]>()).prop_map(|(src, dst)| PseudoHeader::V4 {
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
        }),
        (any::<[u8; 16]>(), any::<[u8; 16]>()).prop_map(|(src, dst)| PseudoHeader::V6 {
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0x7C_9E_11),
        .. ProptestConfig::default()
    })]

    #[test]
    fn ipv4_header_survives_write_then_parse(header in ipv4_headers()) {
        let mut out = vec![0u8; header.total_len as usize];
        let len = header.write(&mut out).unwrap();
        prop_assert_eq!(len, header.header_len());
        prop_assert_eq!(Ipv4Header::parse(&out).unwrap(), header);
    }

    #[test]
    fn ipv4_filled_checksum_verifies(header in ipv4_headers()) {
        let mut out = vec![0u8; header.total_len as usize];
        let len = header.write(&mut out).unwrap();
        Ipv4Header::fill_checksum(&mut out, len).unwrap();
        prop_assert_eq!(checksum::internet_checksum(&out[..len]), 0);
    }

    #[test]
    fn ipv6_header_survives_write_then_parse(header in ipv6_headers()) {
        let mut out = vec![0u8; header.total_len()];
        prop_assert_eq!(header.write(&mut out).unwrap(), Ipv6Header::HEADER_LEN);
        prop_assert_eq!(Ipv6Header::parse(&out).unwrap(), header);
    }

    #[test]
    fn tcp_header_survives_write_then_parse(header in tcp_headers()) {
        let mut out = vec![0u8; TcpHeader::MAX_HEADER_LEN];
        let len = header.write(&mut out).unwrap();
        prop_assert_eq!(len, header.header_len());
        prop_assert_eq!(TcpHeader::parse(&out[..len]).unwrap(), header);
    }

    #[test]
    fn udp_header_survives_write_then_parse(header in udp_headers()) {
        let mut out = vec![0u8; header.length as usize];
        prop_assert_eq!(header.write(&mut out).unwrap(), UdpHeader::HEADER_LEN);
        prop_assert_eq!(UdpHeader::parse(&out).unwrap(), header);
    }

    /// Writing the checksum into a buffer makes the whole buffer sum to all ones, odd tail
    /// included.
    #[test]
    fn stored_checksum_makes_buffer_verify(mut data in proptest::collection::vec(any::<u8>(), 2..=1500)) {
        data[0] = 0;
        data[1] = 0;
        let csum = checksum::internet_checksum(&data);
        data[..2].copy_from_slice(&csum.to_be_bytes());
        prop_assert_eq!(checksum::fold(checksum::add_words(0, &data)), 0xffff);
        prop_assert_eq!(checksum::internet_checksum(&data), 0);
    }

    #[test]
    fn odd_tail_is_padded_with_zero(
        data in (0usize..=750).prop_flat_map(|n| proptest::collection::vec(any::<u8>(), 2 * n + 1)),
    ) {
        let mut padded = data.clone();
        padded.push(0);
        prop_assert_eq!(checksum::internet_checksum(&data), checksum::internet_checksum(&padded));
    }

    #[test]
    fn built_tcp_segment_verifies_under_its_pseudo_header(
        pseudo in pseudo_headers(),
        seq in any::<u32>(),
        ack in any::<u32>(),
        flags in 0u8..=0x3f,
        options in word_aligned(10),
        payload in proptest::collection::vec(any::<u8>(), 0..=512),
    ) {
        let header_len = 20 + options.len();
        let mut out = vec![0u8; header_len + payload.len()];
        out[header_len..].copy_from_slice(&payload);
        let len = TcpSegmentBuilder {
            src_port: 443,
            dst_port: 50000,
            seq_number: seq,
            ack_number: ack,
            flags: TcpFlags(flags),
            window_size: 65535,
            urgent_pointer: 0,
            options: &options,
        }
        .write(&pseudo, &mut out, payload.len())
        .unwrap();
        prop_assert_eq!(len, out.len());
        prop_assert_eq!(pseudo.checksum(6, &out), 0);

        let parsed = TcpHeader::parse(&out).unwrap();
        prop_assert_eq!(parsed.sequence_number, seq);
        prop_assert_eq!(parsed.acknowledgment_number, ack);
        prop_assert_eq!(parsed.flags, TcpFlags(flags));
        prop_assert_eq!(&out[parsed.header_len()..], &payload[..]);
    }
}
