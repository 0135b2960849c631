/// Outcome of inspecting a packet for a TLS server name.
///
/// `Bypass` means the packet is not something the SNI check applies to
/// (non-TCP, non-TLS, or truncated before the extensions block); rules
/// scoped to an SNI treat it as "no constraint to fail on" so that
/// plain traffic to the same host is not spuriously blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniVerdict {
    /// ClientHello carries exactly the expected server name.
    Match,
    /// ClientHello carries a different server name.
    Unmatch,
    /// ClientHello parsed but has no server-name extension.
    NotFound,
    /// Not a TLS ClientHello, or malformed before the name could be read.
    Bypass,
}

#[inline]
fn be16(buf: &[u8], at: usize) -> usize {
    u16::from_be_bytes([buf[at], buf[at + 1]]) as usize
}

/// Walks a raw IPv4/TCP packet looking for a TLS ClientHello and compares
/// its server name against `expected_host`.
///
/// The comparison is byte-exact and case-sensitive. Every bounds check
/// failure collapses to [`SniVerdict::Bypass`]; the walk never reads past
/// the slice.
pub fn match_sni(packet: &[u8], expected_host: &str) -> SniVerdict {
    if packet.len() < 40 {
        return SniVerdict::Bypass;
    }

    // TCP only (IPv4 protocol field).
    if packet[9] != 6 {
        return SniVerdict::Bypass;
    }

    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < 20 || packet.len() < ihl + 20 {
        return SniVerdict::Bypass;
    }

    let tcp = &packet[ihl..];
    let data_offset = usize::from(tcp[12] >> 4) * 4;
    if tcp.len() < data_offset {
        return SniVerdict::Bypass;
    }

    // TLS record layer: handshake (0x16), major version 3.
    let payload = &tcp[data_offset..];
    if payload.len() < 5 {
        return SniVerdict::Bypass;
    }
    if payload[0] != 0x16 || payload[1] != 0x03 {
        return SniVerdict::Bypass;
    }

    // Handshake type ClientHello (0x01) right after the record header.
    if payload.len() < 9 || payload[5] != 0x01 {
        return SniVerdict::Bypass;
    }

    // Past the handshake header, then protocol version (2) + random (32).
    let mut cursor = 9usize;
    cursor += 34;
    if cursor >= payload.len() {
        return SniVerdict::Bypass;
    }

    // Session id.
    let session_id_len = usize::from(payload[cursor]);
    cursor += 1 + session_id_len;
    if cursor >= payload.len() {
        return SniVerdict::Bypass;
    }

    // Cipher suites.
    if cursor + 2 > payload.len() {
        return SniVerdict::Bypass;
    }
    let cipher_len = be16(payload, cursor);
    cursor += 2 + cipher_len;
    if cursor >= payload.len() {
        return SniVerdict::Bypass;
    }

    // Compression methods.
    if cursor + 1 > payload.len() {
        return SniVerdict::Bypass;
    }
    let comp_len = usize::from(payload[cursor]);
    cursor += 1 + comp_len;
    if cursor >= payload.len() {
        return SniVerdict::Bypass;
    }

    // Extensions block.
    if cursor + 2 > payload.len() {
        return SniVerdict::Bypass;
    }
    let ext_block_len = be16(payload, cursor);
    cursor += 2;
    let end_of_ext = (cursor + ext_block_len).min(payload.len());

    while cursor < end_of_ext {
        if cursor + 4 > end_of_ext {
            break;
        }
        let ext_type = be16(payload, cursor);
        let ext_len = be16(payload, cursor + 2);
        cursor += 4;

        if ext_type == 0x0000 {
            // server_name: skip list length (2) and name type (1).
            if cursor + 5 > end_of_ext {
                break;
            }
            let name_len = be16(payload, cursor + 3);
            let start = cursor + 5;
            let end = start + name_len;
            if end <= end_of_ext && &payload[start..end] == expected_host.as_bytes() {
                return SniVerdict::Match;
            }
            return SniVerdict::Unmatch;
        }
        cursor += ext_len;
    }

    SniVerdict::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_hello_packet, plain_tcp_packet, udp_packet};

    #[test]
    fn matches_exact_server_name() {
        let pkt = client_hello_packet("example.com");
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::Match);
    }

    #[test]
    fn server_name_comparison_is_case_sensitive() {
        // Byte-exact on purpose; changing this needs product sign-off.
        let pkt = client_hello_packet("Example.com");
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::Unmatch);
    }

    #[test]
    fn different_server_name_unmatches() {
        let pkt = client_hello_packet("evil.com");
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::Unmatch);
    }

    #[test]
    fn hello_without_sni_extension_is_not_found() {
        let pkt = crate::testutil::client_hello_packet_no_sni();
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::NotFound);
    }

    #[test]
    fn plain_tcp_bypasses() {
        let pkt = plain_tcp_packet(64);
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::Bypass);
    }

    #[test]
    fn udp_bypasses() {
        let pkt = udp_packet(64);
        assert_eq!(match_sni(&pkt, "example.com"), SniVerdict::Bypass);
    }

    #[test]
    fn short_packet_bypasses() {
        assert_eq!(match_sni(&[0u8; 39], "example.com"), SniVerdict::Bypass);
    }

    #[test]
    fn truncation_before_extensions_bypasses() {
        let pkt = client_hello_packet("example.com");
        // IP (20) + TCP (20) + record (5) + handshake header (4) +
        // version (2) + random (32) lands inside the fixed prefix; every
        // cut before the extensions block must bypass.
        for len in 40..=40 + 5 + 4 + 2 + 32 {
            assert_eq!(
                match_sni(&pkt[..len], "example.com"),
                SniVerdict::Bypass,
                "truncated to {len}"
            );
        }
    }

    #[test]
    fn truncation_never_produces_a_match() {
        let pkt = client_hello_packet("example.com");
        for len in 0..pkt.len() {
            assert_ne!(
                match_sni(&pkt[..len], "example.com"),
                SniVerdict::Match,
                "truncated to {len}"
            );
        }
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::testutil::client_hello_packet;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Arbitrary byte soup must never panic and never match.
        #[test]
        fn prop_garbage_never_matches(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_ne!(match_sni(&data, "example.com"), SniVerdict::Match);
        }

        /// Any truncation of a valid hello is rejected without reading
        /// past the slice (a panic would fail the test).
        #[test]
        fn prop_truncated_hello_never_matches(
            host in "[a-z]{3,12}\\.[a-z]{2,4}",
            cut in 0usize..200
        ) {
            let pkt = client_hello_packet(&host);
            let cut = cut.min(pkt.len().saturating_sub(1));
            prop_assert_ne!(match_sni(&pkt[..cut], &host), SniVerdict::Match);
        }

        /// The full hello always matches its own host.
        #[test]
        fn prop_full_hello_matches(host in "[a-z]{3,12}\\.[a-z]{2,4}") {
            let pkt = client_hello_packet(&host);
            prop_assert_eq!(match_sni(&pkt, &host), SniVerdict::Match);
        }
    }
}
