use std::net::Ipv4Addr;

use crate::{PacketError, Result};

/// Minimum length of an IPv4 header without options.
pub const IPV4_HEADER_MIN: usize = 20;

/// Reads the 5-tuple-relevant fields out of a raw IPv4 packet.
///
/// Returns `(source, destination, protocol)`. The buffer is only
/// inspected at fixed offsets; nothing is copied.
pub fn parse_ipv4(buf: &[u8]) -> Result<(Ipv4Addr, Ipv4Addr, u8)> {
    if buf.len() < IPV4_HEADER_MIN {
        return Err(PacketError::TooShort { len: buf.len() });
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4 { version });
    }
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    Ok((src, dst, buf[9]))
}

/// Destination address of an IPv4 packet, for the egress fast path.
///
/// The TUN readers only need bytes 16..20; anything shorter than a
/// header is not routable and yields `None`.
pub fn ipv4_destination(buf: &[u8]) -> Option<Ipv4Addr> {
    if buf.len() < IPV4_HEADER_MIN {
        return None;
    }
    Some(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let mut pkt = vec![0u8; IPV4_HEADER_MIN];
        pkt[0] = 0x45; // version 4, IHL 5
        pkt[9] = 6; // TCP
        pkt[12..16].copy_from_slice(&[10, 8, 0, 2]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 5]);
        pkt
    }

    #[test]
    fn parses_minimal_header() {
        let (src, dst, proto) = parse_ipv4(&sample_packet()).unwrap();
        assert_eq!(src, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(proto, 6);
    }

    #[test]
    fn nineteen_bytes_is_too_short() {
        let pkt = sample_packet();
        assert_eq!(
            parse_ipv4(&pkt[..19]),
            Err(PacketError::TooShort { len: 19 })
        );
    }

    #[test]
    fn twenty_bytes_with_zero_payload_is_ok() {
        assert!(parse_ipv4(&sample_packet()).is_ok());
    }

    #[test]
    fn rejects_ipv6_version_nibble() {
        let mut pkt = sample_packet();
        pkt[0] = 0x60;
        assert_eq!(parse_ipv4(&pkt), Err(PacketError::NotIpv4 { version: 6 }));
    }

    #[test]
    fn destination_fast_path_matches_full_parse() {
        let pkt = sample_packet();
        let (_, dst, _) = parse_ipv4(&pkt).unwrap();
        assert_eq!(ipv4_destination(&pkt), Some(dst));
        assert_eq!(ipv4_destination(&pkt[..19]), None);
    }
}
