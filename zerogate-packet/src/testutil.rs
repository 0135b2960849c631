//! Packet builders shared by this crate's tests and by dependants that
//! enable the `test-util` feature (the policy engine exercises the SNI
//! path against synthetic ClientHellos).

use std::net::Ipv4Addr;

fn ipv4_header(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut hdr = vec![0u8; 20];
    hdr[0] = 0x45;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    hdr
}

fn tcp_header() -> Vec<u8> {
    let mut hdr = vec![0u8; 20];
    hdr[12] = 0x50; // data offset 5 words
    hdr
}

fn client_hello_body(server_name: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    match server_name {
        Some(name) => {
            let name = name.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&[0x00, 0x00]); // server_name
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00); // host_name
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        None => {
            // supported_versions, so the extension loop has something to skip
            extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
        }
    }

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client version
    hello.extend_from_slice(&[0xaa; 32]); // random
    hello.push(0); // session id
    hello.extend_from_slice(&2u16.to_be_bytes());
    hello.extend_from_slice(&[0x13, 0x01]); // one cipher suite
    hello.push(1); // compression methods
    hello.push(0x00);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    let len = hello.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

fn wrap_tcp(dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut pkt = ipv4_header(6, Ipv4Addr::new(10, 8, 0, 2), dst);
    pkt.extend_from_slice(&tcp_header());
    pkt.extend_from_slice(payload);
    pkt
}

/// TCP/TLS ClientHello to 1.2.3.4 carrying `server_name`.
pub fn client_hello_packet(server_name: &str) -> Vec<u8> {
    client_hello_packet_to(Ipv4Addr::new(1, 2, 3, 4), server_name)
}

/// TCP/TLS ClientHello to `dst` carrying `server_name`.
pub fn client_hello_packet_to(dst: Ipv4Addr, server_name: &str) -> Vec<u8> {
    wrap_tcp(dst, &client_hello_body(Some(server_name)))
}

/// A ClientHello whose extension list has no server_name entry.
pub fn client_hello_packet_no_sni() -> Vec<u8> {
    wrap_tcp(Ipv4Addr::new(1, 2, 3, 4), &client_hello_body(None))
}

/// TCP packet with an opaque (non-TLS) payload, `payload_len` bytes.
pub fn plain_tcp_packet(payload_len: usize) -> Vec<u8> {
    wrap_tcp(Ipv4Addr::new(1, 2, 3, 4), &vec![0u8; payload_len])
}

/// TCP packet with an opaque payload addressed to `dst`.
pub fn plain_tcp_packet_to(dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    wrap_tcp(dst, &vec![0u8; payload_len])
}

/// UDP packet, padded so it clears the 40-byte inspection floor.
pub fn udp_packet(payload_len: usize) -> Vec<u8> {
    let mut pkt = ipv4_header(17, Ipv4Addr::new(10, 8, 0, 2), Ipv4Addr::new(1, 2, 3, 4));
    pkt.extend_from_slice(&vec![0u8; 8 + payload_len]);
    pkt
}

/// ICMP echo-shaped packet addressed to `dst`.
pub fn icmp_packet_to(dst: Ipv4Addr) -> Vec<u8> {
    let mut pkt = ipv4_header(1, Ipv4Addr::new(10, 8, 0, 2), dst);
    pkt.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);
    pkt.extend_from_slice(&[0u8; 32]);
    pkt
}
