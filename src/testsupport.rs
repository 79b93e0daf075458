//! Shared test helpers
//!
//! Hand-built Ethernet II / IPv4 / TCP frames for decoder and engine tests.

use std::net::Ipv4Addr;

/// Build a complete Ethernet II frame carrying one IPv4 TCP segment.
///
/// Checksums are left zero; the decoder does not verify them. `flags` uses
/// the wire bit layout (FIN 0x01, SYN 0x02, RST 0x04, PSH 0x08, ACK 0x10).
pub fn build_frame(
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let src: Ipv4Addr = src_ip.parse().expect("valid source ip");
    let dst: Ipv4Addr = dst_ip.parse().expect("valid destination ip");
    let total_len = (20 + 20 + payload.len()) as u16;

    let mut frame = Vec::with_capacity(14 + usize::from(total_len));

    // Ethernet II: dst MAC, src MAC, EtherType IPv4.
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x08, 0x00]);

    // IPv4 header, no options.
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // identification
    frame.extend_from_slice(&[0, 0]); // flags + fragment offset
    frame.push(64); // ttl
    frame.push(6); // protocol: TCP
    frame.extend_from_slice(&[0, 0]); // header checksum
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());

    // TCP header, no options.
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // acknowledgment
    frame.push(0x50); // data offset: 5 words
    frame.push(flags);
    frame.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    frame.extend_from_slice(&[0, 0]); // checksum
    frame.extend_from_slice(&[0, 0]); // urgent pointer

    frame.extend_from_slice(payload);
    frame
}
