//! Packet decoding module
//!
//! This module decodes captured Ethernet II frames into TCP segment records.

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use serde::Serialize;
use std::fmt;

/// One side of a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// IPv4 address in dotted-quad form.
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: String, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Directional endpoint pair of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FourTuple {
    pub src: Endpoint,
    pub dst: Endpoint,
}

/// A decoded TCP segment, the transient product of frame decoding.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub tuple: FourTuple,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Decode one captured frame into a TCP segment.
///
/// Returns `None` for anything that is not a well-formed Ethernet II /
/// IPv4 / TCP frame. Malformed frames are discarded without logging.
pub fn decode_frame(data: &[u8]) -> Option<TcpSegment> {
    let ethernet: EthernetPacket<'_> = EthernetPacket::new(data)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ipv4: Ipv4Packet<'_> = Ipv4Packet::new(ethernet.payload())?;
    if ipv4.get_version() != 4 {
        return None;
    }
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }

    let ip_header_len = usize::from(ipv4.get_header_length()) * 4;
    let ip_total_len = usize::from(ipv4.get_total_length());
    if ip_total_len < ip_header_len || ethernet.payload().len() < ip_total_len {
        return None;
    }

    let tcp: TcpPacket<'_> = TcpPacket::new(ipv4.payload())?;
    let tcp_header_len = usize::from(tcp.get_data_offset()) * 4;
    let tcp_total_len = ip_total_len - ip_header_len;
    if tcp_total_len < tcp_header_len {
        return None;
    }

    // Slice the payload by the IPv4 total length so Ethernet trailer padding
    // never reaches the stream.
    let payload_len = tcp_total_len - tcp_header_len;
    let payload = tcp.payload().get(..payload_len)?.to_vec();

    let flags = tcp.get_flags();
    Some(TcpSegment {
        tuple: FourTuple {
            src: Endpoint::new(ipv4.get_source().to_string(), tcp.get_source()),
            dst: Endpoint::new(ipv4.get_destination().to_string(), tcp.get_destination()),
        },
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
        syn: flags & 0x02 != 0,
        fin: flags & 0x01 != 0,
        rst: flags & 0x04 != 0,
        payload,
    })
}
