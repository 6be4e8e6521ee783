//! Flow key extraction from raw IP packets.
//!
//! Only the fields needed for hashing are read: version, header length,
//! protocol, source address and source port. Nothing is validated beyond
//! what is needed to find those fields, and the packet is never modified.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Packet parsing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    /// Non-first IPv4 fragment; no transport header present.
    #[error("non-initial fragment")]
    Fragment,

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    fn from_protocol(protocol: u8) -> Result<Self, PacketError> {
        match protocol {
            PROTO_TCP => Ok(Self::Tcp),
            PROTO_UDP => Ok(Self::Udp),
            other => Err(PacketError::UnsupportedProtocol(other)),
        }
    }

    fn min_header(self) -> usize {
        match self {
            Self::Tcp => TCP_MIN_HEADER,
            Self::Udp => UDP_HEADER,
        }
    }
}

/// Flow identity used for backend selection.
///
/// Hashing uses the `Display` form, `source_ip:source_port`
/// (`[v6]:port` for IPv6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: IpAddr,
    pub source_port: u16,
    pub transport: Transport,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&SocketAddr::new(self.source, self.source_port), f)
    }
}

/// Extract the flow key from an IPv4 or IPv6 packet.
pub fn flow_key(packet: &[u8]) -> Result<FlowKey, PacketError> {
    let first = *packet.first().ok_or(PacketError::Truncated)?;

    match first >> 4 {
        4 => ipv4_flow_key(packet),
        6 => ipv6_flow_key(packet),
        version => Err(PacketError::UnsupportedVersion(version)),
    }
}

fn ipv4_flow_key(packet: &[u8]) -> Result<FlowKey, PacketError> {
    if packet.len() < IPV4_MIN_HEADER {
        return Err(PacketError::Truncated);
    }

    let header_len = usize::from(packet[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER {
        return Err(PacketError::BadHeaderLength(header_len));
    }

    // fragment offset is the low 13 bits of bytes 6..8
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return Err(PacketError::Fragment);
    }

    let transport = Transport::from_protocol(packet[9])?;
    let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);

    let source_port = source_port(packet, header_len, transport)?;

    Ok(FlowKey {
        source: IpAddr::V4(source),
        source_port,
        transport,
    })
}

fn ipv6_flow_key(packet: &[u8]) -> Result<FlowKey, PacketError> {
    if packet.len() < IPV6_HEADER {
        return Err(PacketError::Truncated);
    }

    let transport = Transport::from_protocol(packet[6])?;

    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[8..24]);
    let source = Ipv6Addr::from(octets);

    let source_port = source_port(packet, IPV6_HEADER, transport)?;

    Ok(FlowKey {
        source: IpAddr::V6(source),
        source_port,
        transport,
    })
}

/// Read the transport source port at `offset`, requiring the full minimal
/// transport header.
fn source_port(packet: &[u8], offset: usize, transport: Transport) -> Result<u16, PacketError> {
    let header = packet
        .get(offset..offset + transport.min_header())
        .ok_or(PacketError::Truncated)?;
    Ok(u16::from_be_bytes([header[0], header[1]]))
}
