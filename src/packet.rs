//! L2-L4 header decoders for sampled packet headers.
//!
//! All functions are pure slice readers: they take a byte buffer and return
//! a structured view plus the number of bytes consumed, or a [`DecodeError`].
//! No I/O, no allocation beyond the return value.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_DOT1Q: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
/// IEEE 802.3 slow protocols (LACP et al).
pub const ETHERTYPE_LACP: u16 = 0x8809;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const ETHERNET_HEADER_LEN: usize = 14;
const DOT1Q_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const L4_PORTS_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("unsupported EtherType 0x{0:04x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported {what} version {version}")]
    BadVersion { what: &'static str, version: u32 },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

fn need(what: &'static str, need_len: usize, buf: &[u8]) -> Result<(), DecodeError> {
    if buf.len() < need_len {
        return Err(DecodeError::Truncated {
            what,
            need: need_len,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Ethernet header reduced to its effective EtherType: 802.1Q tags are
/// stripped in a loop and the innermost EtherType is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame {
    pub ether_type: u16,
}

pub fn decode_ethernet(data: &[u8]) -> Result<(EthernetFrame, usize), DecodeError> {
    need("Ethernet header", ETHERNET_HEADER_LEN, data)?;

    let mut ether_type = u16::from_be_bytes([data[12], data[13]]);
    let mut consumed = ETHERNET_HEADER_LEN;

    while ether_type == ETHERTYPE_DOT1Q {
        need("802.1Q tag", consumed + DOT1Q_TAG_LEN, data)?;
        ether_type = u16::from_be_bytes([data[consumed + 2], data[consumed + 3]]);
        consumed += DOT1Q_TAG_LEN;
    }

    Ok((EthernetFrame { ether_type }, consumed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
}

pub fn decode_ipv4(data: &[u8]) -> Result<(Ipv4Header, usize), DecodeError> {
    need("IPv4 header", IPV4_MIN_HEADER_LEN, data)?;
    if data[0] >> 4 != 4 {
        return Err(DecodeError::BadVersion {
            what: "IPv4",
            version: u32::from(data[0] >> 4),
        });
    }

    let ihl = usize::from(data[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::Malformed("IPv4 IHL"));
    }
    need("IPv4 options", ihl, data)?;

    Ok((
        Ipv4Header {
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            protocol: data[9],
        },
        ihl,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
}

pub fn decode_ipv6(data: &[u8]) -> Result<(Ipv6Header, usize), DecodeError> {
    need("IPv6 header", IPV6_HEADER_LEN, data)?;
    if data[0] >> 4 != 6 {
        return Err(DecodeError::BadVersion {
            what: "IPv6",
            version: u32::from(data[0] >> 4),
        });
    }

    let mut src = [0_u8; 16];
    let mut dst = [0_u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    Ok((
        Ipv6Header {
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
            next_header: data[6],
        },
        IPV6_HEADER_LEN,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L4Ports {
    pub src_port: u16,
    pub dst_port: u16,
}

pub fn decode_tcp(data: &[u8]) -> Result<(L4Ports, usize), DecodeError> {
    need("TCP header", L4_PORTS_LEN, data)?;
    Ok((ports(data), L4_PORTS_LEN))
}

pub fn decode_udp(data: &[u8]) -> Result<(L4Ports, usize), DecodeError> {
    need("UDP header", L4_PORTS_LEN, data)?;
    Ok((ports(data), L4_PORTS_LEN))
}

fn ports(data: &[u8]) -> L4Ports {
    L4Ports {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
    }
}

/// L3/L4 view of one sampled Ethernet frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledFrame {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Walk an Ethernet frame down to addresses, protocol and ports.
///
/// Returns `Ok(None)` for EtherTypes that are expected but uninteresting
/// (ARP, LACP); unknown EtherTypes are an error so the caller can log them
/// before dropping the sample. Ports stay zero for anything but TCP/UDP.
pub fn decode_sampled_frame(data: &[u8]) -> Result<Option<SampledFrame>, DecodeError> {
    let (frame, consumed) = decode_ethernet(data)?;

    let (src_addr, dst_addr, protocol, l4) = match frame.ether_type {
        ETHERTYPE_IPV4 => {
            let (ip, ip_len) = decode_ipv4(&data[consumed..])?;
            (
                IpAddr::V4(ip.src),
                IpAddr::V4(ip.dst),
                ip.protocol,
                &data[consumed + ip_len..],
            )
        }
        ETHERTYPE_IPV6 => {
            let (ip, ip_len) = decode_ipv6(&data[consumed..])?;
            (
                IpAddr::V6(ip.src),
                IpAddr::V6(ip.dst),
                ip.next_header,
                &data[consumed + ip_len..],
            )
        }
        ETHERTYPE_ARP | ETHERTYPE_LACP => return Ok(None),
        other => return Err(DecodeError::UnsupportedEtherType(other)),
    };

    let (src_port, dst_port) = match protocol {
        PROTO_TCP => {
            let (p, _) = decode_tcp(l4)?;
            (p.src_port, p.dst_port)
        }
        PROTO_UDP => {
            let (p, _) = decode_udp(l4)?;
            (p.src_port, p.dst_port)
        }
        _ => (0, 0),
    };

    Ok(Some(SampledFrame {
        src_addr,
        dst_addr,
        protocol,
        src_port,
        dst_port,
    }))
}
