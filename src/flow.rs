//! The normalized flow record shared by the IPFIX and sFlow paths.

use ipnet::IpNet;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// One sampled flow, normalized from either wire protocol.
///
/// Exactly one address family per record; `src_addr` and `dst_addr` always
/// share it. Addresses are kept in network order as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub family: AddressFamily,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_pfx: Option<IpNet>,
    pub dst_pfx: Option<IpNet>,
    pub src_as: u32,
    pub dst_as: u32,

    /// The exporting router.
    pub router: IpAddr,
    pub next_hop: Option<IpAddr>,
    pub next_hop_as: u32,
    pub int_in: u32,
    pub int_out: u32,
    pub samplerate: u64,

    pub packets: u64,
    pub size: u64,
    /// Exporter timestamp, seconds since the epoch.
    pub timestamp: i64,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol: 0,
            src_port: 0,
            dst_port: 0,
            src_pfx: None,
            dst_pfx: None,
            src_as: 0,
            dst_as: 0,
            router: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            next_hop: None,
            next_hop_as: 0,
            int_in: 0,
            int_out: 0,
            samplerate: 0,
            packets: 0,
            size: 0,
            timestamp: 0,
        }
    }
}

impl Flow {
    /// Scaled byte estimate for this sample.
    pub fn scaled_bytes(&self) -> u64 {
        self.size.saturating_mul(self.samplerate.max(1))
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "router={} {}:{} -> {}:{} proto={} packets={} bytes={} samplerate={} intIn={} intOut={}",
            self.router,
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.protocol,
            self.packets,
            self.size,
            self.samplerate,
            self.int_in,
            self.int_out,
        )
    }
}
