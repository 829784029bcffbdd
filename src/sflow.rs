//! sFlow v5 datagram decoding (RFC 3176 / InMon sFlow v5).
//!
//! Only the structures the collector consumes are modeled: flow samples with
//! their raw packet header and extended router data records. Everything else
//! is length-skipped so one odd sample never sinks the datagram.

use crate::packet::DecodeError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const SFLOW_VERSION: u32 = 5;

/// Raw packet header protocol: Ethernet (ISO 8802.3).
pub const HEADER_PROTO_ETHERNET: u32 = 1;

const ADDR_TYPE_IPV4: u32 = 1;
const ADDR_TYPE_IPV6: u32 = 2;

const SAMPLE_FLOW: u32 = 1;
const RECORD_RAW_PACKET_HEADER: u32 = 1;
const RECORD_EXTENDED_ROUTER: u32 = 1002;

#[derive(Debug)]
pub struct Datagram<'a> {
    pub agent_addr: IpAddr,
    pub sub_agent_id: u32,
    pub sequence: u32,
    pub uptime_ms: u32,
    pub samples: Vec<Sample<'a>>,
}

#[derive(Debug)]
pub enum Sample<'a> {
    Flow(FlowSample<'a>),
    /// A sample format the collector does not consume (counter samples,
    /// expanded formats); carried so the caller can account for it.
    Skipped { format: u32 },
}

#[derive(Debug)]
pub struct FlowSample<'a> {
    pub sequence: u32,
    pub sampling_rate: u32,
    pub input_if: u32,
    pub output_if: u32,
    pub raw_header: Option<RawPacketHeader<'a>>,
    pub extended_router: Option<ExtendedRouterData>,
}

#[derive(Debug)]
pub struct RawPacketHeader<'a> {
    pub header_protocol: u32,
    /// Original length of the packet on the wire, in octets.
    pub frame_length: u32,
    pub stripped: u32,
    pub header: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedRouterData {
    pub next_hop: IpAddr,
    pub src_mask_len: u32,
    pub dst_mask_len: u32,
}

/// Big-endian cursor over a datagram; every read is length-checked.
struct Cursor<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                what: self.what,
                need: n,
                have: self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn address(&mut self) -> Result<IpAddr, DecodeError> {
        match self.u32()? {
            ADDR_TYPE_IPV4 => {
                let b = self.bytes(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            ADDR_TYPE_IPV6 => {
                let b = self.bytes(16)?;
                let mut octets = [0_u8; 16];
                octets.copy_from_slice(b);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => Err(DecodeError::Malformed("sFlow address type")),
        }
    }
}

pub fn decode_datagram(payload: &[u8]) -> Result<Datagram<'_>, DecodeError> {
    let mut cursor = Cursor::new(payload, "sFlow datagram header");

    let version = cursor.u32()?;
    if version != SFLOW_VERSION {
        return Err(DecodeError::BadVersion {
            what: "sFlow",
            version,
        });
    }

    let agent_addr = cursor.address()?;
    let sub_agent_id = cursor.u32()?;
    let sequence = cursor.u32()?;
    let uptime_ms = cursor.u32()?;
    let sample_count = cursor.u32()?;

    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        cursor.what = "sFlow sample header";
        let data_format = cursor.u32()?;
        let length = cursor.u32()? as usize;
        let body = cursor.bytes(length)?;

        // format is the low 12 bits; the enterprise owns the rest
        let enterprise = data_format >> 12;
        let format = data_format & 0xfff;
        if enterprise == 0 && format == SAMPLE_FLOW {
            samples.push(Sample::Flow(decode_flow_sample(body)?));
        } else {
            samples.push(Sample::Skipped { format });
        }
    }

    Ok(Datagram {
        agent_addr,
        sub_agent_id,
        sequence,
        uptime_ms,
        samples,
    })
}

fn decode_flow_sample(body: &[u8]) -> Result<FlowSample<'_>, DecodeError> {
    let mut cursor = Cursor::new(body, "sFlow flow sample");

    let sequence = cursor.u32()?;
    let _source_id = cursor.u32()?;
    let sampling_rate = cursor.u32()?;
    let _sample_pool = cursor.u32()?;
    let _drops = cursor.u32()?;
    let input_if = cursor.u32()?;
    let output_if = cursor.u32()?;
    let record_count = cursor.u32()?;

    let mut sample = FlowSample {
        sequence,
        sampling_rate,
        input_if,
        output_if,
        raw_header: None,
        extended_router: None,
    };

    for _ in 0..record_count {
        cursor.what = "sFlow flow record";
        let data_format = cursor.u32()?;
        let length = cursor.u32()? as usize;
        let record = cursor.bytes(length)?;

        let enterprise = data_format >> 12;
        let format = data_format & 0xfff;
        if enterprise != 0 {
            continue;
        }
        match format {
            RECORD_RAW_PACKET_HEADER => {
                sample.raw_header = Some(decode_raw_packet_header(record)?);
            }
            RECORD_EXTENDED_ROUTER => {
                sample.extended_router = Some(decode_extended_router(record)?);
            }
            _ => {}
        }
    }

    Ok(sample)
}

fn decode_raw_packet_header(record: &[u8]) -> Result<RawPacketHeader<'_>, DecodeError> {
    let mut cursor = Cursor::new(record, "sFlow raw packet header");

    let header_protocol = cursor.u32()?;
    let frame_length = cursor.u32()?;
    let stripped = cursor.u32()?;
    let header_length = cursor.u32()? as usize;
    let header = cursor.bytes(header_length)?;

    Ok(RawPacketHeader {
        header_protocol,
        frame_length,
        stripped,
        header,
    })
}

fn decode_extended_router(record: &[u8]) -> Result<ExtendedRouterData, DecodeError> {
    let mut cursor = Cursor::new(record, "sFlow extended router data");

    let next_hop = cursor.address()?;
    let src_mask_len = cursor.u32()?;
    let dst_mask_len = cursor.u32()?;

    Ok(ExtendedRouterData {
        next_hop,
        src_mask_len,
        dst_mask_len,
    })
}
