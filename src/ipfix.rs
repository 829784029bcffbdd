//! IPFIX (RFC 7011) message decoding: packet header, set iteration,
//! template and options-template records, and data-record splitting.
//!
//! Decoding stops at ordered field-value vectors; mapping values onto Flow
//! fields is the collector's job, driven by a [`FieldMap`] built once per
//! template.

use crate::flow::AddressFamily;
use crate::packet::DecodeError;

pub const IPFIX_VERSION: u16 = 10;

pub const SET_TEMPLATE: u16 = 2;
pub const SET_OPTIONS_TEMPLATE: u16 = 3;
/// Lowest set ID that addresses a data set (everything below is reserved).
pub const SET_DATA_MIN: u16 = 256;

const PACKET_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const VARIABLE_LENGTH: u16 = 0xffff;

/// IANA information element IDs the field map recognizes.
pub mod ie {
    pub const OCTET_DELTA_COUNT: u16 = 1;
    pub const PACKET_DELTA_COUNT: u16 = 2;
    pub const PROTOCOL_IDENTIFIER: u16 = 4;
    pub const L4_SRC_PORT: u16 = 7;
    pub const IPV4_SRC_ADDR: u16 = 8;
    pub const INPUT_SNMP: u16 = 10;
    pub const L4_DST_PORT: u16 = 11;
    pub const IPV4_DST_ADDR: u16 = 12;
    pub const OUTPUT_SNMP: u16 = 14;
    pub const IPV4_NEXT_HOP: u16 = 15;
    pub const BGP_SOURCE_AS: u16 = 16;
    pub const BGP_DESTINATION_AS: u16 = 17;
    pub const IPV6_SRC_ADDR: u16 = 27;
    pub const IPV6_DST_ADDR: u16 = 28;
    pub const IPV6_NEXT_HOP: u16 = 62;
    pub const SAMPLING_PACKET_INTERVAL: u16 = 305;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u16,
    pub export_time: u32,
    pub sequence: u32,
    pub domain_id: u32,
}

#[derive(Debug)]
pub struct Set<'a> {
    pub id: u16,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    pub id: u16,
    pub length: u16,
    /// Private enterprise number for enterprise-specific elements; such
    /// fields are skipped over but never mapped.
    pub enterprise: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub template_id: u16,
    pub fields: Vec<TemplateField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsTemplateRecord {
    pub template_id: u16,
    pub scope_count: u16,
    /// Scope fields first, then option fields, in wire order.
    pub fields: Vec<TemplateField>,
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

pub fn decode_header(payload: &[u8]) -> Result<(PacketHeader, usize), DecodeError> {
    need("IPFIX packet header", PACKET_HEADER_LEN, payload)?;

    let version = u16::from_be_bytes([payload[0], payload[1]]);
    if version != IPFIX_VERSION {
        return Err(DecodeError::BadVersion {
            what: "IPFIX",
            version: u32::from(version),
        });
    }

    Ok((
        PacketHeader {
            length: u16::from_be_bytes([payload[2], payload[3]]),
            export_time: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            sequence: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            domain_id: u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]),
        },
        PACKET_HEADER_LEN,
    ))
}

/// Split a message into its sets, honoring the total length from the header.
pub fn decode_sets<'a>(
    payload: &'a [u8],
    header: &PacketHeader,
) -> Result<Vec<Set<'a>>, DecodeError> {
    let total = (header.length as usize).min(payload.len());
    let mut offset = PACKET_HEADER_LEN;
    let mut sets = Vec::new();

    while offset + SET_HEADER_LEN <= total {
        let id = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let length = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
        if length < SET_HEADER_LEN {
            return Err(DecodeError::Malformed("IPFIX set length"));
        }
        if offset + length > total {
            return Err(DecodeError::Truncated {
                what: "IPFIX set",
                need: offset + length,
                have: total,
            });
        }
        sets.push(Set {
            id,
            body: &payload[offset + SET_HEADER_LEN..offset + length],
        });
        offset += length;
    }

    Ok(sets)
}

pub fn decode_template_set(body: &[u8]) -> Result<Vec<TemplateRecord>, DecodeError> {
    let mut cursor = body;
    let mut records = Vec::new();

    // trailing padding is shorter than a record header
    while cursor.len() >= 4 {
        let template_id = u16::from_be_bytes([cursor[0], cursor[1]]);
        let field_count = u16::from_be_bytes([cursor[2], cursor[3]]);
        if template_id == 0 && field_count == 0 {
            break;
        }
        cursor = &cursor[4..];

        let (fields, rest) = decode_template_fields(cursor, field_count)?;
        records.push(TemplateRecord {
            template_id,
            fields,
        });
        cursor = rest;
    }

    Ok(records)
}

pub fn decode_options_template_set(
    body: &[u8],
) -> Result<Vec<OptionsTemplateRecord>, DecodeError> {
    let mut cursor = body;
    let mut records = Vec::new();

    while cursor.len() >= 6 {
        let template_id = u16::from_be_bytes([cursor[0], cursor[1]]);
        let field_count = u16::from_be_bytes([cursor[2], cursor[3]]);
        let scope_count = u16::from_be_bytes([cursor[4], cursor[5]]);
        if template_id == 0 && field_count == 0 {
            break;
        }
        cursor = &cursor[6..];

        let (fields, rest) = decode_template_fields(cursor, field_count)?;
        records.push(OptionsTemplateRecord {
            template_id,
            scope_count,
            fields,
        });
        cursor = rest;
    }

    Ok(records)
}

fn decode_template_fields(
    mut cursor: &[u8],
    count: u16,
) -> Result<(Vec<TemplateField>, &[u8]), DecodeError> {
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need("IPFIX template field", 4, cursor)?;
        let raw_id = u16::from_be_bytes([cursor[0], cursor[1]]);
        let length = u16::from_be_bytes([cursor[2], cursor[3]]);
        cursor = &cursor[4..];

        let enterprise = if raw_id & 0x8000 != 0 {
            need("IPFIX enterprise number", 4, cursor)?;
            let pen = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
            cursor = &cursor[4..];
            Some(pen)
        } else {
            None
        };

        fields.push(TemplateField {
            id: raw_id & 0x7fff,
            length,
            enterprise,
        });
    }
    Ok((fields, cursor))
}

/// Split a data set into records, each an ordered vector of raw field
/// values matching `fields`. Handles RFC 7011 variable-length encoding.
/// Trailing bytes shorter than one record are padding and are dropped.
pub fn split_records<'a>(
    fields: &[TemplateField],
    body: &'a [u8],
) -> Result<Vec<Vec<&'a [u8]>>, DecodeError> {
    if fields.is_empty() {
        return Ok(Vec::new());
    }

    let fixed_len: usize = fields
        .iter()
        .map(|f| {
            if f.length == VARIABLE_LENGTH {
                1
            } else {
                f.length as usize
            }
        })
        .sum();
    if fixed_len == 0 {
        return Err(DecodeError::Malformed("IPFIX zero-length template"));
    }

    let mut cursor = body;
    let mut records = Vec::new();

    while cursor.len() >= fixed_len {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let len = if field.length == VARIABLE_LENGTH {
                need("IPFIX variable-length field", 1, cursor)?;
                if cursor[0] == 255 {
                    need("IPFIX extended variable-length field", 3, cursor)?;
                    let len = u16::from_be_bytes([cursor[1], cursor[2]]) as usize;
                    cursor = &cursor[3..];
                    len
                } else {
                    let len = cursor[0] as usize;
                    cursor = &cursor[1..];
                    len
                }
            } else {
                field.length as usize
            };
            need("IPFIX field value", len, cursor)?;
            values.push(&cursor[..len]);
            cursor = &cursor[len..];
        }
        records.push(values);
    }

    Ok(records)
}

/// Decode a big-endian unsigned field value of 1..=8 bytes.
pub fn be_uint(bytes: &[u8]) -> u64 {
    if bytes.is_empty() || bytes.len() > 8 {
        return 0;
    }
    bytes.iter().fold(0_u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Where each normalized Flow field sits in a record decoded under one
/// template. Built once per template, reused for all of its records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldMap {
    pub src_addr: Option<usize>,
    pub dst_addr: Option<usize>,
    pub protocol: Option<usize>,
    pub packets: Option<usize>,
    pub size: Option<usize>,
    pub int_in: Option<usize>,
    pub int_out: Option<usize>,
    pub next_hop: Option<usize>,
    pub src_port: Option<usize>,
    pub dst_port: Option<usize>,
    pub src_as: Option<usize>,
    pub dst_as: Option<usize>,
    pub family: Option<AddressFamily>,
}

impl FieldMap {
    pub fn from_fields(fields: &[TemplateField]) -> Self {
        let mut map = Self::default();
        for (idx, field) in fields.iter().enumerate() {
            if field.enterprise.is_some() {
                continue;
            }
            match field.id {
                ie::IPV4_SRC_ADDR => {
                    map.src_addr = Some(idx);
                    map.family = Some(AddressFamily::Ipv4);
                }
                ie::IPV6_SRC_ADDR => {
                    map.src_addr = Some(idx);
                    map.family = Some(AddressFamily::Ipv6);
                }
                ie::IPV4_DST_ADDR | ie::IPV6_DST_ADDR => map.dst_addr = Some(idx),
                ie::PROTOCOL_IDENTIFIER => map.protocol = Some(idx),
                ie::PACKET_DELTA_COUNT => map.packets = Some(idx),
                ie::OCTET_DELTA_COUNT => map.size = Some(idx),
                ie::INPUT_SNMP => map.int_in = Some(idx),
                ie::OUTPUT_SNMP => map.int_out = Some(idx),
                ie::IPV4_NEXT_HOP | ie::IPV6_NEXT_HOP => map.next_hop = Some(idx),
                ie::L4_SRC_PORT => map.src_port = Some(idx),
                ie::L4_DST_PORT => map.dst_port = Some(idx),
                ie::BGP_SOURCE_AS => map.src_as = Some(idx),
                ie::BGP_DESTINATION_AS => map.dst_as = Some(idx),
                _ => {}
            }
        }
        map
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{build_message, build_options_template_set, build_template_set};
    use super::*;

    #[test]
    fn header_and_sets_round() {
        let template = build_template_set(
            256,
            &[(ie::IPV4_SRC_ADDR, 4), (ie::IPV4_DST_ADDR, 4)],
        );
        let message = build_message(7, 1_700_000_000, &[(SET_TEMPLATE, template)]);

        let (header, _) = decode_header(&message).unwrap();
        assert_eq!(header.domain_id, 7);
        assert_eq!(header.export_time, 1_700_000_000);

        let sets = decode_sets(&message, &header).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].id, SET_TEMPLATE);

        let records = decode_template_set(sets[0].body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].template_id, 256);
        assert_eq!(records[0].fields.len(), 2);
        assert_eq!(records[0].fields[0].id, ie::IPV4_SRC_ADDR);
        assert_eq!(records[0].fields[0].length, 4);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut message = build_message(1, 0, &[]);
        message[0] = 0;
        message[1] = 9;
        assert!(matches!(
            decode_header(&message).unwrap_err(),
            DecodeError::BadVersion { what: "IPFIX", .. }
        ));
    }

    #[test]
    fn enterprise_fields_parse_and_stay_unmapped() {
        let mut body = Vec::new();
        body.extend_from_slice(&300_u16.to_be_bytes());
        body.extend_from_slice(&2_u16.to_be_bytes());
        // enterprise-specific field: high bit set, PEN follows
        body.extend_from_slice(&(0x8000_u16 | 137).to_be_bytes());
        body.extend_from_slice(&8_u16.to_be_bytes());
        body.extend_from_slice(&2636_u32.to_be_bytes());
        body.extend_from_slice(&ie::PROTOCOL_IDENTIFIER.to_be_bytes());
        body.extend_from_slice(&1_u16.to_be_bytes());

        let records = decode_template_set(&body).unwrap();
        assert_eq!(records[0].fields[0].enterprise, Some(2636));
        assert_eq!(records[0].fields[0].id, 137);

        let map = FieldMap::from_fields(&records[0].fields);
        assert_eq!(map.protocol, Some(1));
    }

    #[test]
    fn options_template_set_keeps_scope_count() {
        let body = build_options_template_set(
            512,
            1,
            &[(ie::SAMPLING_PACKET_INTERVAL, 4), (346, 4)],
        );
        let records = decode_options_template_set(&body).unwrap();
        assert_eq!(records[0].template_id, 512);
        assert_eq!(records[0].scope_count, 1);
        assert_eq!(records[0].fields.len(), 2);
    }

    #[test]
    fn split_records_fixed_length() {
        let fields = [
            TemplateField {
                id: ie::PROTOCOL_IDENTIFIER,
                length: 1,
                enterprise: None,
            },
            TemplateField {
                id: ie::L4_SRC_PORT,
                length: 2,
                enterprise: None,
            },
        ];
        let body = [6_u8, 0x01, 0xbb, 17, 0x00, 0x35, 0xff]; // two records + padding
        let records = split_records(&fields, &body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(be_uint(records[0][0]), 6);
        assert_eq!(be_uint(records[0][1]), 443);
        assert_eq!(be_uint(records[1][1]), 53);
    }

    #[test]
    fn split_records_variable_length() {
        let fields = [
            TemplateField {
                id: 371, // some string IE
                length: VARIABLE_LENGTH,
                enterprise: None,
            },
            TemplateField {
                id: ie::PROTOCOL_IDENTIFIER,
                length: 1,
                enterprise: None,
            },
        ];
        let body = [3_u8, b'a', b'b', b'c', 6];
        let records = split_records(&fields, &body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], b"abc");
        assert_eq!(be_uint(records[0][1]), 6);
    }

    #[test]
    fn be_uint_widths() {
        assert_eq!(be_uint(&[0x12]), 0x12);
        assert_eq!(be_uint(&[0x12, 0x34]), 0x1234);
        assert_eq!(be_uint(&[0x01, 0x02, 0x03]), 0x010203);
        assert_eq!(
            be_uint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            u64::MAX
        );
        assert_eq!(be_uint(&[]), 0);
        assert_eq!(be_uint(&[0_u8; 9]), 0);
    }

    #[test]
    fn field_map_tracks_family_and_indices() {
        let fields: Vec<TemplateField> = [
            (ie::IPV6_SRC_ADDR, 16),
            (ie::IPV6_DST_ADDR, 16),
            (ie::PROTOCOL_IDENTIFIER, 1),
            (ie::OCTET_DELTA_COUNT, 4),
            (ie::L4_SRC_PORT, 2),
            (ie::L4_DST_PORT, 2),
        ]
        .iter()
        .map(|&(id, length)| TemplateField {
            id,
            length,
            enterprise: None,
        })
        .collect();

        let map = FieldMap::from_fields(&fields);
        assert_eq!(map.family, Some(AddressFamily::Ipv6));
        assert_eq!(map.src_addr, Some(0));
        assert_eq!(map.dst_addr, Some(1));
        assert_eq!(map.protocol, Some(2));
        assert_eq!(map.size, Some(3));
        assert_eq!(map.src_port, Some(4));
        assert_eq!(map.dst_port, Some(5));
        assert_eq!(map.packets, None);
        assert_eq!(map.next_hop, None);
    }
}
