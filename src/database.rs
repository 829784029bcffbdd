//! Time-sharded flow store and breakdown aggregation.
//!
//! Flows land in per-bucket shards so a query only visits the slices its
//! time range touches. Within a shard, flows sit in an ordered tree keyed
//! by (timestamp, arrival sequence) for range traversal. Breakdown queries
//! accumulate scaled bytes per key into the query's own map and, at the
//! same time, into a process-wide sum map shared by all concurrent
//! breakdowns.

use crate::flow::{AddressFamily, Flow};
use crate::intfmap::InterfaceMapper;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const FIELD_SRC_ADDR: usize = 0;
pub const FIELD_DST_ADDR: usize = 1;
pub const FIELD_PROTOCOL: usize = 2;
pub const FIELD_INT_IN: usize = 3;
pub const FIELD_INT_OUT: usize = 4;
pub const FIELD_NEXT_HOP: usize = 5;
pub const FIELD_SRC_AS: usize = 6;
pub const FIELD_DST_AS: usize = 7;
pub const FIELD_NEXT_HOP_AS: usize = 8;
pub const FIELD_SRC_PFX: usize = 9;
pub const FIELD_DST_PFX: usize = 10;
pub const FIELD_SRC_PORT: usize = 11;
pub const FIELD_DST_PORT: usize = 12;
pub const FIELD_INT_IN_NAME: usize = 13;
pub const FIELD_INT_OUT_NAME: usize = 14;
pub const FIELD_MAX: usize = 15;

const BREAKDOWN_LABELS: [&str; FIELD_MAX] = [
    "SrcAddr",
    "DstAddr",
    "Protocol",
    "IntIn",
    "IntOut",
    "NextHop",
    "SrcAsn",
    "DstAsn",
    "NextHopAsn",
    "SrcPfx",
    "DstPfx",
    "SrcPort",
    "DstPort",
    "IntInName",
    "IntOutName",
];

/// One slot per breakdown dimension; slots not selected by the query stay
/// empty and do not contribute to equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct BreakdownKey(pub [String; FIELD_MAX]);

impl fmt::Display for BreakdownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (idx, value) in self.0.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", BREAKDOWN_LABELS[idx], value)?;
            first = false;
        }
        Ok(())
    }
}

pub type BreakdownMap = HashMap<BreakdownKey, u64>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid breakdown key: {0}")]
pub struct InvalidBreakdownField(String);

/// Which dimensions a breakdown query keys on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakdownFields {
    pub src_addr: bool,
    pub dst_addr: bool,
    pub protocol: bool,
    pub int_in: bool,
    pub int_out: bool,
    pub next_hop: bool,
    pub src_asn: bool,
    pub dst_asn: bool,
    pub next_hop_asn: bool,
    pub src_pfx: bool,
    pub dst_pfx: bool,
    pub src_port: bool,
    pub dst_port: bool,
    pub int_in_name: bool,
    pub int_out_name: bool,
}

impl BreakdownFields {
    /// Enable the dimensions named in `keys` (front-end label spelling).
    pub fn set(&mut self, keys: &[&str]) -> Result<(), InvalidBreakdownField> {
        for key in keys {
            match *key {
                "SrcAddr" => self.src_addr = true,
                "DstAddr" => self.dst_addr = true,
                "Protocol" => self.protocol = true,
                "IntIn" => self.int_in = true,
                "IntOut" => self.int_out = true,
                "NextHop" => self.next_hop = true,
                "SrcAsn" => self.src_asn = true,
                "DstAsn" => self.dst_asn = true,
                "NextHopAsn" => self.next_hop_asn = true,
                "SrcPfx" => self.src_pfx = true,
                "DstPfx" => self.dst_pfx = true,
                "SrcPort" => self.src_port = true,
                "DstPort" => self.dst_port = true,
                "IntInName" => self.int_in_name = true,
                "IntOutName" => self.int_out_name = true,
                other => return Err(InvalidBreakdownField(other.to_string())),
            }
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        [
            self.src_addr,
            self.dst_addr,
            self.protocol,
            self.int_in,
            self.int_out,
            self.next_hop,
            self.src_asn,
            self.dst_asn,
            self.next_hop_asn,
            self.src_pfx,
            self.dst_pfx,
            self.src_port,
            self.dst_port,
            self.int_in_name,
            self.int_out_name,
        ]
        .iter()
        .filter(|enabled| **enabled)
        .count()
    }

    pub fn labels() -> &'static [&'static str] {
        &BREAKDOWN_LABELS
    }
}

#[derive(Debug, Clone, Default)]
pub struct BreakdownQuery {
    /// Inclusive timestamp range, seconds.
    pub start: i64,
    pub end: i64,
    pub fields: BreakdownFields,
    pub agent: Option<IpAddr>,
    pub protocol: Option<u8>,
}

#[derive(Debug, Default)]
struct Shard {
    flows: RwLock<BTreeMap<(i64, u64), Flow>>,
}

#[derive(Debug)]
pub struct FlowDatabase {
    bucket_seconds: i64,
    shards: RwLock<BTreeMap<i64, Arc<Shard>>>,
    sequence: AtomicU64,
    global_sums: Mutex<BreakdownMap>,
}

impl FlowDatabase {
    pub fn new(bucket_seconds: i64) -> Self {
        Self {
            bucket_seconds: bucket_seconds.max(1),
            shards: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            global_sums: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_of(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.bucket_seconds)
    }

    pub fn insert(&self, flow: Flow) {
        let bucket = self.bucket_of(flow.timestamp);
        let shard = {
            let shards = self.shards.read();
            shards.get(&bucket).cloned()
        };
        let shard = match shard {
            Some(shard) => shard,
            None => Arc::clone(self.shards.write().entry(bucket).or_default()),
        };

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        shard.flows.write().insert((flow.timestamp, seq), flow);
    }

    pub fn flow_count(&self) -> usize {
        let shards = self.shards.read();
        shards
            .values()
            .map(|shard| shard.flows.read().len())
            .sum()
    }

    /// Drop every shard that ends at or before `timestamp`. Returns the
    /// number of flows evicted.
    pub fn evict_before(&self, timestamp: i64) -> usize {
        let mut evicted = 0;
        let mut shards = self.shards.write();
        shards.retain(|bucket, shard| {
            if bucket + self.bucket_seconds <= timestamp {
                evicted += shard.flows.read().len();
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Compute the breakdown for `query`. A query keying on no dimension is
    /// logged and answered with an empty map without touching shared state.
    pub fn breakdown(&self, query: &BreakdownQuery, interfaces: &InterfaceMapper) -> BreakdownMap {
        let mut buckets = BreakdownMap::new();
        if query.fields.count() == 0 {
            tracing::error!("breakdown query selects no fields");
            return buckets;
        }
        if query.end < query.start {
            tracing::error!(
                start = query.start,
                end = query.end,
                "breakdown query has inverted time range"
            );
            return buckets;
        }

        let from = self.bucket_of(query.start);
        let shards: Vec<Arc<Shard>> = {
            let guard = self.shards.read();
            guard
                .range(from..=query.end)
                .map(|(_, shard)| Arc::clone(shard))
                .collect()
        };

        for shard in shards {
            let mut shard_sums = BreakdownMap::new();
            {
                let flows = shard.flows.read();
                for (_, flow) in flows.range((query.start, 0)..=(query.end, u64::MAX)) {
                    if !query_matches(query, flow) {
                        continue;
                    }
                    let key = build_key(flow, &query.fields, interfaces);
                    let bytes = flow.scaled_bytes();
                    *buckets.entry(key.clone()).or_default() += bytes;
                    *shard_sums.entry(key).or_default() += bytes;
                }
            }

            let mut sums = self.global_sums.lock();
            for (key, bytes) in shard_sums {
                *sums.entry(key).or_default() += bytes;
            }
        }

        buckets
    }

    /// Snapshot of the process-wide sums accumulated by every breakdown run
    /// so far.
    pub fn sums_snapshot(&self) -> BreakdownMap {
        self.global_sums.lock().clone()
    }
}

fn query_matches(query: &BreakdownQuery, flow: &Flow) -> bool {
    if let Some(agent) = query.agent {
        if flow.router != agent {
            return false;
        }
    }
    if let Some(protocol) = query.protocol {
        if flow.protocol != protocol {
            return false;
        }
    }
    true
}

fn build_key(flow: &Flow, fields: &BreakdownFields, interfaces: &InterfaceMapper) -> BreakdownKey {
    let mut key = BreakdownKey::default();

    if fields.src_addr {
        key.0[FIELD_SRC_ADDR] = flow.src_addr.to_string();
    }
    if fields.dst_addr {
        key.0[FIELD_DST_ADDR] = flow.dst_addr.to_string();
    }
    if fields.protocol {
        key.0[FIELD_PROTOCOL] = match proto_name(flow.protocol) {
            Some(name) => name.to_string(),
            None => flow.protocol.to_string(),
        };
    }
    if fields.int_in {
        key.0[FIELD_INT_IN] = flow.int_in.to_string();
    }
    if fields.int_out {
        key.0[FIELD_INT_OUT] = flow.int_out.to_string();
    }
    if fields.next_hop {
        key.0[FIELD_NEXT_HOP] = match flow.next_hop {
            Some(next_hop) => next_hop.to_string(),
            None => unspecified_addr(flow.family).to_string(),
        };
    }
    if fields.src_asn {
        key.0[FIELD_SRC_AS] = flow.src_as.to_string();
    }
    if fields.dst_asn {
        key.0[FIELD_DST_AS] = flow.dst_as.to_string();
    }
    if fields.next_hop_asn {
        key.0[FIELD_NEXT_HOP_AS] = flow.next_hop_as.to_string();
    }
    if fields.src_pfx {
        key.0[FIELD_SRC_PFX] = match flow.src_pfx {
            Some(pfx) => pfx.to_string(),
            None => default_prefix(flow.family).to_string(),
        };
    }
    if fields.dst_pfx {
        key.0[FIELD_DST_PFX] = match flow.dst_pfx {
            Some(pfx) => pfx.to_string(),
            None => default_prefix(flow.family).to_string(),
        };
    }
    if fields.src_port {
        key.0[FIELD_SRC_PORT] = flow.src_port.to_string();
    }
    if fields.dst_port {
        key.0[FIELD_DST_PORT] = flow.dst_port.to_string();
    }
    if fields.int_in_name {
        key.0[FIELD_INT_IN_NAME] = interfaces.name_or_index(flow.router, flow.int_in);
    }
    if fields.int_out_name {
        key.0[FIELD_INT_OUT_NAME] = interfaces.name_or_index(flow.router, flow.int_out);
    }

    key
}

fn default_prefix(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::Ipv4 => "0.0.0.0/0",
        AddressFamily::Ipv6 => "::/0",
    }
}

fn unspecified_addr(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::Ipv4 => "0.0.0.0",
        AddressFamily::Ipv6 => "::",
    }
}

/// Well-known IANA protocol names; anything else renders numerically.
fn proto_name(proto: u8) -> Option<&'static str> {
    match proto {
        1 => Some("ICMP"),
        2 => Some("IGMP"),
        6 => Some("TCP"),
        17 => Some("UDP"),
        47 => Some("GRE"),
        50 => Some("ESP"),
        51 => Some("AH"),
        58 => Some("IPv6-ICMP"),
        89 => Some("OSPFIGP"),
        132 => Some("SCTP"),
        _ => None,
    }
}
