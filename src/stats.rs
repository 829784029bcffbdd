//! Process-wide ingestion counters, updated atomically and never locked.
//! One instance is shared across both collectors; `snapshot` flattens it
//! into a name→value map for dashboards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub ipfix_packets: AtomicU64,
    pub ipfix_bytes: AtomicU64,
    pub sflow_packets: AtomicU64,
    pub sflow_bytes: AtomicU64,
    pub flows4: AtomicU64,
    pub flows6: AtomicU64,
    pub unknown_sources: AtomicU64,
    pub decode_errors: AtomicU64,
    pub template_misses: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut out = HashMap::new();
        out.insert(
            "ipfix_packets".to_string(),
            self.ipfix_packets.load(Ordering::Relaxed),
        );
        out.insert(
            "ipfix_bytes".to_string(),
            self.ipfix_bytes.load(Ordering::Relaxed),
        );
        out.insert(
            "sflow_packets".to_string(),
            self.sflow_packets.load(Ordering::Relaxed),
        );
        out.insert(
            "sflow_bytes".to_string(),
            self.sflow_bytes.load(Ordering::Relaxed),
        );
        out.insert("flows4".to_string(), self.flows4.load(Ordering::Relaxed));
        out.insert("flows6".to_string(), self.flows6.load(Ordering::Relaxed));
        out.insert(
            "unknown_sources".to_string(),
            self.unknown_sources.load(Ordering::Relaxed),
        );
        out.insert(
            "decode_errors".to_string(),
            self.decode_errors.load(Ordering::Relaxed),
        );
        out.insert(
            "template_misses".to_string(),
            self.template_misses.load(Ordering::Relaxed),
        );
        out
    }
}
