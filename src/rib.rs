//! Adjacency-RIB-in data structures and the collaborator interface a
//! routing daemon implements to expose them.
//!
//! Sessions mutate a RIB asynchronously (`update`/`withdraw`) while the
//! annotator runs longest-prefix-match lookups against it; the whole table
//! sits behind one reader/writer lock and `lpm` never holds it across
//! anything blocking.

use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;
pub const SAFI_UNICAST: u8 = 1;

/// One AS-path segment: an ordered AS_SEQUENCE or an unordered AS_SET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsPathSegment {
    pub sequence: bool,
    pub asns: Vec<u32>,
}

impl AsPathSegment {
    pub fn sequence(asns: Vec<u32>) -> Self {
        Self {
            sequence: true,
            asns,
        }
    }

    pub fn set(asns: Vec<u32>) -> Self {
        Self {
            sequence: false,
            asns,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BgpPath {
    pub as_path: Vec<AsPathSegment>,
    pub next_hop: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pfx: IpNet,
    pub paths: Vec<BgpPath>,
}

#[derive(Debug, Default)]
pub struct AdjRibIn {
    entries: RwLock<HashMap<IpNet, Vec<BgpPath>>>,
}

impl AdjRibIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the path set for a prefix.
    pub fn update(&self, pfx: IpNet, path: BgpPath) {
        self.entries.write().insert(pfx, vec![path]);
    }

    pub fn withdraw(&self, pfx: &IpNet) {
        self.entries.write().remove(pfx);
    }

    /// Longest-prefix match: all routes covering `pfx.addr()` whose length
    /// does not exceed `pfx.prefix_len()`, longest first.
    pub fn lpm(&self, pfx: IpNet) -> Vec<Route> {
        let addr = pfx.addr();
        let max_len = pfx.prefix_len();

        let entries = self.entries.read();
        let mut routes: Vec<Route> = entries
            .iter()
            .filter(|(candidate, paths)| {
                !paths.is_empty() && candidate.prefix_len() <= max_len && candidate.contains(&addr)
            })
            .map(|(candidate, paths)| Route {
                pfx: *candidate,
                paths: paths.clone(),
            })
            .collect();
        routes.sort_by(|a, b| b.pfx.prefix_len().cmp(&a.pfx.prefix_len()));
        routes
    }

    pub fn route_count(&self) -> usize {
        self.entries.read().len()
    }
}

/// What the annotator needs from the routing daemon: per-neighbor RIB
/// handles by address family. A handle may be absent while the session is
/// down or not yet established.
pub trait RibSource: Send + Sync {
    fn rib_in(&self, neighbor: IpAddr, afi: u16, safi: u8) -> Option<Arc<AdjRibIn>>;
}

/// Registry where the enclosing service parks the RIBs its BGP sessions
/// maintain.
#[derive(Debug, Default)]
pub struct RibRegistry {
    ribs: RwLock<HashMap<(IpAddr, u16, u8), Arc<AdjRibIn>>>,
}

impl RibRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or fetch) the RIB for a session; the caller keeps the handle
    /// and feeds it updates for the session's lifetime.
    pub fn register(&self, neighbor: IpAddr, afi: u16, safi: u8) -> Arc<AdjRibIn> {
        Arc::clone(
            self.ribs
                .write()
                .entry((neighbor, afi, safi))
                .or_default(),
        )
    }

    /// Drop the RIB when the session goes away; lookups return `None` from
    /// then on and annotation degrades to pass-through.
    pub fn unregister(&self, neighbor: IpAddr, afi: u16, safi: u8) {
        self.ribs.write().remove(&(neighbor, afi, safi));
    }
}

impl RibSource for RibRegistry {
    fn rib_in(&self, neighbor: IpAddr, afi: u16, safi: u8) -> Option<Arc<AdjRibIn>> {
        self.ribs.read().get(&(neighbor, afi, safi)).cloned()
    }
}
