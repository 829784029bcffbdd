//! BGP annotation: enrich flows with prefixes and ASNs from per-agent
//! routing tables.
//!
//! Annotation is best-effort and never fatal: a missing feed, a RIB whose
//! session is down, or an empty lookup all leave the flow exactly as the
//! collector produced it.

use crate::config::Config;
use crate::flow::{AddressFamily, Flow};
use crate::rib::{AsPathSegment, RibSource, Route, AFI_IPV4, AFI_IPV6, SAFI_UNICAST};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Unary annotation surface served by the annotator process; transports are
/// someone else's problem.
#[async_trait]
pub trait Annotate: Send + Sync {
    async fn annotate(&self, flow: Flow) -> Flow;
}

#[derive(Debug, Clone)]
struct Feed {
    neighbor: IpAddr,
    afis: Vec<u16>,
}

pub struct Annotator {
    /// Read-only agent→feeds snapshot taken from configuration; the live
    /// config is never crawled per flow.
    feeds: HashMap<IpAddr, Vec<Feed>>,
    ribs: Arc<dyn RibSource>,
}

impl Annotator {
    pub fn new(config: &Config, ribs: Arc<dyn RibSource>) -> Self {
        let feeds = config
            .agents
            .iter()
            .map(|agent| {
                let agent_feeds = agent
                    .bgp_feeds
                    .iter()
                    .map(|feed| Feed {
                        neighbor: feed.neighbor,
                        afis: feed.numeric_afis(),
                    })
                    .collect();
                (agent.address, agent_feeds)
            })
            .collect();
        Self { feeds, ribs }
    }

    /// First feed configured for this agent that carries the AFI.
    fn feed_for(&self, agent: IpAddr, afi: u16) -> Option<IpAddr> {
        self.feeds
            .get(&agent)?
            .iter()
            .find(|feed| feed.afis.contains(&afi))
            .map(|feed| feed.neighbor)
    }

    pub fn annotate_flow(&self, flow: &mut Flow) {
        let afi = match flow.family {
            AddressFamily::Ipv4 => AFI_IPV4,
            AddressFamily::Ipv6 => AFI_IPV6,
        };

        let Some(neighbor) = self.feed_for(flow.router, afi) else {
            tracing::debug!(router = %flow.router, afi, "no BGP feed for flow, passing through");
            return;
        };
        let Some(rib) = self.ribs.rib_in(neighbor, afi, SAFI_UNICAST) else {
            return;
        };

        if let Some(route) = best_route(rib.lpm(host_prefix(flow.dst_addr))) {
            flow.dst_pfx = Some(route.pfx);
            if let Some(path) = route.paths.first() {
                flow.dst_as = final_asn(&path.as_path);
                flow.next_hop_as = first_asn(&path.as_path);
            }
        }

        if let Some(route) = best_route(rib.lpm(host_prefix(flow.src_addr))) {
            flow.src_pfx = Some(route.pfx);
            if let Some(path) = route.paths.first() {
                flow.src_as = final_asn(&path.as_path);
            }
        }
    }
}

#[async_trait]
impl Annotate for Annotator {
    async fn annotate(&self, mut flow: Flow) -> Flow {
        self.annotate_flow(&mut flow);
        flow
    }
}

fn host_prefix(addr: IpAddr) -> IpNet {
    // From<IpAddr> builds the /32 or /128 host route
    IpNet::from(addr)
}

fn best_route(mut routes: Vec<Route>) -> Option<Route> {
    if routes.is_empty() {
        return None;
    }
    Some(routes.remove(0))
}

/// Origin ASN: last ASN of the last segment, provided that segment is an
/// AS_SEQUENCE. AS_SET segments have no defined order and yield 0.
pub fn final_asn(as_path: &[AsPathSegment]) -> u32 {
    match as_path.last() {
        Some(segment) if segment.sequence => segment.asns.last().copied().unwrap_or(0),
        _ => 0,
    }
}

/// Next-hop ASN: first ASN of the first segment, provided that segment is
/// an AS_SEQUENCE.
pub fn first_asn(as_path: &[AsPathSegment]) -> u32 {
    match as_path.first() {
        Some(segment) if segment.sequence => segment.asns.first().copied().unwrap_or(0),
        _ => 0,
    }
}
