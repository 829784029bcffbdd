//! Samplerate cache: agent address to its current sampling rate.
//!
//! sFlow pushes updates from every sample (the rate ships in-band); the
//! IPFIX path updates on options records carrying samplingPacketInterval.
//! An agent without an entry samples at rate 1 as far as byte accounting is
//! concerned.

use crate::config::AgentConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct SamplerateCache {
    cache: RwLock<HashMap<IpAddr, u64>>,
}

impl SamplerateCache {
    /// Seed the cache with the rates configured per agent.
    pub fn new(agents: &[AgentConfig]) -> Self {
        let cache = Self::default();
        for agent in agents {
            if agent.sample_rate > 0 {
                cache.set(agent.address, agent.sample_rate);
            }
        }
        cache
    }

    pub fn set(&self, agent: IpAddr, rate: u64) {
        if rate == 0 {
            return;
        }
        self.cache.write().insert(agent, rate);
    }

    pub fn get(&self, agent: IpAddr) -> u64 {
        self.cache.read().get(&agent).copied().unwrap_or(1)
    }
}
