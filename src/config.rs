//! Collector configuration: a YAML document listing the agents we accept
//! flows from (with their BGP feeds), the two UDP listeners, and the knobs
//! for annotation and aggregation. Malformed configuration is fatal at
//! startup.

use crate::rib::{AFI_IPV4, AFI_IPV6};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

fn default_readers() -> usize {
    4
}

fn default_ipfix_listen() -> String {
    "0.0.0.0:4739".to_string()
}

fn default_sflow_listen() -> String {
    "0.0.0.0:6343".to_string()
}

fn default_bucket_seconds() -> i64 {
    60
}

fn default_retention_buckets() -> usize {
    360
}

fn default_channel_depth() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub agents: Vec<AgentConfig>,

    #[serde(default = "ListenerConfig::ipfix_default")]
    pub ipfix: ListenerConfig,

    #[serde(default = "ListenerConfig::sflow_default")]
    pub sflow: ListenerConfig,

    #[serde(default, alias = "bgpAugmentation")]
    pub bgp_augmentation: BgpAugmentationConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Debug level 0..3; mapped onto the tracing filter at startup.
    #[serde(default)]
    pub debug: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AgentConfig {
    pub address: IpAddr,
    pub name: String,

    #[serde(default, alias = "sampleRate")]
    pub sample_rate: u64,

    #[serde(default)]
    pub bgp_feeds: Vec<BgpFeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BgpFeedConfig {
    pub neighbor: IpAddr,
    pub local_as: u32,
    pub peer_as: u32,
    pub afis: Vec<AfiName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfiName {
    Ipv4,
    Ipv6,
}

impl AfiName {
    pub fn numeric(self) -> u16 {
        match self {
            Self::Ipv4 => AFI_IPV4,
            Self::Ipv6 => AFI_IPV6,
        }
    }
}

impl BgpFeedConfig {
    pub fn numeric_afis(&self) -> Vec<u16> {
        self.afis.iter().map(|afi| afi.numeric()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ListenerConfig {
    pub listen: String,

    #[serde(default = "default_readers")]
    pub readers: usize,
}

impl ListenerConfig {
    fn ipfix_default() -> Self {
        Self {
            listen: default_ipfix_listen(),
            readers: default_readers(),
        }
    }

    fn sflow_default() -> Self {
        Self {
            listen: default_sflow_listen(),
            readers: default_readers(),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.listen))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BgpAugmentationConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AggregationConfig {
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: i64,

    #[serde(default = "default_retention_buckets")]
    pub retention_buckets: usize,

    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: default_bucket_seconds(),
            retention_buckets: default_retention_buckets(),
            channel_depth: default_channel_depth(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to parse configuration {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("invalid YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            bail!("at least one agent must be configured");
        }
        if self.debug > 3 {
            bail!("debug level must be 0..3, got {}", self.debug);
        }
        if self.ipfix.readers == 0 || self.sflow.readers == 0 {
            bail!("reader count must be at least 1");
        }
        if self.aggregation.bucket_seconds <= 0 {
            bail!("aggregation bucket-seconds must be positive");
        }
        self.ipfix.listen_addr().context("ipfix listener")?;
        self.sflow.listen_addr().context("sflow listener")?;

        let mut seen = HashMap::new();
        for agent in &self.agents {
            if let Some(previous) = seen.insert(agent.address, &agent.name) {
                bail!(
                    "agent address {} configured twice ({} and {})",
                    agent.address,
                    previous,
                    agent.name
                );
            }
            for feed in &agent.bgp_feeds {
                if feed.afis.is_empty() {
                    bail!(
                        "agent {}: BGP feed {} enables no AFIs",
                        agent.name,
                        feed.neighbor
                    );
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the configured agents, keyed by address. Collectors use
    /// this to validate datagram sources.
    pub fn agent_names(&self) -> HashMap<IpAddr, String> {
        self.agents
            .iter()
            .map(|agent| (agent.address, agent.name.clone()))
            .collect()
    }
}
