//! SNMP ifIndex to interface name mapping, per agent.
//!
//! The map is maintained out-of-band (an SNMP poller or similar) and
//! replaced wholesale per agent; breakdown queries fall back to the numeric
//! index for anything unresolved.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct InterfaceMapper {
    map: RwLock<HashMap<IpAddr, HashMap<u32, String>>>,
}

impl InterfaceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_agent(&self, agent: IpAddr, interfaces: HashMap<u32, String>) {
        self.map.write().insert(agent, interfaces);
    }

    pub fn name(&self, agent: IpAddr, if_index: u32) -> Option<String> {
        self.map
            .read()
            .get(&agent)
            .and_then(|interfaces| interfaces.get(&if_index))
            .cloned()
    }

    /// Resolved name, or the numeric index when unknown.
    pub fn name_or_index(&self, agent: IpAddr, if_index: u32) -> String {
        self.name(agent, if_index)
            .unwrap_or_else(|| if_index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_falls_back() {
        let mapper = InterfaceMapper::new();
        let agent: IpAddr = "10.0.0.1".parse().unwrap();
        mapper.replace_agent(agent, HashMap::from([(1, "xe-0/0/0".to_string())]));

        assert_eq!(mapper.name_or_index(agent, 1), "xe-0/0/0");
        assert_eq!(mapper.name_or_index(agent, 99), "99");
        assert_eq!(mapper.name_or_index("10.0.0.2".parse().unwrap(), 1), "1");
    }

    #[test]
    fn replace_is_wholesale() {
        let mapper = InterfaceMapper::new();
        let agent: IpAddr = "10.0.0.1".parse().unwrap();
        mapper.replace_agent(agent, HashMap::from([(1, "old".to_string())]));
        mapper.replace_agent(agent, HashMap::from([(2, "new".to_string())]));

        assert_eq!(mapper.name(agent, 1), None);
        assert_eq!(mapper.name(agent, 2).as_deref(), Some("new"));
    }
}
