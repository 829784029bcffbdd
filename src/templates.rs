//! Template cache for the IPFIX path.
//!
//! Templates are addressed by (agent, observation domain, template ID) and
//! the freshest one wins. Entries are handed out as `Arc` clones, so a
//! refresh racing a data-set decode can never tear the template the decoder
//! is holding.

use crate::ipfix::{OptionsTemplateRecord, TemplateRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub agent: IpAddr,
    pub domain_id: u32,
    pub template_id: u16,
}

#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: RwLock<HashMap<TemplateKey, Arc<TemplateRecord>>>,
    options: RwLock<HashMap<TemplateKey, Arc<OptionsTemplateRecord>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: TemplateKey, template: TemplateRecord) {
        let template = Arc::new(template);
        let previous = self.templates.write().insert(key, template);
        if previous.is_some() {
            tracing::debug!(
                agent = %key.agent,
                domain_id = key.domain_id,
                template_id = key.template_id,
                "template refreshed"
            );
        }
    }

    pub fn get(&self, key: &TemplateKey) -> Option<Arc<TemplateRecord>> {
        self.templates.read().get(key).cloned()
    }

    pub fn set_options(&self, key: TemplateKey, template: OptionsTemplateRecord) {
        self.options.write().insert(key, Arc::new(template));
    }

    pub fn get_options(&self, key: &TemplateKey) -> Option<Arc<OptionsTemplateRecord>> {
        self.options.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}
