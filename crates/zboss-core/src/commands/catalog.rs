//! Header to definition lookup for incoming commands

use std::collections::HashMap;

use super::command::CommandDef;
use super::{ncp_config, zdo};
use crate::protocol::HlCommonHeader;

/// Known command definitions, keyed by control type and command ID
#[derive(Debug, Default, Clone)]
pub struct CommandCatalog {
    defs: HashMap<HlCommonHeader, &'static CommandDef>,
}

fn key(header: HlCommonHeader) -> HlCommonHeader {
    header.with_version(0)
}

impl CommandCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in definitions
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for def in ncp_config::ALL.iter().chain(zdo::ALL) {
            catalog.register(*def);
        }
        catalog
    }

    /// Add a definition, and its response if it is a request
    pub fn register(&mut self, def: &'static CommandDef) {
        self.defs.insert(key(def.header), def);
        if let Some(rsp) = def.response {
            self.defs.insert(key(rsp.header), rsp);
        }
    }

    /// Definition for a received header; the version byte is ignored
    pub fn lookup(&self, header: &HlCommonHeader) -> Option<&'static CommandDef> {
        self.defs.get(&key(*header)).copied()
    }

    /// Number of known definitions
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether no definitions are known
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
