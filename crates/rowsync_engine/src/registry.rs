//! Named setup registry.
//!
//! An explicit object the embedder passes around, not ambient module
//! state. Each named setup maps to one engine configuration; registering
//! a name twice fails.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use std::collections::HashMap;

/// The default setup name.
pub const DEFAULT_SETUP: &str = "default";

/// Maps setup names to engine configurations.
#[derive(Debug, Default)]
pub struct SetupRegistry {
    setups: HashMap<String, EngineConfig>,
}

impl SetupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named setup; collisions fail.
    pub fn register(&mut self, name: impl Into<String>, config: EngineConfig) -> SyncResult<()> {
        let name = name.into();
        if self.setups.contains_key(&name) {
            return Err(SyncError::DuplicateSetup { name });
        }
        self.setups.insert(name, config);
        Ok(())
    }

    /// Looks up a setup by name.
    pub fn get(&self, name: &str) -> Option<&EngineConfig> {
        self.setups.get(name)
    }

    /// Removes a setup, returning its configuration.
    pub fn remove(&mut self, name: &str) -> Option<EngineConfig> {
        self.setups.remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.setups.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
