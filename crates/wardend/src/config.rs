//! Configuration store for wardend.
//!
//! Holds the merged configuration tree and answers dotted-key lookups.
//! Components read through the store on every pass, so a `set` or `reload`
//! takes effect on the next tick. Both announce themselves on the bus as
//! `config.updated`.

use crate::bus::EventBus;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use warden_common::config::{self as schema, ConfigError};
use warden_common::{EventKind, WardenConfig};

pub struct ConfigStore {
    tree: RwLock<Value>,
    bus: Option<Arc<EventBus>>,
}

impl ConfigStore {
    /// Store holding the built-in defaults
    pub fn with_defaults() -> Self {
        Self {
            tree: RwLock::new(schema::default_tree()),
            bus: None,
        }
    }

    /// Load and validate `path` over the defaults. A validation failure here is
    /// the one error that should stop the daemon from starting.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            tree: RwLock::new(schema::load_tree(path)?),
            bus: None,
        })
    }

    /// Build from an explicit tree, merged over defaults and validated
    pub fn from_value(overrides: Value) -> Result<Self, ConfigError> {
        let mut tree = schema::default_tree();
        schema::merge_tree(&mut tree, overrides);
        schema::validate_tree(&tree)?;
        Ok(Self {
            tree: RwLock::new(tree),
            bus: None,
        })
    }

    /// Announce changes on `bus`
    pub fn attach_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Raw value at `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        schema::lookup(&tree, key).cloned()
    }

    /// Typed value at `key`, or `default` if missing or of the wrong shape
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(value) => match serde_json::from_value(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Config key {} has unexpected shape ({}), using default", key, e);
                    default
                }
            },
            None => default,
        }
    }

    /// Set `key` to `value` and publish `config.updated`.
    ///
    /// Rejected (and the old tree kept) if the result no longer validates.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        {
            let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
            let mut candidate = tree.clone();
            schema::assign(&mut candidate, key, value);
            schema::validate_tree(&candidate)?;
            *tree = candidate;
        }
        info!("Config key {} updated", key);
        self.announce(Some(key.to_string()));
        Ok(())
    }

    /// Re-read `path`, swap the tree in, and publish `config.updated`.
    ///
    /// On error the running configuration is left untouched.
    pub fn reload(&self, path: &Path) -> Result<(), ConfigError> {
        let fresh = schema::load_tree(path)?;
        *self.tree.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!("Config reloaded from {}", path.display());
        self.announce(None);
        Ok(())
    }

    /// Typed copy of the current configuration
    pub fn snapshot(&self) -> Result<WardenConfig, ConfigError> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        Ok(serde_json::from_value(tree.clone())?)
    }

    fn announce(&self, key: Option<String>) {
        if let Some(bus) = &self.bus {
            bus.publish(EventKind::ConfigUpdated { key });
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
