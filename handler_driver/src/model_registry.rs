//! Registry of handler models.
//!
//! Maps a configuration model name (e.g. `seiko-ns6040`) to its static
//! [`VendorProfile`]. Constructed at startup and passed to the driver by
//! reference; there is no global table.

use crate::vendor::{self, VendorProfile};
use handler_common::error::DriverError;
use std::collections::HashMap;

/// Registry of available handler models.
pub struct ModelRegistry {
    profiles: HashMap<&'static str, &'static VendorProfile>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// Registry pre-populated with every built-in model.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for profile in vendor::builtin_profiles() {
            reg.register(profile);
        }
        reg
    }

    /// Register a model profile.
    ///
    /// # Panics
    /// Panics if a model with the same name is already registered.
    pub fn register(&mut self, profile: &'static VendorProfile) {
        if self.profiles.contains_key(profile.name) {
            panic!("Handler model '{}' is already registered", profile.name);
        }
        self.profiles.insert(profile.name, profile);
    }

    /// Get a profile by model name. Names are matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&'static VendorProfile> {
        let key = name.trim().to_ascii_lowercase();
        self.profiles.get(key.as_str()).copied()
    }

    /// Resolve the configured model.
    ///
    /// # Errors
    /// Returns `DriverError::Config` if the model is unknown.
    pub fn lookup(&self, name: &str) -> Result<&'static VendorProfile, DriverError> {
        self.get(name).ok_or_else(|| {
            DriverError::Config(format!(
                "unknown handler model '{name}' (known: {})",
                self.list_models().join(", ")
            ))
        })
    }

    /// List all registered model names, sorted.
    pub fn list_models(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.profiles.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
