//! Secret sources for container environment injection.
//!
//! Server configs store only environment-variable *names*. Values are
//! resolved here at start time and handed straight to the container engine;
//! they are never persisted or logged.

use std::collections::HashMap;

/// Resolves secret names to values.
pub trait SecretSource: Send + Sync {
    /// Resolve `names` in order. Names without a value are omitted from the
    /// result and logged by name only.
    fn resolve(&self, names: &[String]) -> HashMap<String, String>;
}

/// Reads secrets from the bridge process's own environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn resolve(&self, names: &[String]) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for name in names {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    values.insert(name.clone(), value);
                }
                _ => tracing::debug!(secret = %name, "secret not set, skipping"),
            }
        }
        values
    }
}

/// Fixed in-memory secrets, for embedding callers that manage their own
/// key store.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretSource for StaticSecrets {
    fn resolve(&self, names: &[String]) -> HashMap<String, String> {
        names
            .iter()
            .filter_map(|name| match self.values.get(name) {
                Some(value) => Some((name.clone(), value.clone())),
                None => {
                    tracing::debug!(secret = %name, "secret not configured, skipping");
                    None
                }
            })
            .collect()
    }
}

/// Merge the bridge-wide default names with a server's own list, keeping the
/// first occurrence of each name.
pub fn merge_names(defaults: &[String], own: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(defaults.len() + own.len());
    for name in defaults.iter().chain(own) {
        let name = name.trim();
        if !name.is_empty() && !merged.iter().any(|n| n == name) {
            merged.push(name.to_string());
        }
    }
    merged
}
