//! Scanner property store.
//!
//! Holds the `sonar.*` configuration flags for one engine instance. Keys are
//! unique (last write wins) and the map is rendered to `-D<key>=<value>`
//! command-line arguments at every invocation. The scanner does not care
//! about flag order; a `BTreeMap` keeps the rendered command line stable for
//! logs and tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property key the exclusion ledger projects into.
pub const PROP_SONAR_EXCLUSIONS: &str = "sonar.exclusions";

/// Mutable key/value store of scanner configuration properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScannerProperties {
    entries: BTreeMap<String, String>,
}

impl ScannerProperties {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an existing key/value map (config file contents).
    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Look up a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set a property, replacing any previous value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Number of stored properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render every property as one `-D<key>=<value>` flag.
    pub fn to_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("-D{}={}", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut props = ScannerProperties::new();
        props.set("sonar.host.url", "http://sonar:9000");
        props.set("sonar.host.url", "http://sonar:9001");

        assert_eq!(props.len(), 1);
        assert_eq!(props.get("sonar.host.url"), Some("http://sonar:9001"));
    }

    #[test]
    fn test_to_args_renders_d_flags_in_key_order() {
        let mut props = ScannerProperties::new();
        props.set("sonar.projectKey", "erp");
        props.set("sonar.host.url", "http://sonar:9000");

        assert_eq!(
            props.to_args(),
            vec![
                "-Dsonar.host.url=http://sonar:9000".to_string(),
                "-Dsonar.projectKey=erp".to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_store_renders_no_args() {
        let props = ScannerProperties::new();
        assert!(props.is_empty());
        assert!(props.to_args().is_empty());
    }

    #[test]
    fn test_from_map_preserves_entries() {
        let mut map = BTreeMap::new();
        map.insert("sonar.sources".to_string(), "src".to_string());
        let props = ScannerProperties::from_map(map);

        assert_eq!(props.get("sonar.sources"), Some("src"));
    }
}
