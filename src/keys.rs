//! Namespaced key codec

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Error, Result};

pub const DEFAULT_SEPARATOR: char = ':';

/// Builds and parses `namespace:key` strings.
///
/// Keeps a per-instance cache of rendered `namespace:` prefixes so hot namespaces
/// are formatted once.
#[derive(Debug)]
pub struct KeyCodec {
  separator: char,
  prefixes: RwLock<HashMap<String, String>>,
}

impl Default for KeyCodec {
  fn default() -> Self {
    Self::new(DEFAULT_SEPARATOR)
  }
}

impl KeyCodec {
  pub fn new(separator: char) -> Self {
    Self {
      separator,
      prefixes: RwLock::new(HashMap::new()),
    }
  }

  pub fn separator(&self) -> char {
    self.separator
  }

  /// Reject namespaces that would break the first-separator split
  pub fn validate_namespace(&self, namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(self.separator) {
      return Err(Error::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
  }

  /// `namespace` + separator, memoised
  pub fn prefix(&self, namespace: &str) -> String {
    if let Some(prefix) = self.prefixes.read().get(namespace) {
      return prefix.clone();
    }
    let prefix = format!("{}{}", namespace, self.separator);
    self
      .prefixes
      .write()
      .insert(namespace.to_string(), prefix.clone());
    prefix
  }

  pub fn compose(&self, namespace: &str, local_key: &str) -> String {
    let mut key = self.prefix(namespace);
    key.push_str(local_key);
    key
  }

  /// Remove the namespace prefix. Keys without the prefix come back unchanged.
  pub fn strip(&self, key: &str, namespace: &str) -> String {
    let prefix = self.prefix(namespace);
    key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string()
  }

  /// Glob matching every key under `namespace`
  pub fn pattern(&self, namespace: &str) -> String {
    let mut pattern = self.prefix(namespace);
    pattern.push('*');
    pattern
  }

  /// Split on the first separator into `(namespace, local_key)`
  pub fn split<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
    key.split_once(self.separator)
  }

  /// Drop memoised prefixes
  pub fn clear(&self) {
    self.prefixes.write().clear();
  }

  pub fn cached_prefixes(&self) -> usize {
    self.prefixes.read().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_compose_strip_roundtrip() {
    let codec = KeyCodec::default();
    for (ns, key) in [
      ("users", "42"),
      ("users", ""),
      ("cfg", "nested:key:with:colons"),
      ("a", "ünïcode"),
    ] {
      let composed = codec.compose(ns, key);
      assert_eq!(codec.strip(&composed, ns), key);
      assert_eq!(codec.split(&composed), Some((ns, key)));
    }
  }

  #[test]
  fn test_strip_foreign_key_is_unchanged() {
    let codec = KeyCodec::default();
    assert_eq!(codec.strip("orders:1", "users"), "orders:1");
    assert_eq!(codec.strip("users", "users"), "users");
  }

  #[test]
  fn test_pattern_and_prefix_cache() {
    let codec = KeyCodec::default();
    assert_eq!(codec.pattern("sessions"), "sessions:*");
    codec.compose("sessions", "a");
    assert_eq!(codec.cached_prefixes(), 1);
    codec.clear();
    assert_eq!(codec.cached_prefixes(), 0);
  }

  #[test]
  fn test_validate_namespace() {
    let codec = KeyCodec::default();
    assert!(codec.validate_namespace("users").is_ok());
    assert!(codec.validate_namespace("").is_err());
    assert!(codec.validate_namespace("a:b").is_err());

    let slash = KeyCodec::new('/');
    assert!(slash.validate_namespace("a:b").is_ok());
    assert_eq!(slash.compose("a:b", "c"), "a:b/c");
  }
}
