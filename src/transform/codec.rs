//! Value serialization and compression pipeline

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::time::Instant;

use super::cache::{Direction, Fingerprint, TransformCache};
use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::stats::{PerformanceCounters, PerformanceStats};

/// Serializes values to store strings and back, compressing through a shared
/// transform cache when enabled.
#[derive(Debug)]
pub struct ValueCodec {
  compression: CompressionConfig,
  cache: Mutex<TransformCache>,
  counters: PerformanceCounters,
}

impl ValueCodec {
  pub fn new(compression: CompressionConfig, cache_ceiling: usize) -> Self {
    Self {
      compression,
      cache: Mutex::new(TransformCache::new(cache_ceiling)),
      counters: PerformanceCounters::new(),
    }
  }

  pub fn compression_enabled(&self) -> bool {
    self.compression.enabled
  }

  /// Strings pass through; everything else becomes JSON text
  pub fn serialize(&self, value: &Value) -> Result<String> {
    match value {
      Value::String(s) => Ok(s.clone()),
      other => serde_json::to_string(other).map_err(|e| Error::Encoding(e.to_string())),
    }
  }

  pub fn serialize_as<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
    let value = serde_json::to_value(value).map_err(|e| Error::Encoding(e.to_string()))?;
    self.serialize(&value)
  }

  /// Deflate + base64, or the input unchanged when compression is off
  pub fn compress(&self, input: &str) -> Result<String> {
    if !self.compression.enabled {
      return Ok(input.to_string());
    }

    let fingerprint = Fingerprint::of(Direction::Compress, input);
    if let Some(hit) = self.lookup(&fingerprint, input) {
      return Ok(hit);
    }

    let started = Instant::now();
    let level = Compression::new(self.compression.level.min(9));
    let mut encoder = DeflateEncoder::new(Vec::new(), level);
    encoder
      .write_all(input.as_bytes())
      .map_err(|e| Error::Compression(e.to_string()))?;
    let compressed = encoder
      .finish()
      .map_err(|e| Error::Compression(e.to_string()))?;
    let encoded = STANDARD.encode(compressed);
    self.counters.record_compression(started.elapsed());

    self.store(fingerprint, input, encoded.clone());
    Ok(encoded)
  }

  /// Inverse of [`compress`](Self::compress)
  pub fn decompress(&self, input: &str) -> Result<String> {
    if !self.compression.enabled {
      return Ok(input.to_string());
    }

    let fingerprint = Fingerprint::of(Direction::Decompress, input);
    if let Some(hit) = self.lookup(&fingerprint, input) {
      return Ok(hit);
    }

    let started = Instant::now();
    let compressed = STANDARD
      .decode(input.trim())
      .map_err(|e| Error::Decompression(e.to_string()))?;
    let mut decoder = DeflateDecoder::new(&compressed[..]);
    let mut output = String::new();
    decoder
      .read_to_string(&mut output)
      .map_err(|e| Error::Decompression(e.to_string()))?;
    self.counters.record_decompression(started.elapsed());

    self.store(fingerprint, input, output.clone());
    Ok(output)
  }

  /// Serialize then compress
  pub fn encode(&self, value: &Value) -> Result<String> {
    self.compress(&self.serialize(value)?)
  }

  /// Decompress then JSON-decode, keeping non-JSON payloads as strings
  pub fn decode(&self, stored: &str) -> Result<Value> {
    let text = self.decompress(stored)?;
    Ok(parse_if_json(&text).unwrap_or(Value::String(text)))
  }

  /// Like [`decode`](Self::decode) but a payload that fails to decompress comes back raw
  pub fn decode_or_raw(&self, stored: &str) -> Value {
    match self.decode(stored) {
      Ok(value) => value,
      Err(e) => {
        tracing::debug!("Keeping raw value after decode failure: {}", e);
        parse_if_json(stored).unwrap_or_else(|| Value::String(stored.to_string()))
      }
    }
  }

  fn lookup(&self, fingerprint: &Fingerprint, source: &str) -> Option<String> {
    let hit = self.cache.lock().get(fingerprint, source).map(str::to_string);
    match hit {
      Some(result) => {
        self.counters.record_hit();
        Some(result)
      }
      None => {
        self.counters.record_miss();
        None
      }
    }
  }

  fn store(&self, fingerprint: Fingerprint, source: &str, result: String) {
    let evicted = self.cache.lock().put(fingerprint, source, result);
    if evicted > 0 {
      self.counters.record_evictions(evicted);
      tracing::debug!("Transform cache evicted {} entries", evicted);
    }
  }

  pub fn clear_cache(&self) {
    self.cache.lock().clear();
  }

  pub fn cache_len(&self) -> usize {
    self.cache.lock().len()
  }

  pub fn stats(&self) -> PerformanceStats {
    self.counters.snapshot(self.cache_len())
  }

  pub fn reset_stats(&self) {
    self.counters.reset();
  }
}

/// Parse `text` as JSON only when it looks like an object or array.
///
/// `None` means "not JSON" and is distinct from a parsed `null`; callers fall
/// back to the raw string on `None`.
pub fn parse_if_json(text: &str) -> Option<Value> {
  match text.trim_start().as_bytes().first() {
    Some(b'{') | Some(b'[') => serde_json::from_str(text).ok(),
    _ => None,
  }
}
