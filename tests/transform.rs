use serde_json::json;
use stash::config::CompressionConfig;
use stash::transform::{Direction, Fingerprint, TransformCache};
use stash::{Error, ValueCodec};

fn codec(enabled: bool, ceiling: usize) -> ValueCodec {
  ValueCodec::new(
    CompressionConfig {
      enabled,
      level: 6,
    },
    ceiling,
  )
}

// =============================================================================
// Compression Round Trip Tests
// =============================================================================

#[test]
fn test_roundtrip_preserves_serialized_form() {
  let codec = codec(true, 1000);
  let values = [
    json!({"id": 7, "name": "widget", "tags": ["a", "b"], "price": 9.99}),
    json!([1, 2, 3, {"nested": [null, false]}]),
    json!("plain text with ünïcödé and emoji 🐿"),
    json!(12345),
    json!(true),
    json!(null),
    json!("x".repeat(10_000)),
  ];

  for value in values {
    let serialized = codec.serialize(&value).unwrap();
    let compressed = codec.compress(&serialized).unwrap();
    assert_ne!(compressed, serialized);
    assert_eq!(codec.decompress(&compressed).unwrap(), serialized);
  }
}

#[test]
fn test_disabled_pipeline_is_identity() {
  let codec = codec(false, 1000);
  for input in ["", "abc", r#"{"a":1}"#, "not base64 !!"] {
    assert_eq!(codec.compress(input).unwrap(), input);
    assert_eq!(codec.decompress(input).unwrap(), input);
  }
  let stats = codec.stats();
  assert_eq!(stats.compressions, 0);
  assert_eq!(stats.cache_size, 0);
}

#[test]
fn test_compressed_output_is_base64() {
  let codec = codec(true, 1000);
  let compressed = codec.compress("hello hello hello hello").unwrap();
  assert!(compressed
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
}

#[test]
fn test_decompression_failure_is_scoped() {
  let codec = codec(true, 1000);
  assert!(matches!(
    codec.decompress("definitely not compressed"),
    Err(Error::Decompression(_))
  ));
  assert!(matches!(codec.decode("BwA="), Err(Error::Decompression(_))));
  assert_eq!(codec.decode_or_raw("BwA="), json!("BwA="));
}

#[test]
fn test_decode_restores_json_types() {
  let codec = codec(true, 1000);
  let stored = codec.encode(&json!({"a": [1, 2]})).unwrap();
  assert_eq!(codec.decode(&stored).unwrap(), json!({"a": [1, 2]}));

  // Scalars come back as their text
  let stored = codec.encode(&json!(42)).unwrap();
  assert_eq!(codec.decode(&stored).unwrap(), json!("42"));
}

// =============================================================================
// Transform Cache Tests
// =============================================================================

#[test]
fn test_cache_eviction_drops_oldest_fifth() {
  let ceiling = 50;
  let mut cache = TransformCache::new(ceiling);
  let sources: Vec<String> = (0..=ceiling).map(|i| format!("payload-{}", i)).collect();
  let fingerprints: Vec<Fingerprint> = sources
    .iter()
    .map(|s| Fingerprint::of(Direction::Compress, s))
    .collect();

  for (i, fp) in fingerprints.iter().enumerate() {
    cache.put(*fp, &sources[i], format!("result-{}", i));
  }

  assert!(cache.len() <= ceiling);
  for (fp, source) in fingerprints.iter().zip(&sources).take(10) {
    assert!(cache.get(fp, source).is_none());
  }
  for (fp, source) in fingerprints.iter().zip(&sources).skip(10) {
    assert!(cache.get(fp, source).is_some());
  }
}

#[test]
fn test_codec_cache_respects_ceiling() {
  let codec = codec(true, 10);
  for i in 0..25 {
    codec.compress(&format!("distinct payload number {}", i)).unwrap();
  }
  let stats = codec.stats();
  assert!(stats.cache_size <= 10);
  assert!(stats.cache_evictions > 0);
}

#[test]
fn test_clear_cache_twice() {
  let codec = codec(true, 100);
  codec.compress("something").unwrap();
  assert_eq!(codec.cache_len(), 1);

  codec.clear_cache();
  assert_eq!(codec.cache_len(), 0);
  codec.clear_cache();
  assert_eq!(codec.cache_len(), 0);
}

#[test]
fn test_directions_do_not_share_entries() {
  let compress = Fingerprint::of(Direction::Compress, "same input");
  let decompress = Fingerprint::of(Direction::Decompress, "same input");
  assert_ne!(compress, decompress);
  assert_ne!(compress.to_string(), decompress.to_string());
}

#[test]
fn test_fingerprint_includes_length() {
  let prefix = "p".repeat(100);
  let short = Fingerprint::of(Direction::Compress, &format!("{}a", prefix));
  let long = Fingerprint::of(Direction::Compress, &format!("{}ab", prefix));
  assert_ne!(short, long);
}

// =============================================================================
// Performance Stats Tests
// =============================================================================

#[test]
fn test_stats_reset_reports_zero() {
  let codec = codec(true, 100);
  let compressed = codec.compress("payload").unwrap();
  codec.compress("payload").unwrap();
  codec.decompress(&compressed).unwrap();

  let stats = codec.stats();
  assert_eq!(stats.cache_hits, 1);
  assert_eq!(stats.compressions, 1);
  assert_eq!(stats.decompressions, 1);

  codec.reset_stats();
  let stats = codec.stats();
  assert_eq!(stats.cache_hits, 0);
  assert_eq!(stats.cache_misses, 0);
  assert_eq!(stats.cache_evictions, 0);
  assert_eq!(stats.compressions, 0);
  assert_eq!(stats.decompressions, 0);
  assert_eq!(stats.compression_time_us, 0);
  assert_eq!(stats.hit_rate(), 0.0);
}
