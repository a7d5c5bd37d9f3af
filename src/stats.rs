//! Performance counters for the transform pipeline

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_evictions: u64,
  pub cache_size: usize,
  pub compressions: u64,
  pub compression_time_us: u64,
  pub decompressions: u64,
  pub decompression_time_us: u64,
}

impl PerformanceStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.cache_hits + self.cache_misses;
    if total == 0 {
      0.0
    } else {
      self.cache_hits as f64 / total as f64
    }
  }

  pub fn avg_compression_us(&self) -> f64 {
    if self.compressions == 0 {
      0.0
    } else {
      self.compression_time_us as f64 / self.compressions as f64
    }
  }

  pub fn avg_decompression_us(&self) -> f64 {
    if self.decompressions == 0 {
      0.0
    } else {
      self.decompression_time_us as f64 / self.decompressions as f64
    }
  }
}

/// Monotonic counters, reset only on request
#[derive(Debug, Default)]
pub struct PerformanceCounters {
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  cache_evictions: AtomicU64,
  compressions: AtomicU64,
  compression_time_us: AtomicU64,
  decompressions: AtomicU64,
  decompression_time_us: AtomicU64,
}

impl PerformanceCounters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_evictions(&self, count: usize) {
    self
      .cache_evictions
      .fetch_add(count as u64, Ordering::Relaxed);
  }

  pub fn record_compression(&self, elapsed: Duration) {
    self.compressions.fetch_add(1, Ordering::Relaxed);
    self
      .compression_time_us
      .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
  }

  pub fn record_decompression(&self, elapsed: Duration) {
    self.decompressions.fetch_add(1, Ordering::Relaxed);
    self
      .decompression_time_us
      .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
  }

  pub fn snapshot(&self, cache_size: usize) -> PerformanceStats {
    PerformanceStats {
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
      cache_size,
      compressions: self.compressions.load(Ordering::Relaxed),
      compression_time_us: self.compression_time_us.load(Ordering::Relaxed),
      decompressions: self.decompressions.load(Ordering::Relaxed),
      decompression_time_us: self.decompression_time_us.load(Ordering::Relaxed),
    }
  }

  pub fn reset(&self) {
    for counter in [
      &self.cache_hits,
      &self.cache_misses,
      &self.cache_evictions,
      &self.compressions,
      &self.compression_time_us,
      &self.decompressions,
      &self.decompression_time_us,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
  }
}
