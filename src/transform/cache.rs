//! Bounded transform result cache

use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Characters of input that feed the fingerprint hash
pub const FINGERPRINT_PREFIX_CHARS: usize = 100;

/// Share of the ceiling dropped when the cache fills up
const EVICTION_FRACTION: f64 = 0.2;

/// Which way a payload is being transformed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  Compress,
  Decompress,
}

impl Direction {
  fn tag(self) -> char {
    match self {
      Direction::Compress => 'c',
      Direction::Decompress => 'd',
    }
  }
}

/// Content fingerprint: rolling hash of the first 100 characters plus the full length.
///
/// Not a digest. Two inputs of equal length whose first 100 characters hash the
/// same share a slot; [`TransformCache`] tells them apart by their source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
  direction: Direction,
  len: usize,
  hash: u32,
}

impl Fingerprint {
  pub fn of(direction: Direction, input: &str) -> Self {
    let hash = input
      .chars()
      .take(FINGERPRINT_PREFIX_CHARS)
      .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));
    Self {
      direction,
      len: input.len(),
      hash,
    }
  }

  pub fn direction(&self) -> Direction {
    self.direction
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{:x}:{:08x}", self.direction.tag(), self.len, self.hash)
  }
}

#[derive(Debug)]
struct Entry {
  source: String,
  result: String,
}

/// Fingerprint -> transformed payload, evicting in insertion order.
///
/// Each slot keeps the input it was computed from, and a lookup only hits when
/// that input matches, so colliding fingerprints never return another payload.
#[derive(Debug)]
pub struct TransformCache {
  entries: HashMap<Fingerprint, Entry>,
  order: VecDeque<Fingerprint>,
  ceiling: usize,
}

impl TransformCache {
  pub fn new(ceiling: usize) -> Self {
    let ceiling = ceiling.max(1);
    Self {
      entries: HashMap::with_capacity(ceiling),
      order: VecDeque::with_capacity(ceiling),
      ceiling,
    }
  }

  /// Cached result for `source`, if its slot was filled from the same input
  pub fn get(&self, fingerprint: &Fingerprint, source: &str) -> Option<&str> {
    self
      .entries
      .get(fingerprint)
      .filter(|entry| entry.source == source)
      .map(|entry| entry.result.as_str())
  }

  /// Insert a result, returning how many entries were evicted to make room.
  /// A colliding input takes over the slot.
  pub fn put(&mut self, fingerprint: Fingerprint, source: &str, result: String) -> usize {
    if let Some(existing) = self.entries.get_mut(&fingerprint) {
      existing.source = source.to_string();
      existing.result = result;
      return 0;
    }

    let evicted = if self.entries.len() >= self.ceiling {
      self.evict_oldest()
    } else {
      0
    };

    self.entries.insert(
      fingerprint,
      Entry {
        source: source.to_string(),
        result,
      },
    );
    self.order.push_back(fingerprint);
    evicted
  }

  fn evict_oldest(&mut self) -> usize {
    let count = ((self.ceiling as f64 * EVICTION_FRACTION) as usize).max(1);
    let mut evicted = 0;
    while evicted < count {
      match self.order.pop_front() {
        Some(oldest) => {
          if self.entries.remove(&oldest).is_some() {
            evicted += 1;
          }
        }
        None => break,
      }
    }
    evicted
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.order.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn ceiling(&self) -> usize {
    self.ceiling
  }
}
