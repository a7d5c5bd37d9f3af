//! Namespace snapshots across heterogeneous value types
//!
//! A snapshot walks every key under `namespace:*` in batches. Each batch costs
//! two pipelined round-trips: one `TYPE` per key, then one type-specific read
//! per key. Keys that vanish before their read are skipped; keys whose reply
//! cannot be normalized keep their raw reply instead.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bulk::DEFAULT_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::store::{Command, KvStore, Reply, ValueType};
use crate::transform::ValueCodec;

/// Local key -> normalized value
pub type Snapshot = BTreeMap<String, Value>;

/// Output shape of [`SnapshotEngine::clean_snapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
  #[default]
  Value,
  /// Pretty-printed JSON text
  Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CleanSnapshot {
  Value(Value),
  Text(String),
}

impl CleanSnapshot {
  pub fn into_value(self) -> Option<Value> {
    match self {
      CleanSnapshot::Value(v) => Some(v),
      CleanSnapshot::Text(_) => None,
    }
  }

  pub fn into_text(self) -> Option<String> {
    match self {
      CleanSnapshot::Text(t) => Some(t),
      CleanSnapshot::Value(_) => None,
    }
  }
}

#[derive(Clone)]
pub struct SnapshotEngine {
  store: Arc<dyn KvStore>,
  keys: Arc<KeyCodec>,
  codec: Arc<ValueCodec>,
  batch_size: usize,
}

impl SnapshotEngine {
  pub fn new(
    store: Arc<dyn KvStore>,
    keys: Arc<KeyCodec>,
    codec: Arc<ValueCodec>,
    batch_size: usize,
  ) -> Self {
    Self {
      store,
      keys,
      codec,
      batch_size: if batch_size == 0 {
        DEFAULT_BATCH_SIZE
      } else {
        batch_size
      },
    }
  }

  pub async fn snapshot(&self, namespace: &str) -> Result<Snapshot> {
    self.snapshot_with_batch(namespace, self.batch_size).await
  }

  /// Full snapshot of `namespace` using `batch_size` keys per round-trip pair
  pub async fn snapshot_with_batch(
    &self,
    namespace: &str,
    batch_size: usize,
  ) -> Result<Snapshot> {
    let keys = self.discover(namespace).await?;
    let mut snapshot = Snapshot::new();
    if keys.is_empty() {
      return Ok(snapshot);
    }

    for (index, batch) in keys.chunks(batch_size.max(1)).enumerate() {
      let kinds = self.classify(batch).await?;
      let live: Vec<(&String, ValueType)> = batch
        .iter()
        .zip(kinds)
        .filter(|(_, kind)| *kind != ValueType::None)
        .collect();
      tracing::debug!(
        "Snapshot {} batch {}: {} keys, {} live",
        namespace,
        index,
        batch.len(),
        live.len()
      );
      if live.is_empty() {
        continue;
      }

      let commands = live
        .iter()
        .map(|(key, kind)| fetch_command(kind, key))
        .collect();
      let replies = self
        .store
        .pipeline(commands, false)
        .await
        .map_err(|e| Error::bulk_read(live.len(), e))?;

      for ((key, kind), reply) in live.into_iter().zip(replies) {
        if is_gone(&kind, &reply) {
          tracing::debug!("Skipping {}, deleted after classification", key);
          continue;
        }
        let value = match reply {
          Reply::Error(msg) => match self.refetch(key).await? {
            Some(value) => value,
            None => {
              tracing::debug!("Dropping {} after failed read: {}", key, msg);
              continue;
            }
          },
          reply => self.normalize(key, &kind, reply),
        };
        snapshot.insert(self.keys.strip(key, namespace), value);
      }
    }

    Ok(snapshot)
  }

  /// Snapshot round-tripped through JSON text, as a value or pretty-printed
  pub async fn clean_snapshot(
    &self,
    namespace: &str,
    format: SnapshotFormat,
  ) -> Result<CleanSnapshot> {
    let snapshot = self.snapshot(namespace).await?;
    let text = serde_json::to_string(&snapshot).map_err(|e| Error::Encoding(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| Error::Encoding(e.to_string()))?;

    match format {
      SnapshotFormat::Value => Ok(CleanSnapshot::Value(value)),
      SnapshotFormat::Text => serde_json::to_string_pretty(&value)
        .map(CleanSnapshot::Text)
        .map_err(|e| Error::Encoding(e.to_string())),
    }
  }

  /// Snapshot that assumes every key holds a plain string.
  ///
  /// Skips classification; keys holding another type come back as `null`.
  pub async fn string_snapshot(&self, namespace: &str) -> Result<Snapshot> {
    let keys = self.discover(namespace).await?;
    let mut snapshot = Snapshot::new();

    for batch in keys.chunks(self.batch_size) {
      let commands = batch.iter().map(|k| Command::get(k.as_str())).collect();
      let replies = self
        .store
        .pipeline(commands, false)
        .await
        .map_err(|e| Error::bulk_read(batch.len(), e))?;

      for (key, reply) in batch.iter().zip(replies) {
        let value = match reply {
          Reply::Nil => continue,
          Reply::Error(msg) => {
            tracing::debug!("Non-string key {} in string snapshot: {}", key, msg);
            Value::Null
          }
          other => match other.into_string() {
            Some(raw) => self.codec.decode_or_raw(&raw),
            None => Value::Null,
          },
        };
        snapshot.insert(self.keys.strip(key, namespace), value);
      }
    }

    Ok(snapshot)
  }

  async fn discover(&self, namespace: &str) -> Result<Vec<String>> {
    self.keys.validate_namespace(namespace)?;
    let reply = self
      .store
      .query(Command::Keys(self.keys.pattern(namespace)))
      .await?;
    let mut keys: Vec<String> = reply
      .into_items()
      .unwrap_or_default()
      .into_iter()
      .filter_map(Reply::into_string)
      .collect();
    keys.sort();
    Ok(keys)
  }

  async fn classify(&self, batch: &[String]) -> Result<Vec<ValueType>> {
    let commands = batch.iter().map(|k| Command::Type(k.clone())).collect();
    let replies = self
      .store
      .pipeline(commands, false)
      .await
      .map_err(|e| Error::bulk_read(batch.len(), e))?;

    let mut kinds: Vec<ValueType> = replies
      .into_iter()
      .map(|reply| match reply.as_str() {
        Some(kind) => ValueType::from(kind),
        None => ValueType::Other(format!("{:?}", reply)),
      })
      .collect();
    // A short reply list leaves the tail unclassified; treat it as gone
    kinds.resize(batch.len(), ValueType::None);
    Ok(kinds)
  }

  /// Single-key classify and fetch, for keys whose type changed mid-batch.
  /// `None` when the key is gone.
  async fn refetch(&self, key: &str) -> Result<Option<Value>> {
    let kind = match self.store.query(Command::Type(key.to_string())).await {
      Ok(reply) => reply.as_str().map(ValueType::from).unwrap_or(ValueType::None),
      Err(e) if e.is_connection() => return Err(e),
      Err(_) => ValueType::None,
    };
    if kind == ValueType::None {
      return Ok(None);
    }

    match self.store.query(fetch_command(&kind, key)).await {
      Ok(reply) if is_gone(&kind, &reply) => Ok(None),
      Ok(reply) => Ok(Some(self.normalize(key, &kind, reply))),
      Err(e) if e.is_connection() => Err(e),
      Err(e) => Ok(Some(Value::String(e.to_string()))),
    }
  }

  fn normalize(&self, key: &str, kind: &ValueType, reply: Reply) -> Value {
    let normalized = match kind {
      ValueType::Hash => hash_value(reply.clone()),
      ValueType::List => members_value(reply.clone(), false),
      ValueType::Set => members_value(reply.clone(), true),
      ValueType::ZSet => zset_value(reply.clone()),
      // Strings, and unknown types read back with GET
      _ => reply.as_str().map(|raw| self.codec.decode_or_raw(raw)),
    };

    normalized.unwrap_or_else(|| {
      tracing::warn!("Keeping raw {} reply for {}", kind, key);
      render_reply(reply)
    })
  }
}

/// Read command for a classified key
fn fetch_command(kind: &ValueType, key: &str) -> Command {
  let key = key.to_string();
  match kind {
    ValueType::String => Command::Get(key),
    ValueType::Hash => Command::HGetAll(key),
    ValueType::List => Command::LRange(key, 0, -1),
    ValueType::Set => Command::SMembers(key),
    ValueType::ZSet => Command::ZRangeWithScores(key),
    ValueType::Other(_) | ValueType::None => {
      let err = Error::TypeClassification {
        key: key.clone(),
        kind: kind.to_string(),
      };
      tracing::warn!("{}, falling back to GET", err);
      Command::Get(key)
    }
  }
}

/// The store drops empty aggregates, so an empty read means the key is gone
fn is_gone(kind: &ValueType, reply: &Reply) -> bool {
  match (kind, reply) {
    (_, Reply::Nil) => true,
    (ValueType::Hash | ValueType::List | ValueType::Set | ValueType::ZSet, Reply::Array(items)) => {
      items.is_empty()
    }
    (ValueType::Hash | ValueType::ZSet, Reply::Map(pairs)) => pairs.is_empty(),
    _ => false,
  }
}

fn hash_value(reply: Reply) -> Option<Value> {
  let mut object = Map::new();
  for (field, value) in reply.into_pairs()? {
    object.insert(field.into_string()?, render_reply(value));
  }
  Some(Value::Object(object))
}

fn members_value(reply: Reply, sort: bool) -> Option<Value> {
  let mut members: Vec<String> = reply
    .into_items()?
    .into_iter()
    .map(Reply::into_string)
    .collect::<Option<_>>()?;
  if sort {
    members.sort();
  }
  Some(Value::Array(members.into_iter().map(Value::String).collect()))
}

/// `{member: score}` from either a flat `[m, s, m, s]` reply or `[[m, s], ..]`
fn zset_value(reply: Reply) -> Option<Value> {
  let items = reply.into_items()?;
  let pairs = if items.iter().all(|i| matches!(i, Reply::Array(inner) if inner.len() == 2)) {
    items
      .into_iter()
      .map(Reply::into_pairs)
      .collect::<Option<Vec<_>>>()?
      .into_iter()
      .flatten()
      .collect()
  } else {
    Reply::Array(items).into_pairs()?
  };

  let mut object = Map::new();
  for (member, score) in pairs {
    object.insert(member.into_string()?, score_value(score.as_f64()?));
  }
  Some(Value::Object(object))
}

/// Whole scores render as integers
fn score_value(score: f64) -> Value {
  if score.fract() == 0.0 && score.abs() < i64::MAX as f64 {
    Value::from(score as i64)
  } else {
    Number::from_f64(score)
      .map(Value::Number)
      .unwrap_or_else(|| Value::String(score.to_string()))
  }
}

/// Plain JSON rendering of any reply
fn render_reply(reply: Reply) -> Value {
  match reply {
    Reply::Nil => Value::Null,
    Reply::Status(s) | Reply::Bulk(s) | Reply::Error(s) => Value::String(s),
    Reply::Int(i) => Value::from(i),
    Reply::Double(d) => score_value(d),
    Reply::Array(items) => Value::Array(items.into_iter().map(render_reply).collect()),
    Reply::Map(pairs) => {
      let mut object = Map::new();
      for (k, v) in pairs {
        let key = match render_reply(k) {
          Value::String(s) => s,
          other => other.to_string(),
        };
        object.insert(key, render_reply(v));
      }
      Value::Object(object)
    }
  }
}
