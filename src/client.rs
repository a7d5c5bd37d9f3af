//! The `Stash` client
//!
//! Every operation takes a namespace and a local key; the client composes the
//! store key, encodes values through the shared [`ValueCodec`] and retries a
//! single-key command once when the connection drops underneath it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::bulk::{BulkExecutor, EntryOutcome};
use crate::config::{ConnectionTarget, StashConfig};
use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::notify::{ChangeEvent, NotificationRouter, RouterState};
use crate::snapshot::{CleanSnapshot, Snapshot, SnapshotEngine, SnapshotFormat};
use crate::stats::PerformanceStats;
use crate::store::{Command, KvStore, MemoryStore, PubSubConnector, RedisStore, Reply};
use crate::transform::{parse_if_json, ValueCodec};

pub struct Stash {
  store: Arc<dyn KvStore>,
  keys: Arc<KeyCodec>,
  codec: Arc<ValueCodec>,
  bulk: BulkExecutor,
  snapshots: SnapshotEngine,
  notifications: NotificationRouter,
  default_ttl: Option<u64>,
}

impl Stash {
  /// Connect to the store described by `config.connection`
  pub async fn connect(config: &StashConfig) -> Result<Self> {
    Self::connect_to(config.connection.clone(), config).await
  }

  /// Connect to `target`, taking every other setting from `config`
  pub async fn connect_to(
    target: impl Into<ConnectionTarget>,
    config: &StashConfig,
  ) -> Result<Self> {
    let store = RedisStore::connect(target).await?;
    let database = store.descriptor().database;
    let pubsub = Arc::new(store.pubsub());
    Ok(Self::with_backend(Arc::new(store), pubsub, database, config))
  }

  /// Client over an in-process store
  pub fn in_memory(config: &StashConfig) -> Self {
    Self::with_store(Arc::new(MemoryStore::new()), config)
  }

  /// Client over a store that also opens its own subscription connections
  pub fn with_store<S>(store: Arc<S>, config: &StashConfig) -> Self
  where
    S: KvStore + PubSubConnector + 'static,
  {
    Self::with_backend(store.clone(), store, config.connection.database, config)
  }

  pub fn with_backend(
    store: Arc<dyn KvStore>,
    pubsub: Arc<dyn PubSubConnector>,
    database: u8,
    config: &StashConfig,
  ) -> Self {
    let keys = Arc::new(KeyCodec::new(config.keys.separator));
    let codec = Arc::new(ValueCodec::new(
      config.compression.clone(),
      config.transform_cache.ceiling,
    ));

    let batch_size = config.batch_size;
    Self {
      bulk: BulkExecutor::new(store.clone(), keys.clone(), codec.clone(), batch_size),
      snapshots: SnapshotEngine::new(store.clone(), keys.clone(), codec.clone(), batch_size),
      notifications: NotificationRouter::new(
        store.clone(),
        pubsub,
        keys.clone(),
        database,
        config.notifications.clone(),
      ),
      store,
      keys,
      codec,
      default_ttl: config.default_ttl(),
    }
  }

  pub fn store(&self) -> &Arc<dyn KvStore> {
    &self.store
  }

  pub fn keys(&self) -> &KeyCodec {
    &self.keys
  }

  pub fn codec(&self) -> &ValueCodec {
    &self.codec
  }

  // ==========================================================================
  // Single keys
  // ==========================================================================

  /// Store `value`, expiring after `ttl` seconds (or the configured default)
  pub async fn set(
    &self,
    namespace: &str,
    key: &str,
    value: &Value,
    ttl: Option<u64>,
  ) -> Result<()> {
    let payload = self.codec.encode(value)?;
    let full_key = self.full_key(namespace, key)?;
    self
      .query(Command::set(full_key, payload, ttl.or(self.default_ttl)))
      .await?;
    Ok(())
  }

  pub async fn set_typed<T: Serialize + ?Sized>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    ttl: Option<u64>,
  ) -> Result<()> {
    let payload = self.codec.compress(&self.codec.serialize_as(value)?)?;
    let full_key = self.full_key(namespace, key)?;
    self
      .query(Command::set(full_key, payload, ttl.or(self.default_ttl)))
      .await?;
    Ok(())
  }

  /// Stored value, JSON-decoded when it holds an object or array.
  ///
  /// Scalars read back as their text: `set(json!(42))` returns `Some(json!("42"))`.
  /// Use [`Stash::get_typed`] to recover the original type.
  pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
    Ok(
      self
        .get_raw(namespace, key)
        .await?
        .map(|raw| self.codec.decode_or_raw(&raw)),
    )
  }

  /// Stored value deserialized as `T`. Plain strings deserialize as JSON strings.
  pub async fn get_typed<T: DeserializeOwned>(
    &self,
    namespace: &str,
    key: &str,
  ) -> Result<Option<T>> {
    let Some(raw) = self.get_raw(namespace, key).await? else {
      return Ok(None);
    };
    let text = self.codec.decompress(&raw)?;
    match serde_json::from_str(&text) {
      Ok(value) => Ok(Some(value)),
      Err(_) => serde_json::from_value(Value::String(text))
        .map(Some)
        .map_err(|e| Error::Encoding(e.to_string())),
    }
  }

  async fn get_raw(&self, namespace: &str, key: &str) -> Result<Option<String>> {
    let reply = self.query(Command::Get(self.full_key(namespace, key)?)).await?;
    Ok(reply.into_string())
  }

  /// Returns whether the key existed
  pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
    let reply = self.query(Command::del(self.full_key(namespace, key)?)).await?;
    Ok(reply.as_i64().unwrap_or(0) > 0)
  }

  pub async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
    let reply = self.query(Command::Exists(self.full_key(namespace, key)?)).await?;
    Ok(reply.as_i64().unwrap_or(0) > 0)
  }

  /// Returns false when the key does not exist
  pub async fn expire(&self, namespace: &str, key: &str, seconds: u64) -> Result<bool> {
    let reply = self
      .query(Command::Expire(self.full_key(namespace, key)?, seconds))
      .await?;
    Ok(reply.as_i64().unwrap_or(0) > 0)
  }

  /// Remaining time to live in seconds; -1 without expiry, -2 when missing
  pub async fn ttl(&self, namespace: &str, key: &str) -> Result<i64> {
    let reply = self.query(Command::Ttl(self.full_key(namespace, key)?)).await?;
    Ok(reply.as_i64().unwrap_or(-2))
  }

  pub async fn incr_by(&self, namespace: &str, key: &str, delta: i64) -> Result<i64> {
    let reply = self
      .query(Command::IncrBy(self.full_key(namespace, key)?, delta))
      .await?;
    reply
      .as_i64()
      .ok_or_else(|| Error::Store(format!("INCRBY returned {:?}", reply)))
  }

  pub async fn decr_by(&self, namespace: &str, key: &str, delta: i64) -> Result<i64> {
    self.incr_by(namespace, key, delta.wrapping_neg()).await
  }

  // ==========================================================================
  // Hashes
  // ==========================================================================

  /// Set hash fields; returns how many were new
  pub async fn hset<F: AsRef<str>>(
    &self,
    namespace: &str,
    key: &str,
    fields: &[(F, Value)],
  ) -> Result<i64> {
    if fields.is_empty() {
      return Ok(0);
    }
    let pairs = fields
      .iter()
      .map(|(field, value)| Ok((field.as_ref().to_string(), self.codec.serialize(value)?)))
      .collect::<Result<Vec<_>>>()?;
    let reply = self
      .query(Command::HSet(self.full_key(namespace, key)?, pairs))
      .await?;
    Ok(reply.as_i64().unwrap_or(0))
  }

  pub async fn hget(&self, namespace: &str, key: &str, field: &str) -> Result<Option<Value>> {
    let reply = self
      .query(Command::HGet(self.full_key(namespace, key)?, field.to_string()))
      .await?;
    Ok(reply.into_string().map(field_value))
  }

  pub async fn hgetall(&self, namespace: &str, key: &str) -> Result<HashMap<String, Value>> {
    let reply = self.query(Command::HGetAll(self.full_key(namespace, key)?)).await?;
    let pairs = reply
      .into_pairs()
      .ok_or_else(|| Error::Store("malformed HGETALL reply".to_string()))?;
    Ok(
      pairs
        .into_iter()
        .filter_map(|(field, value)| {
          Some((field.into_string()?, field_value(value.into_string()?)))
        })
        .collect(),
    )
  }

  /// Returns how many fields were removed
  pub async fn hdel<F: AsRef<str>>(
    &self,
    namespace: &str,
    key: &str,
    fields: &[F],
  ) -> Result<i64> {
    if fields.is_empty() {
      return Ok(0);
    }
    let fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
    let reply = self
      .query(Command::HDel(self.full_key(namespace, key)?, fields))
      .await?;
    Ok(reply.as_i64().unwrap_or(0))
  }

  // ==========================================================================
  // Scripts and pipelines
  // ==========================================================================

  /// Run a Lua script atomically; `keys` are local to `namespace`
  pub async fn eval<K: AsRef<str>, A: ToString>(
    &self,
    namespace: &str,
    script: &str,
    keys: &[K],
    args: &[A],
  ) -> Result<Reply> {
    let keys = keys
      .iter()
      .map(|k| self.full_key(namespace, k.as_ref()))
      .collect::<Result<Vec<_>>>()?;
    self
      .query(Command::Eval {
        script: script.to_string(),
        keys,
        args: args.iter().map(ToString::to_string).collect(),
      })
      .await
  }

  /// Start a batch of namespaced commands sent in one round-trip
  pub fn pipeline(&self) -> Pipeline<'_> {
    Pipeline {
      stash: self,
      commands: Vec::new(),
      atomic: false,
      error: None,
    }
  }

  /// Send a raw command; keys in it are used as given, without a namespace
  pub async fn command(&self, cmd: Command) -> Result<Reply> {
    self.query(cmd).await
  }

  pub async fn ping(&self) -> Result<Duration> {
    let started = Instant::now();
    self.query(Command::Ping).await?;
    Ok(started.elapsed())
  }

  // ==========================================================================
  // Bulk operations
  // ==========================================================================

  /// Write many entries, in pipelined slices of the configured batch size
  pub async fn set_many<K, I>(
    &self,
    namespace: &str,
    entries: I,
    ttl: Option<u64>,
  ) -> Result<Vec<EntryOutcome>>
  where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
  {
    let entries: Vec<(String, Value)> =
      entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
    self
      .bulk
      .set_many_chunked(namespace, &entries, ttl.or(self.default_ttl))
      .await
  }

  /// Read many keys, in pipelined slices. Values decode as in [`Stash::get`],
  /// so scalars come back as strings; unreadable entries map to `None`.
  pub async fn get_many<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<HashMap<String, Option<Value>>> {
    self.bulk.get_many_chunked(namespace, keys).await
  }

  pub async fn delete_many<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<Vec<EntryOutcome>> {
    self.bulk.delete_many_chunked(namespace, keys).await
  }

  // ==========================================================================
  // Snapshots
  // ==========================================================================

  pub async fn snapshot(&self, namespace: &str) -> Result<Snapshot> {
    self.snapshots.snapshot(namespace).await
  }

  pub async fn snapshot_with_batch(&self, namespace: &str, batch_size: usize) -> Result<Snapshot> {
    self.snapshots.snapshot_with_batch(namespace, batch_size).await
  }

  pub async fn clean_snapshot(
    &self,
    namespace: &str,
    format: SnapshotFormat,
  ) -> Result<CleanSnapshot> {
    self.snapshots.clean_snapshot(namespace, format).await
  }

  pub async fn string_snapshot(&self, namespace: &str) -> Result<Snapshot> {
    self.snapshots.string_snapshot(namespace).await
  }

  // ==========================================================================
  // Change notifications
  // ==========================================================================

  pub async fn subscribe<I, S>(&self, namespaces: I) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.notifications.subscribe(namespaces).await
  }

  pub async fn unsubscribe<I, S>(&self, namespaces: I) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.notifications.unsubscribe(namespaces).await
  }

  pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
    self.notifications.changes()
  }

  pub fn subscriptions(&self) -> Vec<String> {
    self.notifications.subscriptions()
  }

  pub fn notification_state(&self) -> RouterState {
    self.notifications.state()
  }

  pub fn connection_generation(&self) -> u64 {
    self.notifications.connection_generation()
  }

  pub async fn wait_for_generation(&self, generation: u64) -> Result<()> {
    self.notifications.wait_for_generation(generation).await
  }

  /// Stop the notification task
  pub async fn shutdown(&self) {
    self.notifications.shutdown().await;
  }

  // ==========================================================================
  // Caches and stats
  // ==========================================================================

  /// Empty the transform cache and the key-prefix cache
  pub fn clear_cache(&self) {
    self.codec.clear_cache();
    self.keys.clear();
  }

  pub fn performance_stats(&self) -> PerformanceStats {
    self.codec.stats()
  }

  pub fn reset_performance_stats(&self) {
    self.codec.reset_stats();
  }

  fn full_key(&self, namespace: &str, key: &str) -> Result<String> {
    self.keys.validate_namespace(namespace)?;
    Ok(self.keys.compose(namespace, key))
  }

  /// Run one command. Idempotent commands are retried once after a connection
  /// error; others may already have been applied, so the error is returned.
  async fn query(&self, cmd: Command) -> Result<Reply> {
    match self.store.query(cmd.clone()).await {
      Err(e) if e.is_connection() && cmd.is_idempotent() => {
        tracing::warn!("{} failed ({}), retrying once", cmd.name(), e);
        self.store.query(cmd).await
      }
      other => other,
    }
  }
}

/// Hash fields are stored serialized but uncompressed
fn field_value(raw: String) -> Value {
  parse_if_json(&raw).unwrap_or(Value::String(raw))
}

/// Namespaced commands queued for one round-trip.
///
/// The first encoding or namespace error is kept and returned by
/// [`execute`](Pipeline::execute) without sending anything.
pub struct Pipeline<'a> {
  stash: &'a Stash,
  commands: Vec<Command>,
  atomic: bool,
  error: Option<Error>,
}

impl<'a> Pipeline<'a> {
  /// Wrap the batch in MULTI/EXEC
  pub fn atomic(mut self) -> Self {
    self.atomic = true;
    self
  }

  pub fn set(self, namespace: &str, key: &str, value: &Value, ttl: Option<u64>) -> Self {
    let payload = self.stash.codec.encode(value);
    let ttl = ttl.or(self.stash.default_ttl);
    self.push(namespace, key, |full_key| {
      Ok(Command::set(full_key, payload?, ttl))
    })
  }

  pub fn get(self, namespace: &str, key: &str) -> Self {
    self.push(namespace, key, |full_key| Ok(Command::Get(full_key)))
  }

  pub fn delete(self, namespace: &str, key: &str) -> Self {
    self.push(namespace, key, |full_key| Ok(Command::del(full_key)))
  }

  pub fn expire(self, namespace: &str, key: &str, seconds: u64) -> Self {
    self.push(namespace, key, |full_key| Ok(Command::Expire(full_key, seconds)))
  }

  pub fn incr_by(self, namespace: &str, key: &str, delta: i64) -> Self {
    self.push(namespace, key, |full_key| Ok(Command::IncrBy(full_key, delta)))
  }

  pub fn hset(self, namespace: &str, key: &str, field: &str, value: &Value) -> Self {
    let serialized = self.stash.codec.serialize(value);
    self.push(namespace, key, |full_key| {
      Ok(Command::HSet(full_key, vec![(field.to_string(), serialized?)]))
    })
  }

  /// Queue a command as-is, without namespacing
  pub fn command(mut self, cmd: Command) -> Self {
    self.commands.push(cmd);
    self
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }

  /// Send the batch; replies come back in queue order, unprocessed
  pub async fn execute(self) -> Result<Vec<Reply>> {
    if let Some(err) = self.error {
      return Err(err);
    }
    if self.commands.is_empty() {
      return Ok(Vec::new());
    }
    let count = self.commands.len();
    self
      .stash
      .store
      .pipeline(self.commands, self.atomic)
      .await
      .map_err(|e| Error::bulk_write(count, e))
  }

  fn push<F>(mut self, namespace: &str, key: &str, build: F) -> Self
  where
    F: FnOnce(String) -> Result<Command>,
  {
    if self.error.is_some() {
      return self;
    }
    match self.stash.full_key(namespace, key).and_then(build) {
      Ok(cmd) => self.commands.push(cmd),
      Err(e) => self.error = Some(e),
    }
    self
  }
}
