//! Batched reads, writes and deletes over one namespace

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::store::{Command, KvStore, Reply};
use crate::transform::ValueCodec;

/// Default number of items per slice in [`chunked`]
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Result of one entry in a bulk write or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
  Written { key: String },
  Deleted { key: String, existed: bool },
  Failed { key: String, reason: String },
}

impl EntryOutcome {
  pub fn key(&self) -> &str {
    match self {
      EntryOutcome::Written { key }
      | EntryOutcome::Deleted { key, .. }
      | EntryOutcome::Failed { key, .. } => key,
    }
  }

  pub fn is_ok(&self) -> bool {
    !matches!(self, EntryOutcome::Failed { .. })
  }
}

/// Apply `op` to consecutive slices of at most `batch_size` items, one slice at
/// a time, collecting every slice's results in order.
///
/// A `batch_size` of 0 is treated as 1. The first failing slice stops the run.
pub async fn chunked<'a, T, R, F, Fut>(
  items: &'a [T],
  batch_size: usize,
  mut op: F,
) -> Result<Vec<R>>
where
  F: FnMut(&'a [T]) -> Fut,
  Fut: Future<Output = Result<Vec<R>>>,
{
  let mut results = Vec::with_capacity(items.len());
  for (index, slice) in items.chunks(batch_size.max(1)).enumerate() {
    tracing::debug!("Processing batch {} ({} items)", index, slice.len());
    results.extend(op(slice).await?);
  }
  Ok(results)
}

/// Pipelined multi-key operations
#[derive(Clone)]
pub struct BulkExecutor {
  store: Arc<dyn KvStore>,
  keys: Arc<KeyCodec>,
  codec: Arc<ValueCodec>,
  batch_size: usize,
}

impl BulkExecutor {
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
      batch_size: batch_size.max(1),
    }
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  /// Write every entry in one atomic pipeline.
  ///
  /// Entries whose payload cannot be encoded are reported as failed and left
  /// out of the pipeline; the rest are still written.
  pub async fn set_many(
    &self,
    namespace: &str,
    entries: &[(String, Value)],
    ttl: Option<u64>,
  ) -> Result<Vec<EntryOutcome>> {
    self.keys.validate_namespace(namespace)?;

    let mut outcomes: Vec<Option<EntryOutcome>> = Vec::with_capacity(entries.len());
    let mut commands = Vec::with_capacity(entries.len() * 2);
    // (outcome slot, first reply index, reply count)
    let mut pending = Vec::with_capacity(entries.len());

    for (local_key, value) in entries {
      match self.codec.encode(value) {
        Ok(payload) => {
          let full_key = self.keys.compose(namespace, local_key);
          let first = commands.len();
          commands.push(Command::set(full_key.clone(), payload, None));
          if let Some(secs) = ttl {
            commands.push(Command::Expire(full_key, secs));
          }
          pending.push((outcomes.len(), first, commands.len() - first));
          outcomes.push(None);
        }
        Err(e) => {
          tracing::warn!("Skipping {}:{} in bulk write: {}", namespace, local_key, e);
          outcomes.push(Some(EntryOutcome::Failed {
            key: local_key.clone(),
            reason: e.to_string(),
          }));
        }
      }
    }

    if !commands.is_empty() {
      let attempted = pending.len();
      let replies = self
        .store
        .pipeline(commands, true)
        .await
        .map_err(|e| Error::bulk_write(attempted, e))?;

      for (slot, first, count) in pending {
        let key = entries[slot].0.clone();
        let failure = replies
          .get(first..first + count)
          .ok_or_else(|| "missing reply".to_string())
          .and_then(|replies| match replies.iter().find(|r| r.is_error()) {
            Some(Reply::Error(msg)) => Err(msg.clone()),
            _ => Ok(()),
          });
        outcomes[slot] = Some(match failure {
          Ok(()) => EntryOutcome::Written { key },
          Err(reason) => EntryOutcome::Failed { key, reason },
        });
      }
    }

    tracing::debug!("Bulk write of {} entries to {}", entries.len(), namespace);
    Ok(outcomes.into_iter().flatten().collect())
  }

  /// Read every key in one pipeline. Missing keys map to `None`.
  pub async fn get_many<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<HashMap<String, Option<Value>>> {
    self.keys.validate_namespace(namespace)?;
    if keys.is_empty() {
      return Ok(HashMap::new());
    }

    let commands = keys
      .iter()
      .map(|k| Command::get(self.keys.compose(namespace, k.as_ref())))
      .collect();
    let replies = self
      .store
      .pipeline(commands, false)
      .await
      .map_err(|e| Error::bulk_read(keys.len(), e))?;

    let padded = replies.into_iter().chain(std::iter::repeat(Reply::Nil));
    let mut values = HashMap::with_capacity(keys.len());
    for (key, reply) in keys.iter().zip(padded) {
      let value = match reply {
        Reply::Nil => None,
        Reply::Error(msg) => {
          tracing::warn!("Read of {}:{} failed: {}", namespace, key.as_ref(), msg);
          None
        }
        other => other.into_string().map(|raw| self.codec.decode_or_raw(&raw)),
      };
      values.insert(key.as_ref().to_string(), value);
    }
    Ok(values)
  }

  /// Delete every key in one pipeline, recording whether each existed
  pub async fn delete_many<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<Vec<EntryOutcome>> {
    self.keys.validate_namespace(namespace)?;
    if keys.is_empty() {
      return Ok(Vec::new());
    }

    let commands = keys
      .iter()
      .map(|k| Command::del(self.keys.compose(namespace, k.as_ref())))
      .collect();
    let replies = self
      .store
      .pipeline(commands, false)
      .await
      .map_err(|e| Error::bulk_write(keys.len(), e))?;

    Ok(
      keys
        .iter()
        .zip(replies.into_iter().chain(std::iter::repeat(Reply::Nil)))
        .map(|(key, reply)| {
          let key = key.as_ref().to_string();
          match reply {
            Reply::Error(reason) => EntryOutcome::Failed { key, reason },
            other => EntryOutcome::Deleted {
              key,
              existed: other.as_i64().unwrap_or(0) > 0,
            },
          }
        })
        .collect(),
    )
  }

  /// [`set_many`](Self::set_many) over slices of the configured batch size
  pub async fn set_many_chunked(
    &self,
    namespace: &str,
    entries: &[(String, Value)],
    ttl: Option<u64>,
  ) -> Result<Vec<EntryOutcome>> {
    chunked(entries, self.batch_size, |slice| {
      self.set_many(namespace, slice, ttl)
    })
    .await
  }

  /// [`get_many`](Self::get_many) over slices of the configured batch size
  pub async fn get_many_chunked<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<HashMap<String, Option<Value>>> {
    let pairs = chunked(keys, self.batch_size, |slice| async move {
      let values = self.get_many(namespace, slice).await?;
      Ok(values.into_iter().collect::<Vec<_>>())
    })
    .await?;
    Ok(pairs.into_iter().collect())
  }

  /// [`delete_many`](Self::delete_many) over slices of the configured batch size
  pub async fn delete_many_chunked<K: AsRef<str>>(
    &self,
    namespace: &str,
    keys: &[K],
  ) -> Result<Vec<EntryOutcome>> {
    chunked(keys, self.batch_size, |slice| self.delete_many(namespace, slice)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::CompressionConfig;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn executor(compress: bool, batch_size: usize) -> (Arc<MemoryStore>, BulkExecutor) {
    let store = Arc::new(MemoryStore::new());
    let codec = ValueCodec::new(
      CompressionConfig {
        enabled: compress,
        ..Default::default()
      },
      100,
    );
    let bulk = BulkExecutor::new(
      store.clone(),
      Arc::new(KeyCodec::default()),
      Arc::new(codec),
      batch_size,
    );
    (store, bulk)
  }

  #[tokio::test]
  async fn test_chunked_slices_in_order() {
    let items: Vec<u32> = (0..250).collect();
    let mut sizes = Vec::new();
    let firsts = chunked(&items, 100, |slice| {
      sizes.push(slice.len());
      async move { Ok(vec![slice[0]]) }
    })
    .await
    .unwrap();

    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(firsts, vec![0, 100, 200]);
  }

  #[tokio::test]
  async fn test_chunked_zero_batch_and_failure() {
    let items = [1, 2, 3];
    let mut calls = 0;
    let result: Result<Vec<i32>> = chunked(&items, 0, |slice| {
      calls += 1;
      async move {
        if slice[0] == 2 {
          Err(Error::Store("boom".into()))
        } else {
          Ok(slice.to_vec())
        }
      }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls, 2);
  }

  #[tokio::test]
  async fn test_set_many_with_ttl() {
    let (store, bulk) = executor(true, 100);
    let entries = vec![
      ("a".to_string(), json!({"n": 1})),
      ("b".to_string(), json!("text")),
    ];
    let outcomes = bulk.set_many("ns", &entries, Some(60)).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(EntryOutcome::is_ok));

    let ttl = store.query(Command::Ttl("ns:a".into())).await.unwrap();
    assert!(ttl.as_i64().unwrap() > 0);

    let values = bulk.get_many("ns", &["a", "b"]).await.unwrap();
    assert_eq!(values["a"], Some(json!({"n": 1})));
    assert_eq!(values["b"], Some(json!("text")));
  }

  #[tokio::test]
  async fn test_delete_many_reports_existence() {
    let (_store, bulk) = executor(false, 100);
    bulk
      .set_many("ns", &[("x".to_string(), json!(1))], None)
      .await
      .unwrap();

    let outcomes = bulk.delete_many("ns", &["x", "y"]).await.unwrap();
    assert_eq!(
      outcomes,
      vec![
        EntryOutcome::Deleted {
          key: "x".into(),
          existed: true
        },
        EntryOutcome::Deleted {
          key: "y".into(),
          existed: false
        },
      ]
    );
  }

  #[tokio::test]
  async fn test_delete_many_chunked_keeps_order_across_slices() {
    let (store, bulk) = executor(false, 2);
    let entries: Vec<(String, Value)> = ["k0", "k2", "k4"]
      .iter()
      .map(|k| (k.to_string(), json!(1)))
      .collect();
    bulk.set_many_chunked("ns", &entries, None).await.unwrap();

    let keys = ["k0", "k1", "k2", "k3", "k4"];
    let outcomes = bulk.delete_many_chunked("ns", &keys).await.unwrap();
    let existed: Vec<(&str, bool)> = outcomes
      .iter()
      .map(|o| match o {
        EntryOutcome::Deleted { key, existed } => (key.as_str(), *existed),
        other => panic!("unexpected outcome {:?}", other),
      })
      .collect();
    assert_eq!(
      existed,
      vec![
        ("k0", true),
        ("k1", false),
        ("k2", true),
        ("k3", false),
        ("k4", true)
      ]
    );
    assert_eq!(
      store.query(Command::Keys("ns:*".into())).await.unwrap(),
      Reply::Array(vec![])
    );
  }

  #[tokio::test]
  async fn test_invalid_namespace_rejected() {
    let (_store, bulk) = executor(false, 100);
    assert!(matches!(
      bulk.get_many("a:b", &["k"]).await,
      Err(Error::InvalidNamespace(_))
    ));
  }
}
