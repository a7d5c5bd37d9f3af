use serde_json::{json, Value};
use stash::config::CompressionConfig;
use stash::{chunked, Command, EntryOutcome, KvStore, MemoryStore, Stash, StashConfig};
use std::sync::Arc;

fn config(compress: bool, batch_size: usize) -> StashConfig {
  StashConfig {
    compression: CompressionConfig {
      enabled: compress,
      level: 6,
    },
    batch_size,
    ..Default::default()
  }
}

fn setup(compress: bool, batch_size: usize) -> (Arc<MemoryStore>, Stash) {
  let store = Arc::new(MemoryStore::new());
  let stash = Stash::with_store(store.clone(), &config(compress, batch_size));
  (store, stash)
}

// =============================================================================
// Bulk Symmetry Tests
// =============================================================================

#[tokio::test]
async fn test_set_many_then_get_many() {
  for compress in [false, true] {
    let (_store, stash) = setup(compress, 100);
    let v1 = json!({"name": "alice", "roles": ["admin"]});
    let v2 = json!([1, 2, 3]);

    let outcomes = stash
      .set_many("users", vec![("k1", v1.clone()), ("k2", v2.clone())], None)
      .await
      .unwrap();
    assert_eq!(
      outcomes,
      vec![
        EntryOutcome::Written { key: "k1".into() },
        EntryOutcome::Written { key: "k2".into() },
      ]
    );

    let values = stash.get_many("users", &["k1", "k2"]).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values["k1"], Some(v1));
    assert_eq!(values["k2"], Some(v2));
  }
}

#[tokio::test]
async fn test_get_many_missing_key_is_none() {
  let (_store, stash) = setup(true, 100);
  let values = stash.get_many("users", &["absent"]).await.unwrap();
  assert_eq!(values.len(), 1);
  assert_eq!(values["absent"], None);
}

#[tokio::test]
async fn test_get_many_degrades_undecodable_values() {
  let (store, stash) = setup(true, 100);
  store
    .query(Command::set("users:legacy", "stored before compression", None))
    .await
    .unwrap();
  store
    .query(Command::SAdd("users:set".into(), vec!["m".into()]))
    .await
    .unwrap();

  let values = stash
    .get_many("users", &["legacy", "set", "absent"])
    .await
    .unwrap();
  assert_eq!(values["legacy"], Some(json!("stored before compression")));
  assert_eq!(values["set"], None);
  assert_eq!(values["absent"], None);
}

#[tokio::test]
async fn test_set_many_applies_ttl() {
  let (store, stash) = setup(false, 100);
  stash
    .set_many("session", vec![("a", json!(1)), ("b", json!(2))], Some(120))
    .await
    .unwrap();

  for key in ["session:a", "session:b"] {
    let ttl = store.query(Command::Ttl(key.into())).await.unwrap();
    let ttl = ttl.as_i64().unwrap();
    assert!(ttl > 0 && ttl <= 120);
  }
}

#[tokio::test]
async fn test_delete_many_outcomes() {
  let (_store, stash) = setup(false, 2);
  let entries: Vec<(String, Value)> = (0..5).map(|i| (format!("k{}", i), json!(i))).collect();
  stash.set_many("ns", entries, None).await.unwrap();

  let outcomes = stash
    .delete_many("ns", &["k0", "k1", "k2", "k3", "k4", "k5"])
    .await
    .unwrap();
  assert_eq!(outcomes.len(), 6);
  for outcome in &outcomes[..5] {
    assert!(matches!(outcome, EntryOutcome::Deleted { existed: true, .. }));
  }
  assert_eq!(
    outcomes[5],
    EntryOutcome::Deleted {
      key: "k5".into(),
      existed: false
    }
  );
  assert!(stash.get_many("ns", &["k0"]).await.unwrap()["k0"].is_none());
}

// =============================================================================
// Chunking Tests
// =============================================================================

#[tokio::test]
async fn test_chunked_250_by_100() {
  let items: Vec<usize> = (0..250).collect();
  let mut calls: Vec<(usize, usize)> = Vec::new();

  let results = chunked(&items, 100, |slice| {
    calls.push((slice[0], slice.len()));
    async move { Ok(slice.iter().map(|i| i * 2).collect::<Vec<_>>()) }
  })
  .await
  .unwrap();

  assert_eq!(calls, vec![(0, 100), (100, 100), (200, 50)]);
  assert_eq!(results.len(), 250);
  assert_eq!(results[249], 498);
}

#[tokio::test]
async fn test_large_bulk_spans_batches() {
  let (store, stash) = setup(true, 100);
  let entries: Vec<(String, Value)> = (0..250)
    .map(|i| (format!("item{}", i), json!({"n": i})))
    .collect();

  let outcomes = stash.set_many("big", entries, None).await.unwrap();
  assert_eq!(outcomes.len(), 250);
  assert!(outcomes.iter().all(EntryOutcome::is_ok));
  assert_eq!(store.dbsize(), 250);

  let keys: Vec<String> = (0..250).map(|i| format!("item{}", i)).collect();
  let values = stash.get_many("big", &keys).await.unwrap();
  assert_eq!(values.len(), 250);
  assert_eq!(values["item137"], Some(json!({"n": 137})));
}

#[tokio::test]
async fn test_bulk_rejects_bad_namespace() {
  let (_store, stash) = setup(false, 100);
  assert!(stash.set_many("", vec![("k", json!(1))], None).await.is_err());
  assert!(stash.get_many("a:b", &["k"]).await.is_err());
}
