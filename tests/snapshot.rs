use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use stash::config::CompressionConfig;
use stash::{Command, KvStore, MemoryStore, Reply, Result, SnapshotFormat, Stash, StashConfig};
use std::sync::Arc;

fn setup(compress: bool) -> (Arc<MemoryStore>, Stash) {
  let config = StashConfig {
    compression: CompressionConfig {
      enabled: compress,
      level: 6,
    },
    ..Default::default()
  };
  let store = Arc::new(MemoryStore::new());
  let stash = Stash::with_store(store.clone(), &config);
  (store, stash)
}

/// One key of each store-native type under `ns`
async fn seed_mixed(store: &MemoryStore, stash: &Stash) {
  stash.set("ns", "doc", &json!({"a": 1}), None).await.unwrap();
  store
    .query(Command::HSet("ns:hash".into(), vec![("x".into(), "1".into())]))
    .await
    .unwrap();
  store
    .query(Command::RPush("ns:list".into(), vec!["p".into(), "q".into()]))
    .await
    .unwrap();
  store
    .query(Command::SAdd("ns:set".into(), vec!["m".into(), "n".into()]))
    .await
    .unwrap();
  store
    .query(Command::ZAdd(
      "ns:zset".into(),
      vec![(20.0, "s2".into()), (10.0, "s1".into())],
    ))
    .await
    .unwrap();
}

// =============================================================================
// Snapshot Completeness Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_covers_every_type() {
  for compress in [false, true] {
    let (store, stash) = setup(compress);
    seed_mixed(&store, &stash).await;

    let snapshot = stash.snapshot("ns").await.unwrap();
    assert_eq!(snapshot.len(), 5);
    assert_eq!(snapshot["doc"], json!({"a": 1}));
    assert_eq!(snapshot["hash"], json!({"x": "1"}));
    assert_eq!(snapshot["list"], json!(["p", "q"]));
    assert_eq!(snapshot["zset"], json!({"s1": 10, "s2": 20}));

    let mut members: Vec<&str> = snapshot["set"]
      .as_array()
      .unwrap()
      .iter()
      .map(|m| m.as_str().unwrap())
      .collect();
    members.sort();
    assert_eq!(members, vec!["m", "n"]);
  }
}

#[tokio::test]
async fn test_snapshot_empty_namespace() {
  let (store, stash) = setup(false);
  seed_mixed(&store, &stash).await;
  assert!(stash.snapshot("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_ignores_other_namespaces() {
  let (store, stash) = setup(false);
  seed_mixed(&store, &stash).await;
  stash.set("nsx", "k", &json!("v"), None).await.unwrap();
  stash.set("other", "k", &json!("v"), None).await.unwrap();

  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot.len(), 5);
  assert!(!snapshot.contains_key("k"));
}

#[tokio::test]
async fn test_snapshot_small_batches() {
  let (store, stash) = setup(true);
  seed_mixed(&store, &stash).await;
  for i in 0..7 {
    stash
      .set("ns", &format!("extra{}", i), &json!({"i": i}), None)
      .await
      .unwrap();
  }

  for batch_size in [1, 3, 100] {
    let snapshot = stash.snapshot_with_batch("ns", batch_size).await.unwrap();
    assert_eq!(snapshot.len(), 12, "batch size {}", batch_size);
    assert_eq!(snapshot["extra4"], json!({"i": 4}));
  }
}

#[tokio::test]
async fn test_snapshot_keeps_undecodable_strings_raw() {
  let (store, stash) = setup(true);
  store
    .query(Command::set("ns:legacy", "written by another client", None))
    .await
    .unwrap();
  store
    .query(Command::set("ns:json", r#"{"plain": true}"#, None))
    .await
    .unwrap();

  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot["legacy"], json!("written by another client"));
  assert_eq!(snapshot["json"], json!({"plain": true}));
}

#[tokio::test]
async fn test_snapshot_keeps_nested_local_keys() {
  let (_store, stash) = setup(false);
  stash.set("ns", "a:b:c", &json!("deep"), None).await.unwrap();
  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot["a:b:c"], json!("deep"));
}

// =============================================================================
// Concurrent Change Tests
// =============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Stage {
  /// After `KEYS`
  Discover,
  /// After the `TYPE` pipeline
  Classify,
}

/// Applies `writes` once, right after the snapshot reaches `stage`
struct Interleaved {
  inner: Arc<MemoryStore>,
  stage: Stage,
  writes: Mutex<Vec<Command>>,
}

impl Interleaved {
  fn new(inner: Arc<MemoryStore>, stage: Stage, writes: Vec<Command>) -> Self {
    Self {
      inner,
      stage,
      writes: Mutex::new(writes),
    }
  }

  async fn interleave(&self, stage: Stage) {
    if stage != self.stage {
      return;
    }
    let writes = std::mem::take(&mut *self.writes.lock());
    for cmd in writes {
      self.inner.query(cmd).await.unwrap();
    }
  }
}

#[async_trait]
impl KvStore for Interleaved {
  async fn query(&self, cmd: Command) -> Result<Reply> {
    let discover = matches!(cmd, Command::Keys(_));
    let reply = self.inner.query(cmd).await;
    if discover {
      self.interleave(Stage::Discover).await;
    }
    reply
  }

  async fn pipeline(&self, cmds: Vec<Command>, atomic: bool) -> Result<Vec<Reply>> {
    let classify = cmds.iter().all(|c| matches!(c, Command::Type(_)));
    let replies = self.inner.pipeline(cmds, atomic).await;
    if classify {
      self.interleave(Stage::Classify).await;
    }
    replies
  }
}

fn interleaved(store: &Arc<MemoryStore>, stage: Stage, writes: Vec<Command>) -> Stash {
  Stash::with_backend(
    Arc::new(Interleaved::new(store.clone(), stage, writes)),
    store.clone(),
    0,
    &StashConfig::default(),
  )
}

#[tokio::test]
async fn test_snapshot_refetches_key_that_changed_type() {
  let (store, seeded) = setup(false);
  seeded.set("ns", "doc", &json!({"a": 1}), None).await.unwrap();
  seeded.set("ns", "flip", &json!("was a string"), None).await.unwrap();

  let stash = interleaved(
    &store,
    Stage::Classify,
    vec![
      Command::del("ns:flip"),
      Command::HSet("ns:flip".into(), vec![("f".into(), "v".into())]),
    ],
  );
  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot.len(), 2);
  assert_eq!(snapshot["flip"], json!({"f": "v"}));
  assert_eq!(snapshot["doc"], json!({"a": 1}));
}

#[tokio::test]
async fn test_snapshot_skips_keys_deleted_before_read() {
  let (store, seeded) = setup(false);
  seed_mixed(&store, &seeded).await;

  let stash = interleaved(
    &store,
    Stage::Classify,
    ["doc", "hash", "list", "set", "zset"]
      .iter()
      .map(|k| Command::del(format!("ns:{}", k)))
      .collect(),
  );
  assert!(stash.snapshot("ns").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_skips_keys_deleted_before_classification() {
  let (store, seeded) = setup(false);
  seed_mixed(&store, &seeded).await;

  let stash = interleaved(&store, Stage::Discover, vec![Command::del("ns:hash")]);
  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot.len(), 4);
  assert!(!snapshot.contains_key("hash"));
}

/// Reports one key as a stream, a type the snapshot cannot read natively
struct WithStream {
  inner: Arc<MemoryStore>,
  key: String,
}

impl WithStream {
  fn answer(&self, cmd: &Command) -> Option<Reply> {
    match cmd {
      Command::Type(k) if *k == self.key => Some(Reply::Status("stream".into())),
      Command::Get(k) if *k == self.key => Some(Reply::Error(
        "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
      )),
      _ => None,
    }
  }
}

#[async_trait]
impl KvStore for WithStream {
  async fn query(&self, cmd: Command) -> Result<Reply> {
    match self.answer(&cmd) {
      Some(reply) => reply.into_result(),
      None => self.inner.query(cmd).await,
    }
  }

  async fn pipeline(&self, cmds: Vec<Command>, atomic: bool) -> Result<Vec<Reply>> {
    let mut replies = Vec::with_capacity(cmds.len());
    for cmd in cmds {
      match self.answer(&cmd) {
        Some(reply) => replies.push(reply),
        None => replies.extend(self.inner.pipeline(vec![cmd], atomic).await?),
      }
    }
    Ok(replies)
  }
}

#[tokio::test]
async fn test_snapshot_keeps_unknown_type_as_error_text() {
  let (store, seeded) = setup(false);
  seeded.set("ns", "plain", &json!("v"), None).await.unwrap();
  seeded.set("ns", "events", &json!("placeholder"), None).await.unwrap();

  let stash = Stash::with_backend(
    Arc::new(WithStream {
      inner: store.clone(),
      key: "ns:events".into(),
    }),
    store.clone(),
    0,
    &StashConfig::default(),
  );
  let snapshot = stash.snapshot("ns").await.unwrap();
  assert_eq!(snapshot.len(), 2);
  assert_eq!(snapshot["plain"], json!("v"));
  assert!(snapshot["events"].as_str().unwrap().contains("WRONGTYPE"));
}

// =============================================================================
// Clean Snapshot Tests
// =============================================================================

#[tokio::test]
async fn test_clean_snapshot_value_and_text() {
  let (store, stash) = setup(false);
  seed_mixed(&store, &stash).await;

  let value = stash
    .clean_snapshot("ns", SnapshotFormat::Value)
    .await
    .unwrap()
    .into_value()
    .unwrap();
  assert_eq!(value.as_object().unwrap().len(), 5);
  assert_eq!(value["hash"]["x"], "1");

  let text = stash
    .clean_snapshot("ns", SnapshotFormat::Text)
    .await
    .unwrap()
    .into_text()
    .unwrap();
  assert!(text.contains("\n  \"doc\": {\n    \"a\": 1\n  }"));
  let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
  assert_eq!(reparsed, value);
}

// =============================================================================
// String-Only Snapshot Tests
// =============================================================================

#[tokio::test]
async fn test_string_snapshot_degrades_structured_keys() {
  let (store, stash) = setup(true);
  seed_mixed(&store, &stash).await;
  stash.set("ns", "greeting", &json!("hello"), None).await.unwrap();

  let snapshot = stash.string_snapshot("ns").await.unwrap();
  assert_eq!(snapshot.len(), 6);
  assert_eq!(snapshot["doc"], json!({"a": 1}));
  assert_eq!(snapshot["greeting"], json!("hello"));
  for key in ["hash", "list", "set", "zset"] {
    assert_eq!(snapshot[key], serde_json::Value::Null, "{}", key);
  }
}

#[tokio::test]
async fn test_snapshot_rejects_bad_namespace() {
  let (_store, stash) = setup(false);
  assert!(matches!(
    stash.snapshot("a:b").await,
    Err(stash::Error::InvalidNamespace(_))
  ));
}
