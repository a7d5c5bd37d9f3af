//! Keyspace change notifications
//!
//! A [`NotificationRouter`] turns the store's keyspace events for subscribed
//! namespaces into [`ChangeEvent`]s on a local broadcast channel. One background
//! task owns the dedicated subscription connection; it reconnects with
//! exponential backoff and re-subscribes every registered namespace before the
//! new connection is announced through [`NotificationRouter::connection_generation`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::NotificationsSection;
use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::store::{Command, KvStore, PubSubChannel, PubSubConnector, PubSubMessage};

/// Kind of change reported by a keyspace event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
  Set,
  Del,
  Expire,
  Expired,
  Evicted,
  IncrBy,
  HSet,
  HDel,
  LPush,
  RPush,
  SAdd,
  SRem,
  ZAdd,
  ZRem,
  RenameFrom,
  RenameTo,
  Other(String),
}

impl ChangeKind {
  pub fn as_str(&self) -> &str {
    match self {
      ChangeKind::Set => "set",
      ChangeKind::Del => "del",
      ChangeKind::Expire => "expire",
      ChangeKind::Expired => "expired",
      ChangeKind::Evicted => "evicted",
      ChangeKind::IncrBy => "incrby",
      ChangeKind::HSet => "hset",
      ChangeKind::HDel => "hdel",
      ChangeKind::LPush => "lpush",
      ChangeKind::RPush => "rpush",
      ChangeKind::SAdd => "sadd",
      ChangeKind::SRem => "srem",
      ChangeKind::ZAdd => "zadd",
      ChangeKind::ZRem => "zrem",
      ChangeKind::RenameFrom => "rename_from",
      ChangeKind::RenameTo => "rename_to",
      ChangeKind::Other(other) => other,
    }
  }

  /// True for events after which the key no longer exists
  pub fn is_removal(&self) -> bool {
    matches!(
      self,
      ChangeKind::Del | ChangeKind::Expired | ChangeKind::Evicted | ChangeKind::RenameFrom
    )
  }
}

impl From<&str> for ChangeKind {
  fn from(s: &str) -> Self {
    match s {
      "set" => ChangeKind::Set,
      "del" => ChangeKind::Del,
      "expire" => ChangeKind::Expire,
      "expired" => ChangeKind::Expired,
      "evicted" => ChangeKind::Evicted,
      "incrby" => ChangeKind::IncrBy,
      "hset" => ChangeKind::HSet,
      "hdel" => ChangeKind::HDel,
      "lpush" => ChangeKind::LPush,
      "rpush" => ChangeKind::RPush,
      "sadd" => ChangeKind::SAdd,
      "srem" => ChangeKind::SRem,
      "zadd" => ChangeKind::ZAdd,
      "zrem" => ChangeKind::ZRem,
      "rename_from" => ChangeKind::RenameFrom,
      "rename_to" => ChangeKind::RenameTo,
      other => ChangeKind::Other(other.to_string()),
    }
  }
}

impl std::fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for ChangeKind {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for ChangeKind {
  fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    Ok(ChangeKind::from(s.as_str()))
  }
}

/// A change to one key under a subscribed namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub namespace: String,
  pub key: String,
  pub kind: ChangeKind,
  pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
  /// Keyspace events not yet enabled on the store
  Unconfigured,
  Configuring,
  Active,
}

enum RouterCommand {
  Subscribe {
    namespace: String,
    reply: oneshot::Sender<Result<()>>,
  },
  Unsubscribe {
    namespace: String,
    reply: oneshot::Sender<Result<()>>,
  },
  Shutdown,
}

/// Held until the background task is spawned
struct Startup {
  commands: mpsc::UnboundedReceiver<RouterCommand>,
  generation: watch::Sender<u64>,
}

pub struct NotificationRouter {
  store: Arc<dyn KvStore>,
  connector: Arc<dyn PubSubConnector>,
  keys: Arc<KeyCodec>,
  settings: NotificationsSection,
  database: u8,
  state: RwLock<RouterState>,
  registry: Arc<RwLock<Vec<String>>>,
  events: broadcast::Sender<ChangeEvent>,
  commands: mpsc::UnboundedSender<RouterCommand>,
  generation: watch::Receiver<u64>,
  startup: tokio::sync::Mutex<Option<Startup>>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationRouter {
  pub fn new(
    store: Arc<dyn KvStore>,
    connector: Arc<dyn PubSubConnector>,
    keys: Arc<KeyCodec>,
    database: u8,
    settings: NotificationsSection,
  ) -> Self {
    let (events, _) = broadcast::channel(settings.channel_capacity.max(1));
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (generation_tx, generation) = watch::channel(0);

    Self {
      store,
      connector,
      keys,
      settings,
      database,
      state: RwLock::new(RouterState::Unconfigured),
      registry: Arc::new(RwLock::new(Vec::new())),
      events,
      commands,
      generation,
      startup: tokio::sync::Mutex::new(Some(Startup {
        commands: commands_rx,
        generation: generation_tx,
      })),
      task: Mutex::new(None),
    }
  }

  pub fn state(&self) -> RouterState {
    *self.state.read()
  }

  /// New listener for change events
  pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
    self.events.subscribe()
  }

  /// Subscribed namespaces, in subscription order
  pub fn subscriptions(&self) -> Vec<String> {
    self.registry.read().clone()
  }

  /// Number of notification connections established so far
  pub fn connection_generation(&self) -> u64 {
    *self.generation.borrow()
  }

  /// Wait until at least `generation` connections have been established and
  /// re-subscribed
  pub async fn wait_for_generation(&self, generation: u64) -> Result<()> {
    let mut rx = self.generation.clone();
    rx.wait_for(|g| *g >= generation)
      .await
      .map(|_| ())
      .map_err(|_| router_stopped())
  }

  /// Subscribe to changes under each namespace.
  ///
  /// The first call enables keyspace events on the store; a rejected
  /// configuration is logged and the subscription goes ahead.
  pub async fn subscribe<I, S>(&self, namespaces: I) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let namespaces = self.validated(namespaces)?;
    if namespaces.is_empty() {
      return Ok(());
    }
    self.ensure_started().await?;

    for namespace in namespaces {
      let (reply, rx) = oneshot::channel();
      self.send(RouterCommand::Subscribe {
        namespace: namespace.clone(),
        reply,
      })?;
      rx.await.map_err(|_| router_stopped())??;
      tracing::info!("Subscribed to changes in {}", namespace);
    }
    Ok(())
  }

  /// Drop subscriptions. Namespaces that are not subscribed are ignored.
  pub async fn unsubscribe<I, S>(&self, namespaces: I) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for namespace in self.validated(namespaces)? {
      if !self.registry.read().contains(&namespace) {
        continue;
      }
      let (reply, rx) = oneshot::channel();
      self.send(RouterCommand::Unsubscribe {
        namespace: namespace.clone(),
        reply,
      })?;
      rx.await.map_err(|_| router_stopped())??;
      tracing::info!("Unsubscribed from changes in {}", namespace);
    }
    Ok(())
  }

  /// Stop the background task. Later subscribes fail.
  pub async fn shutdown(&self) {
    let _ = self.commands.send(RouterCommand::Shutdown);
    self.startup.lock().await.take();
    let task = self.task.lock().take();
    if let Some(task) = task {
      if let Err(e) = task.await {
        tracing::warn!("Notification task ended abnormally: {}", e);
      }
    }
  }

  fn validated<I, S>(&self, namespaces: I) -> Result<Vec<String>>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    namespaces
      .into_iter()
      .map(|ns| {
        let ns = ns.as_ref();
        self.keys.validate_namespace(ns)?;
        Ok(ns.to_string())
      })
      .collect()
  }

  fn send(&self, cmd: RouterCommand) -> Result<()> {
    self.commands.send(cmd).map_err(|_| router_stopped())
  }

  async fn ensure_started(&self) -> Result<()> {
    let mut startup = self.startup.lock().await;
    if self.state() == RouterState::Unconfigured {
      self.configure().await;
    }

    let Some(pending) = startup.take() else {
      return Ok(());
    };
    let channel = match self.connector.connect().await {
      Ok(channel) => channel,
      Err(e) => {
        *startup = Some(pending);
        return Err(e);
      }
    };
    pending.generation.send_modify(|g| *g += 1);
    tracing::info!("Notification connection established");

    let task = RouterTask {
      connector: self.connector.clone(),
      commands: pending.commands,
      events: self.events.clone(),
      registry: self.registry.clone(),
      generation: pending.generation,
      channel_prefix: keyspace_prefix(self.database),
      keys: self.keys.clone(),
      reconnect_initial: self.settings.reconnect_initial(),
      reconnect_max: self.settings.reconnect_max(),
    };
    *self.task.lock() = Some(tokio::spawn(task.run(channel)));
    Ok(())
  }

  async fn configure(&self) {
    *self.state.write() = RouterState::Configuring;
    let cmd = Command::ConfigSet(
      "notify-keyspace-events".to_string(),
      self.settings.keyspace_events.clone(),
    );
    if let Err(e) = self.store.query(cmd).await {
      let err = Error::Configuration(e.to_string());
      tracing::warn!("{}; subscribing anyway", err);
    }
    *self.state.write() = RouterState::Active;
  }
}

fn router_stopped() -> Error {
  Error::Connection("notification router stopped".to_string())
}

fn keyspace_prefix(database: u8) -> String {
  format!("__keyspace@{}__:", database)
}

struct RouterTask {
  connector: Arc<dyn PubSubConnector>,
  commands: mpsc::UnboundedReceiver<RouterCommand>,
  events: broadcast::Sender<ChangeEvent>,
  registry: Arc<RwLock<Vec<String>>>,
  generation: watch::Sender<u64>,
  channel_prefix: String,
  keys: Arc<KeyCodec>,
  reconnect_initial: Duration,
  reconnect_max: Duration,
}

impl RouterTask {
  async fn run(mut self, mut channel: Box<dyn PubSubChannel>) {
    loop {
      tokio::select! {
        cmd = self.commands.recv() => match cmd {
          Some(RouterCommand::Subscribe { namespace, reply }) => {
            let result = if self.register(&namespace) {
              channel.psubscribe(&self.pattern(&namespace)).await
            } else {
              Ok(())
            };
            let _ = reply.send(result);
          }
          Some(RouterCommand::Unsubscribe { namespace, reply }) => {
            self.registry.write().retain(|ns| *ns != namespace);
            let result = channel.punsubscribe(&self.pattern(&namespace)).await;
            let _ = reply.send(result);
          }
          Some(RouterCommand::Shutdown) | None => break,
        },
        msg = channel.next_message() => match msg {
          Some(msg) => self.route(msg),
          None => {
            tracing::warn!("Notification connection lost, reconnecting");
            match self.reconnect().await {
              Some(fresh) => channel = fresh,
              None => break,
            }
          }
        },
      }
    }
    tracing::debug!("Notification task stopped");
  }

  /// Reconnect with backoff, then restore every registered subscription.
  /// `None` when shut down while waiting.
  async fn reconnect(&mut self) -> Option<Box<dyn PubSubChannel>> {
    let mut delay = self.reconnect_initial;
    loop {
      match self.connector.connect().await {
        Ok(mut channel) => match self.resubscribe(channel.as_mut()).await {
          Ok(count) => {
            self.generation.send_modify(|g| *g += 1);
            tracing::info!("Notification connection restored, {} namespaces", count);
            return Some(channel);
          }
          Err(e) => tracing::error!("Resubscribe failed: {}", e),
        },
        Err(e) => tracing::error!("Notification reconnect failed: {}", e),
      }

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        cmd = self.commands.recv() => match cmd {
          Some(RouterCommand::Subscribe { namespace, reply }) => {
            // Picked up by the resubscribe on the next attempt
            self.register(&namespace);
            let _ = reply.send(Ok(()));
          }
          Some(RouterCommand::Unsubscribe { namespace, reply }) => {
            self.registry.write().retain(|ns| *ns != namespace);
            let _ = reply.send(Ok(()));
          }
          Some(RouterCommand::Shutdown) | None => return None,
        },
      }
      delay = (delay * 2).min(self.reconnect_max);
    }
  }

  async fn resubscribe(&self, channel: &mut dyn PubSubChannel) -> Result<usize> {
    let namespaces = self.registry.read().clone();
    for namespace in &namespaces {
      channel.psubscribe(&self.pattern(namespace)).await?;
    }
    Ok(namespaces.len())
  }

  /// False when already registered
  fn register(&self, namespace: &str) -> bool {
    let mut registry = self.registry.write();
    if registry.iter().any(|ns| ns == namespace) {
      return false;
    }
    registry.push(namespace.to_string());
    true
  }

  fn pattern(&self, namespace: &str) -> String {
    format!("{}{}", self.channel_prefix, self.keys.pattern(namespace))
  }

  fn route(&self, msg: PubSubMessage) {
    let Some(event) = parse_event(&self.channel_prefix, &self.keys, &msg) else {
      tracing::debug!("Ignoring notification on {}", msg.channel);
      return;
    };
    if self.events.send(event).is_err() {
      tracing::debug!("No listeners for change on {}", msg.channel);
    }
  }
}

fn parse_event(prefix: &str, keys: &KeyCodec, msg: &PubSubMessage) -> Option<ChangeEvent> {
  let full_key = msg.channel.strip_prefix(prefix)?;
  let (namespace, key) = keys.split(full_key)?;
  Some(ChangeEvent {
    namespace: namespace.to_string(),
    key: key.to_string(),
    kind: ChangeKind::from(msg.payload.as_str()),
    received_at: Utc::now(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message(channel: &str, payload: &str) -> PubSubMessage {
    PubSubMessage {
      channel: channel.to_string(),
      payload: payload.to_string(),
    }
  }

  #[test]
  fn test_parse_keyspace_channel() {
    let keys = KeyCodec::default();
    let prefix = keyspace_prefix(3);

    let event = parse_event(&prefix, &keys, &message("__keyspace@3__:users:42", "hset")).unwrap();
    assert_eq!(event.namespace, "users");
    assert_eq!(event.key, "42");
    assert_eq!(event.kind, ChangeKind::HSet);

    // Only the first separator splits
    let event = parse_event(&prefix, &keys, &message("__keyspace@3__:a:b:c", "del")).unwrap();
    assert_eq!((event.namespace.as_str(), event.key.as_str()), ("a", "b:c"));

    assert!(parse_event(&prefix, &keys, &message("__keyspace@0__:a:b", "set")).is_none());
    assert!(parse_event(&prefix, &keys, &message("__keyspace@3__:nosep", "set")).is_none());
  }

  #[test]
  fn test_change_kind_preserves_unknown() {
    assert_eq!(ChangeKind::from("expired"), ChangeKind::Expired);
    assert_eq!(ChangeKind::from("xadd"), ChangeKind::Other("xadd".into()));
    assert_eq!(ChangeKind::from("xadd").to_string(), "xadd");
    assert!(ChangeKind::Expired.is_removal());
    assert!(!ChangeKind::Set.is_removal());
  }

  #[test]
  fn test_change_event_serializes_kind_as_string() {
    let event = ChangeEvent {
      namespace: "ns".into(),
      key: "k".into(),
      kind: ChangeKind::Set,
      received_at: Utc::now(),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], "set");
    let back: ChangeEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
  }
}
