//! In-memory store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem::discriminant;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::command::{Command, Reply};
use super::glob::glob_to_regex;
use super::{KvStore, PubSubChannel, PubSubConnector, PubSubMessage};
use crate::error::{Error, Result};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_INTEGER: &str = "ERR value is not an integer or out of range";

#[derive(Debug, Clone)]
enum StoredValue {
  String(String),
  Hash(BTreeMap<String, String>),
  List(Vec<String>),
  Set(BTreeSet<String>),
  ZSet(BTreeMap<String, f64>),
}

impl StoredValue {
  fn type_name(&self) -> &'static str {
    match self {
      StoredValue::String(_) => "string",
      StoredValue::Hash(_) => "hash",
      StoredValue::List(_) => "list",
      StoredValue::Set(_) => "set",
      StoredValue::ZSet(_) => "zset",
    }
  }
}

#[derive(Debug, Clone)]
struct Entry {
  value: StoredValue,
  expires_at: Option<Instant>,
}

impl Entry {
  fn new(value: StoredValue) -> Self {
    Self {
      value,
      expires_at: None,
    }
  }

  fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }
}

/// Store that keeps string, hash, list, set and sorted-set values in process.
///
/// Keyspace notifications are published once `notify-keyspace-events` has been set
/// through `CONFIG SET`, mirroring a server that starts with them disabled.
pub struct MemoryStore {
  data: RwLock<HashMap<String, Entry>>,
  database: u8,
  notify_flags: RwLock<String>,
  events: broadcast::Sender<PubSubMessage>,
  disconnect: broadcast::Sender<()>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(1000);
    let (disconnect, _) = broadcast::channel(4);
    Self {
      data: RwLock::new(HashMap::new()),
      database: 0,
      notify_flags: RwLock::new(String::new()),
      events,
      disconnect,
    }
  }

  /// Drop every open pub/sub connection, as a server restart would
  pub fn disconnect_subscribers(&self) {
    let _ = self.disconnect.send(());
  }

  pub fn notifications_enabled(&self) -> bool {
    self.notify_flags.read().contains('K')
  }

  pub fn dbsize(&self) -> usize {
    self.data.read().values().filter(|e| !e.is_expired()).count()
  }

  fn notify(&self, key: &str, event: &str) {
    let flags = self.notify_flags.read();
    if flags.contains('K') {
      let _ = self.events.send(PubSubMessage {
        channel: format!("__keyspace@{}__:{}", self.database, key),
        payload: event.to_string(),
      });
    }
    if flags.contains('E') {
      let _ = self.events.send(PubSubMessage {
        channel: format!("__keyevent@{}__:{}", self.database, event),
        payload: key.to_string(),
      });
    }
  }

  fn purge(&self, data: &mut HashMap<String, Entry>, key: &str) {
    if data.get(key).is_some_and(Entry::is_expired) {
      data.remove(key);
      self.notify(key, "expired");
    }
  }

  fn purge_all(&self, data: &mut HashMap<String, Entry>) {
    let expired: Vec<String> = data
      .iter()
      .filter(|(_, entry)| entry.is_expired())
      .map(|(k, _)| k.clone())
      .collect();
    for key in expired {
      data.remove(&key);
      self.notify(&key, "expired");
    }
  }

  fn apply(&self, data: &mut HashMap<String, Entry>, cmd: Command) -> Reply {
    match cmd {
      Command::Ping => Reply::Status("PONG".to_string()),
      Command::Get(key) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Nil,
          Some(StoredValue::String(s)) => Reply::Bulk(s.clone()),
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::Set { key, value, ttl } => {
        let mut entry = Entry::new(StoredValue::String(value));
        entry.expires_at = ttl.map(|secs| Instant::now() + Duration::from_secs(secs));
        data.insert(key.clone(), entry);
        self.notify(&key, "set");
        if ttl.is_some() {
          self.notify(&key, "expire");
        }
        Reply::ok()
      }
      Command::Del(keys) => {
        let mut removed = 0;
        for key in keys {
          self.purge(data, &key);
          if data.remove(&key).is_some() {
            removed += 1;
            self.notify(&key, "del");
          }
        }
        Reply::Int(removed)
      }
      Command::Exists(key) => {
        self.purge(data, &key);
        Reply::Int(data.contains_key(&key) as i64)
      }
      Command::Expire(key, secs) => {
        self.purge(data, &key);
        if !data.contains_key(&key) {
          return Reply::Int(0);
        }
        if secs == 0 {
          data.remove(&key);
          self.notify(&key, "del");
        } else if let Some(entry) = data.get_mut(&key) {
          entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
          self.notify(&key, "expire");
        }
        Reply::Int(1)
      }
      Command::Ttl(key) => {
        self.purge(data, &key);
        match data.get(&key) {
          None => Reply::Int(-2),
          Some(entry) => match entry.expires_at {
            None => Reply::Int(-1),
            Some(at) => {
              let remaining = at.saturating_duration_since(Instant::now());
              Reply::Int(((remaining.as_millis() + 500) / 1000) as i64)
            }
          },
        }
      }
      Command::Keys(pattern) => {
        self.purge_all(data);
        match glob_to_regex(&pattern) {
          Ok(regex) => {
            let mut keys: Vec<&String> = data.keys().filter(|k| regex.is_match(k)).collect();
            keys.sort();
            Reply::Array(keys.into_iter().map(|k| Reply::Bulk(k.clone())).collect())
          }
          Err(e) => Reply::Error(format!("ERR invalid pattern: {}", e)),
        }
      }
      Command::Type(key) => {
        self.purge(data, &key);
        let name = data
          .get(&key)
          .map(|e| e.value.type_name())
          .unwrap_or("none");
        Reply::Status(name.to_string())
      }
      Command::IncrBy(key, delta) => {
        self.purge(data, &key);
        let reply = match writable(data, &key, StoredValue::String("0".to_string())) {
          Some(StoredValue::String(s)) => {
            match s.parse::<i64>().ok().and_then(|i| i.checked_add(delta)) {
              Some(n) => {
                *s = n.to_string();
                Reply::Int(n)
              }
              None => Reply::Error(NOT_INTEGER.to_string()),
            }
          }
          _ => Reply::Error(WRONGTYPE.to_string()),
        };
        if !reply.is_error() {
          self.notify(&key, "incrby");
        }
        reply
      }
      Command::HSet(key, pairs) => {
        self.purge(data, &key);
        match writable(data, &key, StoredValue::Hash(BTreeMap::new())) {
          Some(StoredValue::Hash(hash)) => {
            let mut added = 0;
            for (field, value) in pairs {
              if hash.insert(field, value).is_none() {
                added += 1;
              }
            }
            self.notify(&key, "hset");
            Reply::Int(added)
          }
          _ => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::HGet(key, field) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Nil,
          Some(StoredValue::Hash(hash)) => hash
            .get(&field)
            .map(|v| Reply::Bulk(v.clone()))
            .unwrap_or(Reply::Nil),
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::HGetAll(key) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Array(Vec::new()),
          Some(StoredValue::Hash(hash)) => Reply::Array(
            hash
              .iter()
              .flat_map(|(f, v)| [Reply::Bulk(f.clone()), Reply::Bulk(v.clone())])
              .collect(),
          ),
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::HDel(key, fields) => {
        self.purge(data, &key);
        let (removed, now_empty) = match data.get_mut(&key).map(|e| &mut e.value) {
          None => return Reply::Int(0),
          Some(StoredValue::Hash(hash)) => {
            let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
            (removed, hash.is_empty())
          }
          Some(_) => return Reply::Error(WRONGTYPE.to_string()),
        };
        if removed > 0 {
          self.notify(&key, "hdel");
        }
        if now_empty {
          data.remove(&key);
          self.notify(&key, "del");
        }
        Reply::Int(removed as i64)
      }
      Command::RPush(key, values) => {
        self.purge(data, &key);
        match writable(data, &key, StoredValue::List(Vec::new())) {
          Some(StoredValue::List(list)) => {
            list.extend(values);
            let len = list.len() as i64;
            self.notify(&key, "rpush");
            Reply::Int(len)
          }
          _ => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::LRange(key, start, stop) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Array(Vec::new()),
          Some(StoredValue::List(list)) => match range_bounds(list.len(), start, stop) {
            Some((from, to)) => Reply::Array(
              list[from..=to]
                .iter()
                .map(|v| Reply::Bulk(v.clone()))
                .collect(),
            ),
            None => Reply::Array(Vec::new()),
          },
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::SAdd(key, members) => {
        self.purge(data, &key);
        match writable(data, &key, StoredValue::Set(BTreeSet::new())) {
          Some(StoredValue::Set(set)) => {
            let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
            self.notify(&key, "sadd");
            Reply::Int(added as i64)
          }
          _ => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::SMembers(key) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Array(Vec::new()),
          Some(StoredValue::Set(set)) => {
            Reply::Array(set.iter().map(|m| Reply::Bulk(m.clone())).collect())
          }
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::ZAdd(key, members) => {
        self.purge(data, &key);
        match writable(data, &key, StoredValue::ZSet(BTreeMap::new())) {
          Some(StoredValue::ZSet(zset)) => {
            let mut added = 0;
            for (score, member) in members {
              if zset.insert(member, score).is_none() {
                added += 1;
              }
            }
            self.notify(&key, "zadd");
            Reply::Int(added)
          }
          _ => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::ZRangeWithScores(key) => {
        self.purge(data, &key);
        match data.get(&key).map(|e| &e.value) {
          None => Reply::Array(Vec::new()),
          Some(StoredValue::ZSet(zset)) => {
            let mut members: Vec<(&String, &f64)> = zset.iter().collect();
            members.sort_by(|a, b| {
              a.1
                .partial_cmp(b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
            });
            Reply::Array(
              members
                .into_iter()
                .flat_map(|(m, s)| [Reply::Bulk(m.clone()), Reply::Bulk(s.to_string())])
                .collect(),
            )
          }
          Some(_) => Reply::Error(WRONGTYPE.to_string()),
        }
      }
      Command::ConfigSet(param, value) => {
        if param.eq_ignore_ascii_case("notify-keyspace-events") {
          *self.notify_flags.write() = value;
          Reply::ok()
        } else {
          Reply::Error(format!(
            "ERR Unknown option or number of arguments for CONFIG SET - '{}'",
            param
          ))
        }
      }
      Command::Eval { .. } => {
        Reply::Error("ERR scripting is not available in MemoryStore".to_string())
      }
      Command::Raw(argv) => Reply::Error(format!(
        "ERR unknown command '{}'",
        argv.first().map(String::as_str).unwrap_or("")
      )),
    }
  }
}

/// Value slot for a write, created from `init` when the key is missing.
/// `None` when the key holds a different type.
fn writable<'a>(
  data: &'a mut HashMap<String, Entry>,
  key: &str,
  init: StoredValue,
) -> Option<&'a mut StoredValue> {
  let kind = discriminant(&init);
  let entry = data
    .entry(key.to_string())
    .or_insert_with(|| Entry::new(init));
  if discriminant(&entry.value) == kind {
    Some(&mut entry.value)
  } else {
    None
  }
}

/// Resolve LRANGE indices (negative counts from the end) to an inclusive range
fn range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
  let len = len as i64;
  let start = if start < 0 { (len + start).max(0) } else { start };
  let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
  if start > stop || start >= len {
    None
  } else {
    Some((start as usize, stop as usize))
  }
}

#[async_trait]
impl KvStore for MemoryStore {
  async fn query(&self, cmd: Command) -> Result<Reply> {
    let mut data = self.data.write();
    self.apply(&mut data, cmd).into_result()
  }

  async fn pipeline(&self, cmds: Vec<Command>, _atomic: bool) -> Result<Vec<Reply>> {
    // One write lock for the whole batch, so every batch is isolated.
    let mut data = self.data.write();
    Ok(cmds.into_iter().map(|cmd| self.apply(&mut data, cmd)).collect())
  }
}

#[async_trait]
impl PubSubConnector for MemoryStore {
  async fn connect(&self) -> Result<Box<dyn PubSubChannel>> {
    Ok(Box::new(MemoryPubSub {
      events: self.events.subscribe(),
      disconnect: self.disconnect.subscribe(),
      patterns: Vec::new(),
      closed: false,
    }))
  }
}

struct MemoryPubSub {
  events: broadcast::Receiver<PubSubMessage>,
  disconnect: broadcast::Receiver<()>,
  /// Compiled once at subscribe time
  patterns: Vec<(String, Regex)>,
  closed: bool,
}

#[async_trait]
impl PubSubChannel for MemoryPubSub {
  async fn psubscribe(&mut self, pattern: &str) -> Result<()> {
    if self.closed {
      return Err(Error::Connection("pub/sub connection closed".to_string()));
    }
    if !self.patterns.iter().any(|(p, _)| p == pattern) {
      let regex = glob_to_regex(pattern)
        .map_err(|e| Error::Store(format!("invalid pattern {}: {}", pattern, e)))?;
      self.patterns.push((pattern.to_string(), regex));
    }
    Ok(())
  }

  async fn punsubscribe(&mut self, pattern: &str) -> Result<()> {
    if self.closed {
      return Err(Error::Connection("pub/sub connection closed".to_string()));
    }
    self.patterns.retain(|(p, _)| p != pattern);
    Ok(())
  }

  async fn next_message(&mut self) -> Option<PubSubMessage> {
    if self.closed {
      return None;
    }
    loop {
      tokio::select! {
        _ = self.disconnect.recv() => {
          self.closed = true;
          return None;
        }
        received = self.events.recv() => match received {
          Ok(msg) => {
            if self.patterns.iter().any(|(_, re)| re.is_match(&msg.channel)) {
              return Some(msg);
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!("Pub/sub receiver lagged, {} messages dropped", skipped);
          }
          Err(broadcast::error::RecvError::Closed) => {
            self.closed = true;
            return None;
          }
        },
      }
    }
  }
}
