//! Store commands and replies

use crate::error::{Error, Result};

/// A single store command.
///
/// Keys here are full store keys; namespacing happens before a command is built.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  Ping,
  Get(String),
  Set {
    key: String,
    value: String,
    ttl: Option<u64>,
  },
  Del(Vec<String>),
  Exists(String),
  Expire(String, u64),
  Ttl(String),
  Keys(String),
  Type(String),
  IncrBy(String, i64),
  HSet(String, Vec<(String, String)>),
  HGet(String, String),
  HGetAll(String),
  HDel(String, Vec<String>),
  RPush(String, Vec<String>),
  LRange(String, i64, i64),
  SAdd(String, Vec<String>),
  SMembers(String),
  ZAdd(String, Vec<(f64, String)>),
  /// `ZRANGE key 0 -1 WITHSCORES`
  ZRangeWithScores(String),
  ConfigSet(String, String),
  Eval {
    script: String,
    keys: Vec<String>,
    args: Vec<String>,
  },
  Raw(Vec<String>),
}

impl Command {
  pub fn get(key: impl Into<String>) -> Self {
    Command::Get(key.into())
  }

  pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<u64>) -> Self {
    Command::Set {
      key: key.into(),
      value: value.into(),
      ttl,
    }
  }

  pub fn del(key: impl Into<String>) -> Self {
    Command::Del(vec![key.into()])
  }

  pub fn name(&self) -> &str {
    match self {
      Command::Ping => "PING",
      Command::Get(_) => "GET",
      Command::Set { .. } => "SET",
      Command::Del(_) => "DEL",
      Command::Exists(_) => "EXISTS",
      Command::Expire(..) => "EXPIRE",
      Command::Ttl(_) => "TTL",
      Command::Keys(_) => "KEYS",
      Command::Type(_) => "TYPE",
      Command::IncrBy(..) => "INCRBY",
      Command::HSet(..) => "HSET",
      Command::HGet(..) => "HGET",
      Command::HGetAll(_) => "HGETALL",
      Command::HDel(..) => "HDEL",
      Command::RPush(..) => "RPUSH",
      Command::LRange(..) => "LRANGE",
      Command::SAdd(..) => "SADD",
      Command::SMembers(_) => "SMEMBERS",
      Command::ZAdd(..) => "ZADD",
      Command::ZRangeWithScores(_) => "ZRANGE",
      Command::ConfigSet(..) => "CONFIG",
      Command::Eval { .. } => "EVAL",
      Command::Raw(argv) => argv.first().map(String::as_str).unwrap_or(""),
    }
  }

  /// True when sending the command twice leaves the store as sending it once
  pub fn is_idempotent(&self) -> bool {
    matches!(
      self,
      Command::Ping
        | Command::Get(_)
        | Command::Set { .. }
        | Command::Del(_)
        | Command::Exists(_)
        | Command::Expire(..)
        | Command::Ttl(_)
        | Command::Keys(_)
        | Command::Type(_)
        | Command::HGet(..)
        | Command::HGetAll(_)
        | Command::LRange(..)
        | Command::SMembers(_)
        | Command::ZRangeWithScores(_)
        | Command::ConfigSet(..)
    )
  }

  /// Full argument vector, command name first
  pub fn to_args(&self) -> Vec<String> {
    let mut argv = vec![self.name().to_string()];
    match self {
      Command::Ping => {}
      Command::Get(key)
      | Command::Exists(key)
      | Command::Ttl(key)
      | Command::Keys(key)
      | Command::Type(key)
      | Command::HGetAll(key)
      | Command::SMembers(key) => argv.push(key.clone()),
      Command::Set { key, value, ttl } => {
        argv.push(key.clone());
        argv.push(value.clone());
        if let Some(ttl) = ttl {
          argv.push("EX".to_string());
          argv.push(ttl.to_string());
        }
      }
      Command::Del(keys) => argv.extend(keys.iter().cloned()),
      Command::Expire(key, secs) => {
        argv.push(key.clone());
        argv.push(secs.to_string());
      }
      Command::IncrBy(key, delta) => {
        argv.push(key.clone());
        argv.push(delta.to_string());
      }
      Command::HSet(key, pairs) => {
        argv.push(key.clone());
        for (field, value) in pairs {
          argv.push(field.clone());
          argv.push(value.clone());
        }
      }
      Command::HGet(key, field) => {
        argv.push(key.clone());
        argv.push(field.clone());
      }
      Command::HDel(key, items) | Command::RPush(key, items) | Command::SAdd(key, items) => {
        argv.push(key.clone());
        argv.extend(items.iter().cloned());
      }
      Command::LRange(key, start, stop) => {
        argv.push(key.clone());
        argv.push(start.to_string());
        argv.push(stop.to_string());
      }
      Command::ZAdd(key, members) => {
        argv.push(key.clone());
        for (score, member) in members {
          argv.push(score.to_string());
          argv.push(member.clone());
        }
      }
      Command::ZRangeWithScores(key) => {
        argv.push(key.clone());
        argv.push("0".to_string());
        argv.push("-1".to_string());
        argv.push("WITHSCORES".to_string());
      }
      Command::ConfigSet(param, value) => {
        argv.push("SET".to_string());
        argv.push(param.clone());
        argv.push(value.clone());
      }
      Command::Eval { script, keys, args } => {
        argv.push(script.clone());
        argv.push(keys.len().to_string());
        argv.extend(keys.iter().cloned());
        argv.extend(args.iter().cloned());
      }
      Command::Raw(raw) => {
        argv.clear();
        argv.extend(raw.iter().cloned());
      }
    }
    argv
  }
}

/// A store reply, independent of the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Nil,
  Status(String),
  Int(i64),
  Double(f64),
  Bulk(String),
  Array(Vec<Reply>),
  Map(Vec<(Reply, Reply)>),
  Error(String),
}

impl Reply {
  pub fn ok() -> Self {
    Reply::Status("OK".to_string())
  }

  pub fn is_nil(&self) -> bool {
    matches!(self, Reply::Nil)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, Reply::Error(_))
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Reply::Bulk(s) | Reply::Status(s) => Some(s),
      _ => None,
    }
  }

  pub fn into_string(self) -> Option<String> {
    match self {
      Reply::Bulk(s) | Reply::Status(s) => Some(s),
      Reply::Int(i) => Some(i.to_string()),
      Reply::Double(d) => Some(d.to_string()),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Reply::Int(i) => Some(*i),
      Reply::Bulk(s) | Reply::Status(s) => s.parse().ok(),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Reply::Double(d) => Some(*d),
      Reply::Int(i) => Some(*i as f64),
      Reply::Bulk(s) | Reply::Status(s) => s.parse().ok(),
      _ => None,
    }
  }

  /// Turn an error reply into `Err`, pass anything else through
  pub fn into_result(self) -> Result<Reply> {
    match self {
      Reply::Error(msg) => Err(Error::Store(msg)),
      other => Ok(other),
    }
  }

  /// Flatten array or map replies into a list of items
  pub fn into_items(self) -> Option<Vec<Reply>> {
    match self {
      Reply::Array(items) => Some(items),
      Reply::Map(pairs) => Some(pairs.into_iter().flat_map(|(k, v)| [k, v]).collect()),
      Reply::Nil => Some(Vec::new()),
      _ => None,
    }
  }

  /// Pair up a flat `[k1, v1, k2, v2, ...]` reply (or a map reply)
  pub fn into_pairs(self) -> Option<Vec<(Reply, Reply)>> {
    match self {
      Reply::Map(pairs) => Some(pairs),
      other => {
        let items = other.into_items()?;
        if items.len() % 2 != 0 {
          return None;
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
          pairs.push((k, v));
        }
        Some(pairs)
      }
    }
  }
}

/// Store-native value type as reported by `TYPE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
  String,
  Hash,
  List,
  Set,
  ZSet,
  None,
  Other(String),
}

impl ValueType {
  pub fn as_str(&self) -> &str {
    match self {
      ValueType::String => "string",
      ValueType::Hash => "hash",
      ValueType::List => "list",
      ValueType::Set => "set",
      ValueType::ZSet => "zset",
      ValueType::None => "none",
      ValueType::Other(other) => other,
    }
  }
}

impl From<&str> for ValueType {
  fn from(s: &str) -> Self {
    match s.to_ascii_lowercase().as_str() {
      "string" => ValueType::String,
      "hash" => ValueType::Hash,
      "list" => ValueType::List,
      "set" => ValueType::Set,
      "zset" => ValueType::ZSet,
      "none" => ValueType::None,
      other => ValueType::Other(other.to_string()),
    }
  }
}

impl std::fmt::Display for ValueType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
