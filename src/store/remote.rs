//! Redis-backed store handles

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig, PubSub};
use redis::{Client, Value};

use super::command::{Command, Reply};
use super::{KvStore, PubSubChannel, PubSubConnector, PubSubMessage};
use crate::config::{ConnectionDescriptor, ConnectionTarget};
use crate::error::{Error, Result};

/// Store handle over a Redis connection manager.
///
/// The manager reconnects in place, so clones of the handle stay valid across
/// connection loss.
#[derive(Clone)]
pub struct RedisStore {
  client: Client,
  connection: ConnectionManager,
  descriptor: ConnectionDescriptor,
}

impl RedisStore {
  pub async fn connect(target: impl Into<ConnectionTarget>) -> Result<Self> {
    Self::from_descriptor(target.into().resolve()).await
  }

  pub async fn from_descriptor(descriptor: ConnectionDescriptor) -> Result<Self> {
    let client = Client::open(descriptor.url.as_str())?;
    let config = ConnectionManagerConfig::new()
      .set_connection_timeout(descriptor.connect_timeout)
      .set_response_timeout(descriptor.response_timeout);
    let connection = ConnectionManager::new_with_config(client.clone(), config).await?;
    tracing::info!("Connected to Redis database {}", descriptor.database);

    Ok(Self {
      client,
      connection,
      descriptor,
    })
  }

  pub fn descriptor(&self) -> &ConnectionDescriptor {
    &self.descriptor
  }

  /// Connector for dedicated subscription connections to the same server
  pub fn pubsub(&self) -> RedisPubSub {
    RedisPubSub {
      client: self.client.clone(),
    }
  }
}

fn to_redis_cmd(cmd: &Command) -> redis::Cmd {
  let argv = cmd.to_args();
  let mut iter = argv.iter();
  let mut redis_cmd = redis::cmd(iter.next().map(String::as_str).unwrap_or("PING"));
  for arg in iter {
    redis_cmd.arg(arg);
  }
  redis_cmd
}

fn reply_from_value(value: Value) -> Reply {
  match value {
    Value::Nil => Reply::Nil,
    Value::Int(i) => Reply::Int(i),
    Value::BulkString(bytes) => match String::from_utf8(bytes) {
      Ok(s) => Reply::Bulk(s),
      Err(e) => Reply::Bulk(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    },
    Value::Array(items) | Value::Set(items) => {
      Reply::Array(items.into_iter().map(reply_from_value).collect())
    }
    Value::Map(pairs) => Reply::Map(
      pairs
        .into_iter()
        .map(|(k, v)| (reply_from_value(k), reply_from_value(v)))
        .collect(),
    ),
    Value::SimpleString(s) => Reply::Status(s),
    Value::Okay => Reply::ok(),
    Value::Double(d) => Reply::Double(d),
    Value::Boolean(b) => Reply::Int(b as i64),
    Value::VerbatimString { text, .. } => Reply::Bulk(text),
    Value::ServerError(err) => Reply::Error(match err.details() {
      Some(details) => format!("{} {}", err.code(), details),
      None => err.code().to_string(),
    }),
    other => Reply::Error(format!("unsupported reply: {:?}", other)),
  }
}

#[async_trait]
impl KvStore for RedisStore {
  async fn query(&self, cmd: Command) -> Result<Reply> {
    let mut conn = self.connection.clone();
    let value: Value = to_redis_cmd(&cmd).query_async(&mut conn).await?;
    reply_from_value(value).into_result()
  }

  async fn pipeline(&self, cmds: Vec<Command>, atomic: bool) -> Result<Vec<Reply>> {
    if cmds.is_empty() {
      return Ok(Vec::new());
    }

    let mut pipe = redis::pipe();
    if atomic {
      pipe.atomic();
    }
    for cmd in &cmds {
      pipe.add_command(to_redis_cmd(cmd));
    }

    // Raw replies, so one error reply does not fail the whole batch
    let mut conn = self.connection.clone();
    let values = if atomic {
      let mut exec = conn.req_packed_commands(&pipe, cmds.len() + 1, 1).await?;
      match exec.pop() {
        Some(Value::Array(items)) => items,
        Some(Value::Nil) => return Err(Error::Store("transaction aborted".to_string())),
        Some(Value::ServerError(err)) => return Err(redis::RedisError::from(err).into()),
        other => return Err(Error::Store(format!("unexpected EXEC reply: {:?}", other))),
      }
    } else {
      conn.req_packed_commands(&pipe, 0, cmds.len()).await?
    };
    Ok(values.into_iter().map(reply_from_value).collect())
  }
}

/// Opens `PSUBSCRIBE`-mode connections, separate from the command connection
#[derive(Clone)]
pub struct RedisPubSub {
  client: Client,
}

impl RedisPubSub {
  pub fn new(client: Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl PubSubConnector for RedisPubSub {
  async fn connect(&self) -> Result<Box<dyn PubSubChannel>> {
    let pubsub = self.client.get_async_pubsub().await?;
    Ok(Box::new(RedisPubSubChannel { pubsub }))
  }
}

struct RedisPubSubChannel {
  pubsub: PubSub,
}

#[async_trait]
impl PubSubChannel for RedisPubSubChannel {
  async fn psubscribe(&mut self, pattern: &str) -> Result<()> {
    self.pubsub.psubscribe(pattern).await?;
    Ok(())
  }

  async fn punsubscribe(&mut self, pattern: &str) -> Result<()> {
    self.pubsub.punsubscribe(pattern).await?;
    Ok(())
  }

  async fn next_message(&mut self) -> Option<PubSubMessage> {
    loop {
      let msg = self.pubsub.on_message().next().await?;
      match msg.get_payload::<String>() {
        Ok(payload) => {
          return Some(PubSubMessage {
            channel: msg.get_channel_name().to_string(),
            payload,
          })
        }
        Err(e) => tracing::debug!("Skipping non-text pub/sub payload: {}", e),
      }
    }
  }
}
