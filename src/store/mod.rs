//! Store handles
//!
//! Two collaborators sit under the core algorithms:
//! - a key-value handle ([`KvStore`]) for single commands and pipelined batches
//! - a notification handle ([`PubSubConnector`]) that opens dedicated pub/sub
//!   connections
//!
//! [`RedisStore`] backs both with the `redis` driver; [`MemoryStore`] keeps
//! everything in-process.

mod command;
mod glob;
mod memory;
mod remote;

pub use command::{Command, Reply, ValueType};
pub use glob::glob_to_regex;
pub use memory::MemoryStore;
pub use remote::{RedisPubSub, RedisStore};

use async_trait::async_trait;

use crate::error::Result;

/// Key-value store handle
#[async_trait]
pub trait KvStore: Send + Sync {
  /// Run one command. Error replies come back as `Err(Error::Store)`.
  async fn query(&self, cmd: Command) -> Result<Reply>;

  /// Submit a batch in one round-trip, replies in submission order.
  ///
  /// With `atomic` the batch is wrapped in MULTI/EXEC. `Err` means the submission
  /// itself failed; per-command failures may still appear as [`Reply::Error`].
  async fn pipeline(&self, cmds: Vec<Command>, atomic: bool) -> Result<Vec<Reply>>;
}

/// A message delivered on a pub/sub connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
  pub channel: String,
  pub payload: String,
}

/// Opens dedicated subscription connections
#[async_trait]
pub trait PubSubConnector: Send + Sync {
  async fn connect(&self) -> Result<Box<dyn PubSubChannel>>;
}

/// One subscription-mode connection
#[async_trait]
pub trait PubSubChannel: Send {
  async fn psubscribe(&mut self, pattern: &str) -> Result<()>;

  async fn punsubscribe(&mut self, pattern: &str) -> Result<()>;

  /// Next message; `None` once the connection is gone. Must be cancel-safe.
  async fn next_message(&mut self) -> Option<PubSubMessage>;
}
