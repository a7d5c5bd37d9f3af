//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::keys::DEFAULT_SEPARATOR;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  while let Some(start) = result.find("${") {
    if let Some(end) = result[start..].find('}') {
      let var_name = &result[start + 2..start + end];
      let value = std::env::var(var_name).unwrap_or_default();
      result = format!(
        "{}{}{}",
        &result[..start],
        value,
        &result[start + end + 1..]
      );
    } else {
      break;
    }
  }

  let mut i = 0;
  while i < result.len() {
    if result.as_bytes()[i] == b'$' {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let var_name = &rest[..var_len];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

/// Connection settings for a Redis server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_port")]
  pub port: u16,

  /// Unix socket path; takes precedence over host/port when set
  #[serde(default)]
  pub socket_path: Option<String>,

  #[serde(default)]
  pub username: Option<String>,

  #[serde(default)]
  pub password: Option<String>,

  #[serde(default)]
  pub database: u8,

  #[serde(default)]
  pub tls_enabled: bool,

  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  #[serde(default = "default_response_timeout_ms")]
  pub response_timeout_ms: u64,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_port() -> u16 {
  6379
}

fn default_connect_timeout_ms() -> u64 {
  5_000
}

fn default_response_timeout_ms() -> u64 {
  10_000
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      socket_path: None,
      username: None,
      password: None,
      database: 0,
      tls_enabled: false,
      connect_timeout_ms: default_connect_timeout_ms(),
      response_timeout_ms: default_response_timeout_ms(),
    }
  }
}

/// The shapes a caller may hand us to say where the store lives
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionTarget {
  LocalSocket(PathBuf),
  Remote { host: String, port: u16 },
  Full(ConnectionConfig),
}

impl Default for ConnectionTarget {
  fn default() -> Self {
    ConnectionTarget::Full(ConnectionConfig::default())
  }
}

impl From<ConnectionConfig> for ConnectionTarget {
  fn from(config: ConnectionConfig) -> Self {
    ConnectionTarget::Full(config)
  }
}

impl ConnectionTarget {
  /// Normalise into a single descriptor
  pub fn resolve(self) -> ConnectionDescriptor {
    let config = match self {
      ConnectionTarget::LocalSocket(path) => ConnectionConfig {
        socket_path: Some(path.to_string_lossy().into_owned()),
        ..Default::default()
      },
      ConnectionTarget::Remote { host, port } => ConnectionConfig {
        host,
        port,
        ..Default::default()
      },
      ConnectionTarget::Full(config) => config,
    };
    ConnectionDescriptor::from(&config)
  }
}

/// Resolved connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
  pub url: String,
  pub database: u8,
  pub connect_timeout: Duration,
  pub response_timeout: Duration,
}

impl From<&ConnectionConfig> for ConnectionDescriptor {
  fn from(config: &ConnectionConfig) -> Self {
    Self {
      url: connection_url(config),
      database: config.database,
      connect_timeout: Duration::from_millis(config.connect_timeout_ms),
      response_timeout: Duration::from_millis(config.response_timeout_ms),
    }
  }
}

/// Generate a Redis connection URL
fn connection_url(config: &ConnectionConfig) -> String {
  if let Some(path) = &config.socket_path {
    let mut url = format!("redis+unix://{}?db={}", path, config.database);
    if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
      url.push_str(&format!("&user={}", user));
    }
    if let Some(pwd) = config.password.as_deref().filter(|p| !p.is_empty()) {
      url.push_str(&format!("&pass={}", pwd));
    }
    return url;
  }

  let scheme = if config.tls_enabled { "rediss" } else { "redis" };
  let auth = match (&config.username, &config.password) {
    (Some(user), Some(pwd)) if !pwd.is_empty() => format!("{}:{}@", user, pwd),
    (_, Some(pwd)) if !pwd.is_empty() => format!(":{}@", pwd),
    _ => String::new(),
  };
  format!(
    "{}://{}{}:{}/{}",
    scheme, auth, config.host, config.port, config.database
  )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysSection {
  #[serde(default = "default_separator")]
  pub separator: char,
}

fn default_separator() -> char {
  DEFAULT_SEPARATOR
}

impl Default for KeysSection {
  fn default() -> Self {
    Self {
      separator: default_separator(),
    }
  }
}

/// Payload compression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
  #[serde(default)]
  pub enabled: bool,

  /// Deflate level, 0-9
  #[serde(default = "default_compression_level")]
  pub level: u32,
}

fn default_compression_level() -> u32 {
  6
}

impl Default for CompressionConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      level: default_compression_level(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformCacheSection {
  /// Entry count at which the oldest fifth is evicted
  #[serde(default = "default_cache_ceiling")]
  pub ceiling: usize,
}

fn default_cache_ceiling() -> usize {
  1000
}

impl Default for TransformCacheSection {
  fn default() -> Self {
    Self {
      ceiling: default_cache_ceiling(),
    }
  }
}

/// Keyspace notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationsSection {
  /// Value for `CONFIG SET notify-keyspace-events`
  #[serde(default = "default_keyspace_events")]
  pub keyspace_events: String,

  #[serde(default = "default_reconnect_initial_ms")]
  pub reconnect_initial_ms: u64,

  #[serde(default = "default_reconnect_max_ms")]
  pub reconnect_max_ms: u64,

  /// Capacity of the local event broadcast channel
  #[serde(default = "default_channel_capacity")]
  pub channel_capacity: usize,
}

fn default_keyspace_events() -> String {
  "KEA".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
  100
}

fn default_reconnect_max_ms() -> u64 {
  5_000
}

fn default_channel_capacity() -> usize {
  1000
}

impl Default for NotificationsSection {
  fn default() -> Self {
    Self {
      keyspace_events: default_keyspace_events(),
      reconnect_initial_ms: default_reconnect_initial_ms(),
      reconnect_max_ms: default_reconnect_max_ms(),
      channel_capacity: default_channel_capacity(),
    }
  }
}

impl NotificationsSection {
  pub fn reconnect_initial(&self) -> Duration {
    Duration::from_millis(self.reconnect_initial_ms.max(1))
  }

  pub fn reconnect_max(&self) -> Duration {
    Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_log_level")]
  pub level: String,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_log_level(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashConfig {
  #[serde(default)]
  pub connection: ConnectionConfig,
  #[serde(default)]
  pub keys: KeysSection,
  #[serde(default)]
  pub compression: CompressionConfig,
  #[serde(default)]
  pub transform_cache: TransformCacheSection,
  /// Keys per pipelined batch
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  /// Default TTL in seconds applied by `set` (0 = no expiry)
  #[serde(default)]
  pub default_ttl: u64,
  #[serde(default)]
  pub notifications: NotificationsSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

fn default_batch_size() -> usize {
  100
}

impl Default for StashConfig {
  fn default() -> Self {
    Self {
      connection: ConnectionConfig::default(),
      keys: KeysSection::default(),
      compression: CompressionConfig::default(),
      transform_cache: TransformCacheSection::default(),
      batch_size: default_batch_size(),
      default_ttl: 0,
      notifications: NotificationsSection::default(),
      logging: LoggingSection::default(),
    }
  }
}

impl StashConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let content = std::fs::read_to_string(&path)
      .map_err(|e| crate::Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>> {
    for p in ["stash.yaml", "stash.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn default_ttl(&self) -> Option<u64> {
    (self.default_ttl > 0).then_some(self.default_ttl)
  }
}
