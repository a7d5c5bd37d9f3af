//! Error types for stash operations

use thiserror::Error;

/// Result type alias for stash operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the store layer, the transform pipeline and the batch engines.
///
/// Payload-level variants (`Encoding`, `Compression`, `Decompression`) are scoped to a
/// single key; batch operations catch them and degrade that key instead of failing.
/// Submission-level variants (`BulkWrite`, `BulkRead`, `Connection`) propagate.
#[derive(Debug, Error)]
pub enum Error {
  /// Store unreachable or connection dropped
  #[error("connection error: {0}")]
  Connection(String),

  /// The store answered a command with an error reply
  #[error("store error: {0}")]
  Store(String),

  #[error("encoding error: {0}")]
  Encoding(String),

  #[error("compression error: {0}")]
  Compression(String),

  #[error("decompression error: {0}")]
  Decompression(String),

  /// Pipeline submission failed for a write batch
  #[error("bulk write of {attempted} entries failed: {source}")]
  BulkWrite {
    attempted: usize,
    #[source]
    source: Box<Error>,
  },

  /// Pipeline submission failed for a read batch
  #[error("bulk read of {attempted} keys failed: {source}")]
  BulkRead {
    attempted: usize,
    #[source]
    source: Box<Error>,
  },

  #[error("unexpected type '{kind}' for key {key}")]
  TypeClassification { key: String, kind: String },

  /// Keyspace notification setup was rejected
  #[error("notification configuration failed: {0}")]
  Configuration(String),

  #[error("invalid namespace '{0}'")]
  InvalidNamespace(String),

  /// Configuration file could not be read or parsed
  #[error("config error: {0}")]
  Config(String),
}

impl Error {
  /// True when the failure is transport-level and a retry on a fresh connection may succeed
  pub fn is_connection(&self) -> bool {
    match self {
      Error::Connection(_) => true,
      Error::BulkWrite { source, .. } | Error::BulkRead { source, .. } => source.is_connection(),
      _ => false,
    }
  }

  pub(crate) fn bulk_write(attempted: usize, source: Error) -> Self {
    Error::BulkWrite {
      attempted,
      source: Box::new(source),
    }
  }

  pub(crate) fn bulk_read(attempted: usize, source: Error) -> Self {
    Error::BulkRead {
      attempted,
      source: Box::new(source),
    }
  }
}

impl From<redis::RedisError> for Error {
  fn from(err: redis::RedisError) -> Self {
    if err.is_io_error()
      || err.is_connection_dropped()
      || err.is_connection_refusal()
      || err.is_timeout()
    {
      Error::Connection(err.to_string())
    } else {
      Error::Store(err.to_string())
    }
  }
}

impl From<serde_yaml::Error> for Error {
  fn from(err: serde_yaml::Error) -> Self {
    Error::Config(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bulk_errors_report_connection_source() {
    let err = Error::bulk_write(3, Error::Connection("refused".into()));
    assert!(err.is_connection());
    assert_eq!(
      err.to_string(),
      "bulk write of 3 entries failed: connection error: refused"
    );

    let err = Error::bulk_read(2, Error::Store("WRONGTYPE".into()));
    assert!(!err.is_connection());
  }
}
