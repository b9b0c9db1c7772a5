//! Error taxonomy shared by fetches and mutations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category assigned to a failed fetch or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
  /// Transport failure: connection refused/reset, DNS, offline
  Network,
  /// The attempt did not finish within its timeout
  Timeout,
  /// Authorization outcome; retrying cannot change it
  Permission,
  /// Input rejected by the remote
  Validation,
  /// 5xx-equivalent remote failure
  Server,
  /// Other 4xx-equivalent failure
  Client,
  Unknown,
}

impl ErrorCategory {
  pub const ALL: [ErrorCategory; 7] = [
    Self::Network,
    Self::Timeout,
    Self::Permission,
    Self::Validation,
    Self::Server,
    Self::Client,
    Self::Unknown,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Timeout => "timeout",
      Self::Permission => "permission",
      Self::Validation => "validation",
      Self::Server => "server",
      Self::Client => "client",
      Self::Unknown => "unknown",
    }
  }
}

impl fmt::Display for ErrorCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A classified failure, as recorded on a cache entry or mutation handle.
///
/// Cheap to clone so that every caller sharing an in-flight fetch receives
/// the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{category} error after {attempts} attempt(s): {message}")]
pub struct QueryError {
  pub category: ErrorCategory,
  pub message: String,
  /// Attempts made before giving up
  pub attempts: u32,
  pub retryable: bool,
}

impl QueryError {
  pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
    Self {
      category,
      message: message.into(),
      attempts: 1,
      retryable: false,
    }
  }

  pub fn with_attempts(mut self, attempts: u32) -> Self {
    self.attempts = attempts;
    self
  }

  pub fn with_retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self
  }
}

/// Structured failure a remote collaborator may return.
///
/// Carries an HTTP-like `status` and/or a backend `code` (SQLSTATE or
/// PostgREST code) so classification does not have to guess from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
  pub message: String,
  pub status: Option<u16>,
  pub code: Option<String>,
}

impl RemoteError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      status: None,
      code: None,
    }
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }
}
