//! Failure classification.
//!
//! Maps an arbitrary error into an [`ErrorCategory`] by looking at the types
//! along its source chain first (structured information wins), then at its
//! messages. Classification is pure and never panics: an error whose
//! `Display` panics is classified as `Unknown`.

use std::error::Error as StdError;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use color_eyre::Report;

use crate::error::{ErrorCategory, QueryError, RemoteError};

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
  pub category: ErrorCategory,
  pub is_retryable: bool,
}

impl Classification {
  pub fn of(category: ErrorCategory) -> Self {
    Self {
      category,
      is_retryable: is_retryable(category),
    }
  }
}

/// Default retryability per category.
pub fn is_retryable(category: ErrorCategory) -> bool {
  matches!(
    category,
    ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Server
  )
}

/// Classify an error report produced by a remote collaborator.
pub fn classify(report: &Report) -> Classification {
  classify_chain(report.chain())
}

/// Classify a plain error and its sources.
pub fn classify_error(error: &(dyn StdError + 'static)) -> Classification {
  classify_chain(std::iter::successors(Some(error), |&e| e.source()))
}

fn classify_chain<'a, I>(chain: I) -> Classification
where
  I: Iterator<Item = &'a (dyn StdError + 'static)>,
{
  let mut messages = Vec::new();
  for error in chain {
    if let Some(category) = inspect_type(error) {
      return Classification::of(category);
    }
    if let Some(message) = safe_message(error) {
      messages.push(message);
    }
  }

  let category = messages
    .iter()
    .find_map(|m| category_from_message(m))
    .unwrap_or(ErrorCategory::Unknown);
  Classification::of(category)
}

/// Render a report with its causes, e.g. for [`QueryError::message`].
///
/// A `Display` impl that panics yields a placeholder instead.
pub fn describe(report: &Report) -> String {
  panic::catch_unwind(AssertUnwindSafe(|| format!("{:#}", report)))
    .unwrap_or_else(|_| "unprintable error".to_string())
}

/// Read an error's message, treating a panicking `Display` as absent.
fn safe_message(error: &(dyn StdError + 'static)) -> Option<String> {
  panic::catch_unwind(AssertUnwindSafe(|| error.to_string())).ok()
}

fn inspect_type(error: &(dyn StdError + 'static)) -> Option<ErrorCategory> {
  if let Some(e) = error.downcast_ref::<QueryError>() {
    return Some(e.category);
  }
  if let Some(e) = error.downcast_ref::<RemoteError>() {
    return e
      .code
      .as_deref()
      .and_then(category_from_code)
      .or_else(|| e.status.map(category_from_status));
  }
  if let Some(e) = error.downcast_ref::<reqwest::Error>() {
    if e.is_timeout() {
      return Some(ErrorCategory::Timeout);
    }
    if let Some(status) = e.status() {
      return Some(category_from_status(status.as_u16()));
    }
    if e.is_connect() || e.is_request() {
      return Some(ErrorCategory::Network);
    }
    return None;
  }
  if let Some(e) = error.downcast_ref::<io::Error>() {
    return category_from_io(e.kind());
  }
  if error.is::<tokio::time::error::Elapsed>() {
    return Some(ErrorCategory::Timeout);
  }
  None
}

/// HTTP-equivalent status codes.
pub fn category_from_status(status: u16) -> ErrorCategory {
  match status {
    401 | 403 => ErrorCategory::Permission,
    408 => ErrorCategory::Timeout,
    400 | 409 | 422 => ErrorCategory::Validation,
    // Rate limiting clears on its own; treat like a transient server failure
    429 => ErrorCategory::Server,
    400..=499 => ErrorCategory::Client,
    500..=599 => ErrorCategory::Server,
    _ => ErrorCategory::Unknown,
  }
}

/// SQLSTATE and PostgREST codes surfaced by database-backed remotes.
pub fn category_from_code(code: &str) -> Option<ErrorCategory> {
  let category = match code {
    "42501" => ErrorCategory::Permission,
    "57014" => ErrorCategory::Timeout,
    "PGRST116" => ErrorCategory::Client,
    c if c.starts_with("PGRST3") => ErrorCategory::Permission,
    c if c.starts_with("23") || c.starts_with("22") => ErrorCategory::Validation,
    c if c.starts_with("08") => ErrorCategory::Network,
    c if c.starts_with("53") || c.starts_with("XX") => ErrorCategory::Server,
    _ => return None,
  };
  Some(category)
}

fn category_from_io(kind: io::ErrorKind) -> Option<ErrorCategory> {
  use io::ErrorKind::*;
  match kind {
    TimedOut => Some(ErrorCategory::Timeout),
    ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
    | AddrNotAvailable | UnexpectedEof => Some(ErrorCategory::Network),
    PermissionDenied => Some(ErrorCategory::Permission),
    InvalidInput | InvalidData => Some(ErrorCategory::Validation),
    _ => None,
  }
}

const TIMEOUT_HINTS: &[&str] = &["timed out", "timeout", "deadline exceeded"];
const NETWORK_HINTS: &[&str] = &[
  "failed to fetch",
  "networkerror",
  "network error",
  "network request failed",
  "connection refused",
  "connection reset",
  "econnrefused",
  "econnreset",
  "offline",
  "dns",
];
const PERMISSION_HINTS: &[&str] = &[
  "permission denied",
  "row-level security",
  "not authorized",
  "unauthorized",
  "forbidden",
  "jwt expired",
  "invalid jwt",
];
const VALIDATION_HINTS: &[&str] = &[
  "violates",
  "duplicate key",
  "invalid input",
  "validation",
  "is required",
];
const SERVER_HINTS: &[&str] = &[
  "internal server error",
  "service unavailable",
  "bad gateway",
  "gateway timeout",
];

/// Last-resort heuristics over the error text.
fn category_from_message(message: &str) -> Option<ErrorCategory> {
  let lower = message.to_lowercase();
  let has = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));

  // Server hints first: "gateway timeout" is a server failure, not ours
  if has(SERVER_HINTS) {
    Some(ErrorCategory::Server)
  } else if has(TIMEOUT_HINTS) {
    Some(ErrorCategory::Timeout)
  } else if has(NETWORK_HINTS) {
    Some(ErrorCategory::Network)
  } else if has(PERMISSION_HINTS) {
    Some(ErrorCategory::Permission)
  } else if has(VALIDATION_HINTS) {
    Some(ErrorCategory::Validation)
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::fmt;

  #[test]
  fn remote_status_codes() {
    let cases = [
      (401, ErrorCategory::Permission),
      (403, ErrorCategory::Permission),
      (404, ErrorCategory::Client),
      (408, ErrorCategory::Timeout),
      (422, ErrorCategory::Validation),
      (500, ErrorCategory::Server),
      (503, ErrorCategory::Server),
    ];
    for (status, expected) in cases {
      let report = Report::new(RemoteError::new("request failed").with_status(status));
      assert_eq!(classify(&report).category, expected, "status {}", status);
    }
  }

  #[test]
  fn remote_codes_beat_status() {
    let report = Report::new(
      RemoteError::new("new row violates row-level security policy")
        .with_status(400)
        .with_code("42501"),
    );
    let c = classify(&report);
    assert_eq!(c.category, ErrorCategory::Permission);
    assert!(!c.is_retryable);

    let dup = Report::new(RemoteError::new("duplicate").with_code("23505"));
    assert_eq!(classify(&dup).category, ErrorCategory::Validation);
  }

  #[test]
  fn io_errors_through_context() {
    let report = Report::new(io::Error::from(io::ErrorKind::ConnectionRefused))
      .wrap_err("Failed to load teams");
    let c = classify(&report);
    assert_eq!(c.category, ErrorCategory::Network);
    assert!(c.is_retryable);
  }

  #[tokio::test]
  async fn elapsed_is_timeout() {
    let elapsed = tokio::time::timeout(
      std::time::Duration::from_millis(1),
      std::future::pending::<()>(),
    )
    .await
    .unwrap_err();
    let c = classify(&Report::new(elapsed));
    assert_eq!(c.category, ErrorCategory::Timeout);
    assert!(c.is_retryable);
  }

  #[test]
  fn message_heuristics() {
    assert_eq!(
      classify(&eyre!("TypeError: Failed to fetch")).category,
      ErrorCategory::Network
    );
    assert_eq!(
      classify(&eyre!("permission denied for table teams")).category,
      ErrorCategory::Permission
    );
    assert_eq!(
      classify(&eyre!("502 Bad Gateway")).category,
      ErrorCategory::Server
    );
    assert_eq!(
      classify(&eyre!("Gateway Timeout")).category,
      ErrorCategory::Server
    );
  }

  #[test]
  fn unknown_is_not_retryable() {
    let c = classify(&eyre!("something odd happened"));
    assert_eq!(c.category, ErrorCategory::Unknown);
    assert!(!c.is_retryable);
  }

  #[test]
  fn classification_is_deterministic() {
    let report = Report::new(RemoteError::new("x").with_status(503));
    assert_eq!(classify(&report), classify(&report));
  }

  #[derive(Debug)]
  struct HostileError;

  impl fmt::Display for HostileError {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
      panic!("message access exploded")
    }
  }

  impl StdError for HostileError {}

  #[test]
  fn panicking_display_yields_unknown() {
    let c = classify_error(&HostileError);
    assert_eq!(c.category, ErrorCategory::Unknown);
    assert!(!c.is_retryable);
  }

  #[test]
  fn describe_survives_panicking_display() {
    let report = Report::new(HostileError).wrap_err("GET /teams");
    assert_eq!(classify(&report).category, ErrorCategory::Unknown);
    assert_eq!(describe(&report), "unprintable error");
    let message = describe(&eyre!("down").wrap_err("GET /teams"));
    assert!(message.starts_with("GET /teams") && message.contains("down"));
  }

  #[test]
  fn nested_query_error_keeps_category() {
    let inner = QueryError::new(ErrorCategory::Permission, "nope");
    let report = Report::new(inner).wrap_err("mutation failed");
    assert_eq!(classify(&report).category, ErrorCategory::Permission);
  }
}
