//! Canonical cache keys.
//!
//! A key is an ordered list of string segments, e.g. `["team", "byEvent", "E1"]`.
//! Keys are built from an entity type plus parameters, and every parameter is
//! normalized to a string so that equal requests always produce equal keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical identifier for a cacheable resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
  /// Build a key from raw segments.
  ///
  /// Used for prefixes and for keys restored from storage. Prefer
  /// [`make_key`] or [`EntityKeys`] for keys that identify data.
  pub fn from_segments<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  /// The empty key. It is a prefix of every key.
  pub fn root() -> Self {
    Self(Vec::new())
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The leading segment, which names the entity type.
  pub fn entity_type(&self) -> Option<&str> {
    self.0.first().map(String::as_str)
  }

  /// A key is well formed when it has at least one segment and a non-empty
  /// entity type.
  pub fn is_well_formed(&self) -> bool {
    self.entity_type().is_some_and(|e| !e.is_empty())
  }

  /// Append one parameter and return the extended key.
  pub fn push(mut self, param: impl Into<KeyParam>) -> Self {
    self.0.push(param.into().normalize());
    self
  }

  /// True if `self` is a leading subsequence of `other`.
  pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
    is_prefix_of(self, other)
  }

  /// Stable SHA-256 hex digest of the key, used as a storage id.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for segment in &self.0 {
      // Length-prefix each segment so ["ab","c"] and ["a","bc"] differ
      hasher.update((segment.len() as u64).to_be_bytes());
      hasher.update(segment.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }
      write!(f, "{:?}", segment)?;
    }
    f.write_str("]")
  }
}

/// A parameter accepted by [`make_key`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyParam {
  Str(String),
  Int(i64),
  UInt(u64),
  Bool(bool),
  /// Absent optional parameter
  Absent,
  /// Named parameters; order of insertion never matters
  Map(BTreeMap<String, String>),
}

impl KeyParam {
  /// Render the parameter as its canonical segment string.
  pub fn normalize(&self) -> String {
    match self {
      Self::Str(s) => s.clone(),
      Self::Int(n) => n.to_string(),
      Self::UInt(n) => n.to_string(),
      Self::Bool(b) => b.to_string(),
      Self::Absent => String::new(),
      Self::Map(map) => map
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&"),
    }
  }

  /// Build a map parameter from name/value pairs.
  pub fn map<I, K, V>(pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<KeyParam>,
  {
    Self::Map(
      pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into().normalize()))
        .collect(),
    )
  }
}

impl From<&str> for KeyParam {
  fn from(value: &str) -> Self {
    Self::Str(value.to_string())
  }
}

impl From<String> for KeyParam {
  fn from(value: String) -> Self {
    Self::Str(value)
  }
}

impl From<&String> for KeyParam {
  fn from(value: &String) -> Self {
    Self::Str(value.clone())
  }
}

impl From<bool> for KeyParam {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

macro_rules! int_param {
  ($variant:ident, $wide:ty, $($t:ty),*) => {
    $(
      impl From<$t> for KeyParam {
        fn from(value: $t) -> Self {
          Self::$variant(value as $wide)
        }
      }
    )*
  };
}

int_param!(Int, i64, i8, i16, i32, i64, isize);
int_param!(UInt, u64, u8, u16, u32, u64, usize);

impl<T: Into<KeyParam>> From<Option<T>> for KeyParam {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(Self::Absent)
  }
}

/// Derive the canonical key for an entity type and its parameters.
pub fn make_key<I, P>(entity_type: &str, params: I) -> CacheKey
where
  I: IntoIterator<Item = P>,
  P: Into<KeyParam>,
{
  let mut segments = vec![entity_type.to_string()];
  segments.extend(params.into_iter().map(|p| p.into().normalize()));
  CacheKey(segments)
}

/// True if `candidate`'s segments are a leading subsequence of `full`'s.
pub fn is_prefix_of(candidate: &CacheKey, full: &CacheKey) -> bool {
  candidate.0.len() <= full.0.len() && candidate.0.iter().zip(&full.0).all(|(a, b)| a == b)
}

/// Types that map themselves onto a cache key.
///
/// Lets applications describe their queries as enums, as opposed to
/// assembling segment lists at every call site.
pub trait QueryKey {
  fn cache_key(&self) -> CacheKey;

  /// Human readable description for logs
  fn description(&self) -> String {
    self.cache_key().to_string()
  }
}

impl QueryKey for CacheKey {
  fn cache_key(&self) -> CacheKey {
    self.clone()
  }
}

/// Key factory for one entity type.
///
/// Produces the usual key families so that every key for an entity shares the
/// `[entity]` prefix:
///
/// ```ignore
/// let teams = EntityKeys::new("team");
/// teams.all();                    // ["team"]
/// teams.scope("byEvent", ["E1"]); // ["team", "byEvent", "E1"]
/// teams.detail("T1");             // ["team", "detail", "T1"]
/// ```
#[derive(Clone, Debug)]
pub struct EntityKeys {
  entity_type: String,
}

impl EntityKeys {
  pub fn new(entity_type: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
    }
  }

  pub fn entity_type(&self) -> &str {
    &self.entity_type
  }

  pub fn all(&self) -> CacheKey {
    make_key::<_, KeyParam>(&self.entity_type, [])
  }

  pub fn scope<I, P>(&self, scope: &str, params: I) -> CacheKey
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyParam>,
  {
    let mut key = self.all().push(scope);
    for param in params {
      key = key.push(param);
    }
    key
  }

  pub fn detail(&self, id: impl Into<KeyParam>) -> CacheKey {
    self.all().push("detail").push(id)
  }

  pub fn lists(&self) -> CacheKey {
    self.all().push("list")
  }

  pub fn list(&self, filters: KeyParam) -> CacheKey {
    self.lists().push(filters)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn make_key_is_deterministic() {
    let a = make_key("team", ["byEvent", "E1"]);
    let b = make_key("team", ["byEvent", "E1"]);
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.segments(), ["team", "byEvent", "E1"]);
  }

  #[test]
  fn numbers_normalize_to_strings() {
    let from_int = make_key("event", [KeyParam::from(42u32)]);
    let from_str = make_key("event", ["42"]);
    assert_eq!(from_int, from_str);

    let negative = make_key("event", [KeyParam::from(-7i64)]);
    assert_eq!(negative.segments()[1], "-7");
  }

  #[test]
  fn map_params_ignore_insertion_order() {
    let a = KeyParam::map([("status", "open"), ("page", "2")]);
    let b = KeyParam::map([("page", "2"), ("status", "open")]);
    assert_eq!(a.normalize(), b.normalize());
    assert_eq!(a.normalize(), "page=2&status=open");
  }

  #[test]
  fn absent_params_render_empty() {
    let key = make_key("boards", [KeyParam::from(None::<&str>)]);
    assert_eq!(key.segments(), ["boards", ""]);
  }

  #[test]
  fn prefix_matching() {
    let full = make_key("team", ["byEvent", "E1"]);
    assert!(is_prefix_of(&CacheKey::root(), &full));
    assert!(is_prefix_of(&make_key::<_, &str>("team", []), &full));
    assert!(is_prefix_of(&make_key("team", ["byEvent"]), &full));
    assert!(is_prefix_of(&full, &full));

    assert!(!is_prefix_of(&make_key("team", ["byEvent", "E2"]), &full));
    assert!(!is_prefix_of(&make_key("teams", ["byEvent"]), &full));
    assert!(!is_prefix_of(&make_key("team", ["byEvent", "E1", "x"]), &full));
    // segment boundaries matter, not string prefixes
    assert!(!is_prefix_of(&make_key("team", ["by"]), &full));
  }

  #[test]
  fn digest_respects_segment_boundaries() {
    let a = CacheKey::from_segments(["ab", "c"]);
    let b = CacheKey::from_segments(["a", "bc"]);
    assert_ne!(a.digest(), b.digest());
  }

  #[test]
  fn display_renders_json_like_array() {
    let key = make_key("team", ["byEvent", "E1"]);
    assert_eq!(key.to_string(), r#"["team","byEvent","E1"]"#);
  }

  #[test]
  fn well_formedness() {
    assert!(make_key::<_, &str>("team", []).is_well_formed());
    assert!(!CacheKey::root().is_well_formed());
    assert!(!make_key::<_, &str>("", []).is_well_formed());
  }

  #[test]
  fn entity_key_factory() {
    let teams = EntityKeys::new("team");
    assert_eq!(teams.all().segments(), ["team"]);
    assert_eq!(teams.scope("byEvent", ["E1"]).segments(), ["team", "byEvent", "E1"]);
    assert_eq!(teams.detail(7u64).segments(), ["team", "detail", "7"]);
    assert!(teams.lists().is_prefix_of(&teams.list(KeyParam::map([("q", "x")]))));
    assert!(teams.all().is_prefix_of(&teams.detail("T1")));
  }
}
