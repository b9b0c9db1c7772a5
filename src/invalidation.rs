//! Invalidation routing.
//!
//! A mutation of some entity type invalidates a set of cache-key prefixes.
//! Which prefixes is declared once, in an [`InvalidationRules`] table, instead
//! of at every call site. The [`InvalidationRouter`] expands the table for a
//! concrete mutation, marks the matching entries stale, and refetches the ones
//! somebody is watching.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, KeyParam};
use crate::fetch::FetchExecutor;

/// Kind of write performed by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  pub const ALL: [MutationKind; 3] = [Self::Create, Self::Update, Self::Delete];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Named identifiers touched by a mutation, e.g. `eventId = E1`.
///
/// Values are normalized the same way key parameters are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedIds(BTreeMap<String, String>);

impl AffectedIds {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an id. Absent values are ignored, which truncates any template
  /// that needs them.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<KeyParam>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<KeyParam>) {
    let value = value.into();
    if value != KeyParam::Absent {
      self.0.insert(name.into(), value.normalize());
    }
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Placeholder(String),
  /// Trailing `*`: any extension
  Wildcard,
}

/// A key prefix with `{name}` placeholders, e.g. `["team", "byEvent", "{eventId}"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct PrefixTemplate {
  segments: Vec<Segment>,
}

impl PrefixTemplate {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let segments = segments
      .into_iter()
      .map(|s| {
        let s = s.as_ref();
        if s == "*" {
          Segment::Wildcard
        } else if let Some(name) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
          Segment::Placeholder(name.to_string())
        } else {
          Segment::Literal(s.to_string())
        }
      })
      .collect();
    Self { segments }
  }

  /// Fill placeholders from `ids`.
  ///
  /// Expansion stops at the first missing id or at a wildcard; the result is
  /// a shorter, broader prefix.
  pub fn expand(&self, ids: &AffectedIds) -> CacheKey {
    let mut out = Vec::with_capacity(self.segments.len());
    for segment in &self.segments {
      match segment {
        Segment::Literal(s) => out.push(s.clone()),
        Segment::Placeholder(name) => match ids.get(name) {
          Some(value) => out.push(value.to_string()),
          None => break,
        },
        Segment::Wildcard => break,
      }
    }
    CacheKey::from_segments(out)
  }
}

impl From<Vec<String>> for PrefixTemplate {
  fn from(segments: Vec<String>) -> Self {
    Self::new(segments)
  }
}

impl fmt::Display for PrefixTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self
      .segments
      .iter()
      .map(|s| match s {
        Segment::Literal(l) => l.clone(),
        Segment::Placeholder(p) => format!("{{{}}}", p),
        Segment::Wildcard => "*".to_string(),
      })
      .collect();
    write!(f, "[{}]", parts.join(", "))
  }
}

/// One rule as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
  pub entity: String,
  /// Omitted means every kind
  #[serde(default)]
  pub kinds: Vec<MutationKind>,
  pub prefixes: Vec<PrefixTemplate>,
}

/// `(entity type, mutation kind) -> prefix templates`.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
  rules: HashMap<(String, MutationKind), Vec<PrefixTemplate>>,
}

impl InvalidationRules {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add templates for one entity and kind. Repeated calls accumulate.
  pub fn on<I>(mut self, entity: &str, kind: MutationKind, templates: I) -> Self
  where
    I: IntoIterator<Item = PrefixTemplate>,
  {
    self
      .rules
      .entry((entity.to_string(), kind))
      .or_default()
      .extend(templates);
    self
  }

  /// Add the same templates for every mutation kind.
  pub fn on_any<I>(mut self, entity: &str, templates: I) -> Self
  where
    I: IntoIterator<Item = PrefixTemplate>,
  {
    let templates: Vec<PrefixTemplate> = templates.into_iter().collect();
    for kind in MutationKind::ALL {
      self = self.on(entity, kind, templates.iter().cloned());
    }
    self
  }

  pub fn from_config(rules: &[RuleConfig]) -> Self {
    rules.iter().fold(Self::new(), |table, rule| {
      if rule.kinds.is_empty() {
        table.on_any(&rule.entity, rule.prefixes.iter().cloned())
      } else {
        rule.kinds.iter().fold(table, |table, kind| {
          table.on(&rule.entity, *kind, rule.prefixes.iter().cloned())
        })
      }
    })
  }

  pub fn has_rule(&self, entity: &str, kind: MutationKind) -> bool {
    self.rules.contains_key(&(entity.to_string(), kind))
  }

  /// Expand the rule for a concrete mutation. Pure; never reads the cache.
  ///
  /// Without a rule, the whole entity type is invalidated.
  pub fn prefixes_for(
    &self,
    entity: &str,
    kind: MutationKind,
    ids: &AffectedIds,
  ) -> BTreeSet<CacheKey> {
    let Some(templates) = self.rules.get(&(entity.to_string(), kind)) else {
      debug!(entity, %kind, "No invalidation rule, invalidating entity type");
      return BTreeSet::from([CacheKey::from_segments([entity])]);
    };

    templates
      .iter()
      .filter_map(|template| {
        let prefix = template.expand(ids);
        if prefix.is_empty() {
          warn!(entity, %kind, %template, "Template expanded to an empty prefix, skipping");
          None
        } else {
          Some(prefix)
        }
      })
      .collect()
  }
}

/// Applies invalidation rules to the cache.
#[derive(Clone)]
pub struct InvalidationRouter {
  rules: Arc<InvalidationRules>,
  store: CacheStore,
  executor: FetchExecutor,
}

impl InvalidationRouter {
  pub fn new(rules: InvalidationRules, executor: FetchExecutor) -> Self {
    Self {
      rules: Arc::new(rules),
      store: executor.store().clone(),
      executor,
    }
  }

  pub fn rules(&self) -> &InvalidationRules {
    &self.rules
  }

  /// Invalidate everything a mutation may have changed.
  ///
  /// Marks every entry under the expanded prefixes stale and refetches each
  /// subscribed one exactly once. Returns the prefixes.
  pub fn invalidate(
    &self,
    entity: &str,
    kind: MutationKind,
    ids: &AffectedIds,
  ) -> BTreeSet<CacheKey> {
    let prefixes = self.rules.prefixes_for(entity, kind, ids);
    let (marked, refetched) = self.apply(&prefixes);
    info!(
      entity,
      %kind,
      prefixes = prefixes.len(),
      marked,
      refetched = refetched.len(),
      "Invalidated"
    );
    prefixes
  }

  /// Invalidate one prefix directly, bypassing the rules.
  ///
  /// Returns the keys that were refetched.
  pub fn invalidate_prefix(&self, prefix: &CacheKey) -> BTreeSet<CacheKey> {
    let (marked, refetched) = self.apply(&BTreeSet::from([prefix.clone()]));
    info!(prefix = %prefix, marked, refetched = refetched.len(), "Invalidated prefix");
    refetched
  }

  fn apply(&self, prefixes: &BTreeSet<CacheKey>) -> (usize, BTreeSet<CacheKey>) {
    let marked: usize = prefixes
      .iter()
      .map(|prefix| self.store.mark_stale(prefix).len())
      .sum();

    // Overlapping prefixes can match the same key; the set refetches it once
    let observed: BTreeSet<CacheKey> = prefixes
      .iter()
      .flat_map(|prefix| self.store.subscribed_keys_matching(prefix))
      .collect();

    let refetched = observed
      .into_iter()
      .filter(|key| {
        let started = self.executor.refetch(key);
        if !started {
          debug!(key = %key, "Subscribed key has no registered fetcher");
        }
        started
      })
      .collect();
    (marked, refetched)
  }
}
