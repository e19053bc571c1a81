//! Refresh queue bookkeeping: callback registrations, longest-pattern
//! matching and the pending work list.

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::owner::OwnerFilter;

/// Callback run for a queued `(owner_key, endpoint)` pair.
pub type RefreshCallback =
  Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A pending unit of refresh work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueEntry {
  pub owner_key: String,
  pub endpoint: String,
}

impl QueueEntry {
  pub fn new(owner_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
    Self {
      owner_key: owner_key.into(),
      endpoint: endpoint.into(),
    }
  }
}

/// Normalize an endpoint for use in expiry keys: trimmed, without query
/// string and without trailing slash. Paginated requests for the same
/// resource therefore share one key.
pub fn normalize_endpoint(endpoint: &str) -> String {
  let endpoint = endpoint.trim();
  let path = endpoint.split('?').next().unwrap_or(endpoint);
  let trimmed = path.trim_end_matches('/');
  if trimmed.is_empty() {
    "/".to_string()
  } else {
    trimmed.to_string()
  }
}

/// Key under which an expiry entry is stored.
pub fn expiry_key(owner_key: &str, endpoint: &str) -> String {
  format!("{}:{}", owner_key, normalize_endpoint(endpoint))
}

/// Split an expiry key into owner key and endpoint.
pub fn split_expiry_key(key: &str) -> Option<(&str, &str)> {
  key.split_once(':')
}

/// Longest pattern first; ties break on the pattern text.
fn by_specificity(a: &str, b: &str) -> Ordering {
  b.len().cmp(&a.len()).then_with(|| a.cmp(b))
}

/// The pattern `endpoint` dispatches to among `patterns`, with the same
/// precedence registered refresh callbacks use.
pub fn resolve_pattern<'a>(endpoint: &str, patterns: &[&'a str]) -> Option<&'a str> {
  patterns
    .iter()
    .copied()
    .filter(|p| endpoint.contains(p))
    .min_by(|a, b| by_specificity(a, b))
}

pub(crate) struct Registration {
  pub pattern: String,
  pub scope: OwnerFilter,
  pub callback: RefreshCallback,
}

/// Registered callbacks plus a lazily rebuilt longest-first pattern list.
#[derive(Default)]
pub(crate) struct PatternRegistry {
  registrations: HashMap<u64, Registration>,
  next_id: u64,
  sorted: Option<Vec<u64>>,
}

impl PatternRegistry {
  pub fn register(&mut self, pattern: String, scope: OwnerFilter, callback: RefreshCallback) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    self.registrations.insert(
      id,
      Registration {
        pattern,
        scope,
        callback,
      },
    );
    self.sorted = None;
    id
  }

  pub fn unregister(&mut self, id: u64) -> bool {
    let removed = self.registrations.remove(&id).is_some();
    if removed {
      self.sorted = None;
    }
    removed
  }

  pub fn clear(&mut self) {
    self.registrations.clear();
    self.sorted = None;
  }

  /// Rebuild the longest-first ordering if a registration changed. Ties
  /// break on the pattern text, then on registration order.
  fn ensure_sorted(&mut self) {
    if self.sorted.is_some() {
      return;
    }
    let mut ids: Vec<u64> = self.registrations.keys().copied().collect();
    ids.sort_by(|a, b| {
      let pa = &self.registrations[a].pattern;
      let pb = &self.registrations[b].pattern;
      by_specificity(pa, pb).then(a.cmp(b))
    });
    self.sorted = Some(ids);
  }

  fn ordered(&self) -> impl Iterator<Item = &Registration> {
    self
      .sorted
      .as_deref()
      .unwrap_or_default()
      .iter()
      .filter_map(|id| self.registrations.get(id))
  }

  /// The most specific registration whose pattern occurs in `endpoint`.
  pub fn find(&mut self, endpoint: &str) -> Option<&Registration> {
    self.ensure_sorted();
    self
      .ordered()
      .find(|r| endpoint.contains(r.pattern.as_str()))
  }

  /// The pattern an endpoint resolves to, if any.
  pub fn matched_pattern(&mut self, endpoint: &str) -> Option<String> {
    self.find(endpoint).map(|r| r.pattern.clone())
  }

  /// Distinct registered patterns applicable to an owner key.
  pub fn patterns_for(&mut self, owner_key: &str) -> Vec<String> {
    self.ensure_sorted();
    let mut patterns: Vec<String> = Vec::new();
    for reg in self.ordered() {
      if reg.scope.matches_key(owner_key) && !patterns.contains(&reg.pattern) {
        patterns.push(reg.pattern.clone());
      }
    }
    patterns
  }
}

/// FIFO of pending refresh work with pattern-level duplicate suppression.
#[derive(Debug, Default)]
pub(crate) struct RefreshQueue {
  entries: VecDeque<QueueEntry>,
}

impl RefreshQueue {
  /// Two entries are equivalent when they share an owner and resolve to
  /// the same pattern; unmatched endpoints compare by normalized path.
  fn equivalent(registry: &mut PatternRegistry, a: &QueueEntry, b: &QueueEntry) -> bool {
    if a.owner_key != b.owner_key {
      return false;
    }
    match (
      registry.matched_pattern(&a.endpoint),
      registry.matched_pattern(&b.endpoint),
    ) {
      (Some(pa), Some(pb)) => pa == pb,
      (None, None) => normalize_endpoint(&a.endpoint) == normalize_endpoint(&b.endpoint),
      _ => false,
    }
  }

  /// Whether `entry` (or an equivalent one) is already pending.
  pub fn contains(&self, registry: &mut PatternRegistry, entry: &QueueEntry) -> bool {
    self
      .entries
      .iter()
      .any(|queued| Self::equivalent(registry, queued, entry))
  }

  /// Append unless an equivalent entry is queued or `in_flight`.
  /// Returns whether the entry was added.
  pub fn push(
    &mut self,
    registry: &mut PatternRegistry,
    entry: QueueEntry,
    in_flight: Option<&QueueEntry>,
  ) -> bool {
    if in_flight.is_some_and(|current| Self::equivalent(registry, current, &entry)) {
      return false;
    }
    if self.contains(registry, &entry) {
      return false;
    }
    self.entries.push_back(entry);
    true
  }

  pub fn pop(&mut self) -> Option<QueueEntry> {
    self.entries.pop_front()
  }

  pub fn remove_owner(&mut self, owner_key: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|e| e.owner_key != owner_key);
    before - self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn snapshot(&self) -> Vec<QueueEntry> {
    self.entries.iter().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn noop() -> RefreshCallback {
    Arc::new(|_, _| Box::pin(async { Ok(()) }))
  }

  #[test]
  fn test_normalize_endpoint() {
    assert_eq!(normalize_endpoint("/characters/1/clones/"), "/characters/1/clones");
    assert_eq!(
      normalize_endpoint(" /characters/1/assets/?page=3 "),
      "/characters/1/assets"
    );
    assert_eq!(normalize_endpoint("/"), "/");
    assert_eq!(expiry_key("character-1", "/x/"), "character-1:/x");
    assert_eq!(
      split_expiry_key("character-1:/x/y"),
      Some(("character-1", "/x/y"))
    );
  }

  #[test]
  fn test_longest_pattern_wins() {
    let mut registry = PatternRegistry::default();
    registry.register("/structures".into(), OwnerFilter::All, noop());
    registry.register(
      "/corporations/structures/detail".into(),
      OwnerFilter::All,
      noop(),
    );

    let endpoint = "/corporations/structures/detail/structures";
    assert_eq!(
      registry.matched_pattern(endpoint).as_deref(),
      Some("/corporations/structures/detail")
    );
    assert_eq!(
      registry.matched_pattern("/corporations/1/structures").as_deref(),
      Some("/structures")
    );
    assert!(registry.matched_pattern("/characters/1/mail").is_none());
  }

  #[test]
  fn test_resolve_pattern_agrees_with_registry() {
    let patterns = ["/structures", "/corporations/", "/wallet/journal/"];
    let mut registry = PatternRegistry::default();
    for p in patterns {
      registry.register(p.into(), OwnerFilter::All, noop());
    }

    for endpoint in [
      "/corporations/1/structures/",
      "/characters/1/wallet/journal/",
      "/characters/1/wallet/journal",
      "/characters/1/mail/",
    ] {
      assert_eq!(
        resolve_pattern(endpoint, &patterns),
        registry.matched_pattern(endpoint).as_deref()
      );
    }
    assert_eq!(
      resolve_pattern("/corporations/1/structures/", &patterns),
      Some("/corporations/")
    );
    // Expiry keys drop the trailing slash the pattern relies on
    let key_form = normalize_endpoint("/characters/1/wallet/journal/");
    assert_eq!(resolve_pattern(&key_form, &patterns), None);
  }

  #[test]
  fn test_registration_invalidates_sort_cache() {
    let mut registry = PatternRegistry::default();
    registry.register("/assets".into(), OwnerFilter::All, noop());
    assert_eq!(
      registry.matched_pattern("/characters/1/assets/names").as_deref(),
      Some("/assets")
    );

    let id = registry.register("/assets/names".into(), OwnerFilter::All, noop());
    assert_eq!(
      registry.matched_pattern("/characters/1/assets/names").as_deref(),
      Some("/assets/names")
    );

    assert!(registry.unregister(id));
    assert!(!registry.unregister(id));
    assert_eq!(
      registry.matched_pattern("/characters/1/assets/names").as_deref(),
      Some("/assets")
    );
  }

  #[test]
  fn test_patterns_for_owner_type() {
    let mut registry = PatternRegistry::default();
    registry.register("/clones".into(), OwnerFilter::Character, noop());
    registry.register("/structures".into(), OwnerFilter::Corporation, noop());
    registry.register("/blueprints".into(), OwnerFilter::All, noop());

    let mut character = registry.patterns_for("character-1");
    character.sort();
    assert_eq!(character, vec!["/blueprints", "/clones"]);

    let mut corporation = registry.patterns_for("corporation-2");
    corporation.sort();
    assert_eq!(corporation, vec!["/blueprints", "/structures"]);
  }

  #[test]
  fn test_queue_suppresses_by_pattern() {
    let mut registry = PatternRegistry::default();
    registry.register("/assets".into(), OwnerFilter::All, noop());
    let mut queue = RefreshQueue::default();

    assert!(queue.push(
      &mut registry,
      QueueEntry::new("character-1", "/characters/1/assets?page=1"),
      None
    ));
    // Different page, same pattern
    assert!(!queue.push(
      &mut registry,
      QueueEntry::new("character-1", "/characters/1/assets?page=2"),
      None
    ));
    // Different owner
    assert!(queue.push(
      &mut registry,
      QueueEntry::new("character-2", "/characters/2/assets"),
      None
    ));
    assert_eq!(queue.len(), 2);

    // In-flight equivalent is suppressed too
    let current = queue.pop().unwrap();
    assert!(!queue.push(
      &mut registry,
      QueueEntry::new("character-1", "/characters/1/assets"),
      Some(&current)
    ));

    assert_eq!(queue.remove_owner("character-2"), 1);
    assert_eq!(queue.len(), 0);
  }
}
