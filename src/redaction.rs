//! Redaction of sensitive query parameters and headers.
//!
//! A key is sensitive when its lowercased name contains any registered
//! fragment as a substring. The whole value list of a sensitive key is
//! replaced by a single [`REDACTED`] placeholder.
//!
//! ```rust
//! use faultline::redaction::{self, ValueMap};
//!
//! redaction::register_redaction_field("token");
//!
//! let mut query = ValueMap::new();
//! query.insert("AccessToken".to_string(), vec!["abc".to_string()]);
//! query.insert("page".to_string(), vec!["2".to_string()]);
//!
//! let query = redaction::redact(query);
//! assert_eq!(query["AccessToken"], ["********"]);
//! assert_eq!(query["page"], ["2"]);
//! ```
//!
//! Fragments are process-wide and can only be added. Registration may happen
//! while requests are being snapshotted: the registry swaps in a new list on
//! every append, and readers keep iterating the list they already cloned.

use indexmap::IndexMap;
use triomphe::Arc;

use crate::global_lock::GlobalLock;

/// Placeholder written in place of every redacted value.
pub const REDACTED: &str = "********";

/// Fragments every registry starts with.
pub const DEFAULT_FIELDS: &[&str] = &["password", "passphrase", "passwd", "secret"];

/// Multi-valued mapping used for query parameters and headers before they
/// are flattened into a [`RequestContext`](crate::RequestContext).
pub type ValueMap = IndexMap<String, Vec<String>>;

type Fragments = Arc<Vec<Box<str>>>;

static GLOBAL: RedactionRegistry = RedactionRegistry::new();

/// An append-only set of redaction fragments.
///
/// The process-wide registry is reached through [`register_redaction_field`]
/// and [`rules`]. Separate registries are mostly useful for tests.
pub struct RedactionRegistry {
    /// Fragments registered on top of [`DEFAULT_FIELDS`], `None` until the
    /// first registration.
    added: GlobalLock<Fragments>,
}

impl RedactionRegistry {
    /// Creates a registry holding only [`DEFAULT_FIELDS`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            added: GlobalLock::new(),
        }
    }

    /// Adds a fragment. The fragment is lowercased before it is stored.
    ///
    /// Registering a fragment that is already present has no effect. Empty
    /// fragments are ignored, since they would match every key.
    pub fn register(&self, fragment: &str) {
        let fragment = fragment.to_lowercase();
        if fragment.is_empty() {
            tracing::debug!("ignoring empty redaction field");
            return;
        }
        if DEFAULT_FIELDS.contains(&fragment.as_str()) {
            return;
        }

        {
            let mut guard = self.added.write();
            let slot = guard.get();
            let mut next = match slot {
                Some(current) if current.iter().any(|f| **f == *fragment) => return,
                Some(current) => Vec::clone(current),
                None => Vec::new(),
            };
            next.push(fragment.as_str().into());
            *slot = Some(Arc::new(next));
        }

        // Emitted without the lock held, so subscribers may read the rules.
        tracing::debug!(field = %fragment, "registered redaction field");
    }

    /// Takes a snapshot of the fragments registered so far.
    ///
    /// The snapshot is unaffected by later registrations.
    pub fn rules(&self) -> RedactionRules {
        RedactionRules {
            added: self.added.read().get().cloned(),
        }
    }
}

impl Default for RedactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RedactionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedactionRegistry")
            .field("rules", &self.rules())
            .finish()
    }
}

/// Adds a fragment to the process-wide redaction set.
///
/// Affects every snapshot taken afterwards, on every thread. There is no way
/// to remove a fragment again.
pub fn register_redaction_field(fragment: impl AsRef<str>) {
    GLOBAL.register(fragment.as_ref());
}

/// Snapshot of the process-wide redaction set.
pub fn rules() -> RedactionRules {
    GLOBAL.rules()
}

/// Redacts `map` in place using the process-wide redaction set.
pub fn redact(map: ValueMap) -> ValueMap {
    rules().redact(map)
}

/// An immutable view of a redaction set at one point in time.
#[derive(Clone, Default)]
pub struct RedactionRules {
    added: Option<Fragments>,
}

impl RedactionRules {
    /// Rules consisting of [`DEFAULT_FIELDS`] only.
    #[must_use]
    pub const fn defaults() -> Self {
        Self { added: None }
    }

    /// Iterates over every fragment, defaults first.
    pub fn fragments(&self) -> impl Iterator<Item = &str> {
        let defaults: &[&str] = DEFAULT_FIELDS;
        let added: &[Box<str>] = self.added.as_deref().map(Vec::as_slice).unwrap_or_default();
        defaults.iter().copied().chain(added.iter().map(|f| &**f))
    }

    /// Whether `key` names a sensitive field.
    pub fn matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fragments().any(|fragment| key.contains(fragment))
    }

    /// Replaces the value list of every matching key with `[REDACTED]`.
    ///
    /// Keys that do not match are left untouched, as is the key order.
    pub fn redact(&self, mut map: ValueMap) -> ValueMap {
        for (key, values) in map.iter_mut() {
            if self.matches(key) {
                *values = vec![REDACTED.to_string()];
            }
        }
        map
    }
}

impl core::fmt::Debug for RedactionRules {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.fragments()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[&str])]) -> ValueMap {
        entries
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_redacts_matching_keys_only() {
        let rules = RedactionRules::defaults();
        let out = rules.redact(map(&[
            ("password", &["hunter2"]),
            ("user", &["alice"]),
            ("client_secret", &["a", "b", "c"]),
        ]));

        assert_eq!(out["password"], [REDACTED]);
        assert_eq!(out["client_secret"], [REDACTED]);
        assert_eq!(out["user"], ["alice"]);
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            ["password", "user", "client_secret"]
        );
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let rules = RedactionRules::defaults();
        for key in ["PASSWORD", "Password", "UserPassphrase", "X-Passwd-Hint"] {
            assert!(rules.matches(key), "{key} should be redacted");
        }
        assert!(!rules.matches("pass"));
        assert!(!rules.matches("Authorization"));
    }

    #[test]
    fn test_registration_is_monotonic() {
        let registry = RedactionRegistry::new();
        let before = registry.rules();
        assert!(before.matches("password"));
        assert!(!before.matches("X-Api-Token"));

        registry.register("TOKEN");
        let after = registry.rules();
        assert!(after.matches("password"));
        assert!(after.matches("X-Api-Token"));

        // snapshots taken earlier are unaffected
        assert!(!before.matches("X-Api-Token"));
    }

    #[test]
    fn test_duplicate_and_empty_registrations() {
        let registry = RedactionRegistry::new();
        registry.register("token");
        registry.register("Token");
        registry.register("secret");
        registry.register("");

        let fragments: Vec<_> = registry.rules().fragments().map(str::to_owned).collect();
        assert_eq!(
            fragments,
            ["password", "passphrase", "passwd", "secret", "token"]
        );
    }

    #[test]
    fn test_concurrent_registration_and_reads() {
        let registry = std::sync::Arc::new(RedactionRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.register(&format!("field{i}x{j}"));
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let rules = registry.rules();
                        let n = rules.fragments().count();
                        assert!(n >= DEFAULT_FIELDS.len());
                        assert!(rules.matches("password"));
                    }
                })
            })
            .collect();
        for t in writers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        assert_eq!(
            registry.rules().fragments().count(),
            DEFAULT_FIELDS.len() + 200
        );
    }

    /// Reads the rules of `registry` from inside every event.
    struct RulesReadingSubscriber {
        registry: std::sync::Arc<RedactionRegistry>,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    impl tracing::Subscriber for RulesReadingSubscriber {
        fn enabled(&self, _metadata: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _span: &tracing::span::Id, _values: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _span: &tracing::span::Id, _follows: &tracing::span::Id) {}

        fn event(&self, _event: &tracing::Event<'_>) {
            let count = self.registry.rules().fragments().count();
            self.seen.lock().unwrap().push(count);
        }

        fn enter(&self, _span: &tracing::span::Id) {}

        fn exit(&self, _span: &tracing::span::Id) {}
    }

    #[test]
    fn test_registration_event_can_read_rules() {
        let registry = std::sync::Arc::new(RedactionRegistry::new());
        let subscriber = std::sync::Arc::new(RulesReadingSubscriber {
            registry: registry.clone(),
            seen: std::sync::Mutex::default(),
        });

        tracing::subscriber::with_default(subscriber.clone(), || {
            registry.register("token");
        });

        let seen = subscriber.seen.lock().unwrap();
        assert_eq!(*seen, [DEFAULT_FIELDS.len() + 1]);
    }

    #[test]
    fn test_rules_send_sync() {
        static_assertions::assert_impl_all!(RedactionRules: Send, Sync, Clone);
        static_assertions::assert_impl_all!(RedactionRegistry: Send, Sync);
    }
}
