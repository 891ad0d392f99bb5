//! Cache key layout
//!
//! Keys follow `{namespace}:{identifier}[:{subtype}]:{version}`. The version
//! suffix lets a schema change orphan every old key at once; orphaned keys are
//! never deleted, they simply expire.

use std::fmt;

/// Key namespaces. Two namespaces never share a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Conversation,
    Roadmap,
    Flashcard,
    Quiz,
    User,
    Tag,
    Lock,
    Rate,
    Metric,
    Blacklist,
}

impl Namespace {
    /// Namespaces holding application data, reported by metrics summaries
    pub const CACHEABLE: [Namespace; 5] = [
        Namespace::Conversation,
        Namespace::Roadmap,
        Namespace::Flashcard,
        Namespace::Quiz,
        Namespace::User,
    ];

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Conversation => "conv",
            Self::Roadmap => "roadmap",
            Self::Flashcard => "flashcard",
            Self::Quiz => "quiz",
            Self::User => "user",
            Self::Tag => "tag",
            Self::Lock => "lock",
            Self::Rate => "rate",
            Self::Metric => "metric",
            Self::Blacklist => "blacklist",
        }
    }

    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        let ns = match prefix {
            "conv" => Self::Conversation,
            "roadmap" => Self::Roadmap,
            "flashcard" => Self::Flashcard,
            "quiz" => Self::Quiz,
            "user" => Self::User,
            "tag" => Self::Tag,
            "lock" => Self::Lock,
            "rate" => Self::Rate,
            "metric" => Self::Metric,
            "blacklist" => Self::Blacklist,
            _ => return None,
        };
        Some(ns)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Metrics namespace of an arbitrary key: everything before the first `:`
#[must_use]
pub fn namespace_of(key: &str) -> &str {
    match key.split_once(':') {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => "other",
    }
}

/// Escape glob metacharacters so `value` matches itself in a SCAN pattern
#[must_use]
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Which stampede lock a key guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Cold-start fetch; losers poll
    Fetch,
    /// Background SWR refresh; losers skip
    Refresh,
}

impl LockKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Refresh => "refresh",
        }
    }
}

/// Builds versioned keys for every namespace
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    version: String,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("v1")
    }
}

impl KeyBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// `{namespace}:{identifier}:{version}`
    #[must_use]
    pub fn key(&self, namespace: Namespace, identifier: &str) -> String {
        format!("{}:{identifier}:{}", namespace.prefix(), self.version)
    }

    /// `{namespace}:{identifier}:{subtype}:{version}`
    #[must_use]
    pub fn key_with_subtype(&self, namespace: Namespace, identifier: &str, subtype: &str) -> String {
        format!("{}:{identifier}:{subtype}:{}", namespace.prefix(), self.version)
    }

    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> String {
        self.key(Namespace::Conversation, conversation_id)
    }

    #[must_use]
    pub fn roadmap(&self, roadmap_id: &str) -> String {
        self.key(Namespace::Roadmap, roadmap_id)
    }

    #[must_use]
    pub fn flashcard(&self, deck_id: &str) -> String {
        self.key(Namespace::Flashcard, deck_id)
    }

    #[must_use]
    pub fn quiz(&self, quiz_id: &str) -> String {
        self.key(Namespace::Quiz, quiz_id)
    }

    #[must_use]
    pub fn user(&self, user_id: &str, subtype: &str) -> String {
        self.key_with_subtype(Namespace::User, user_id, subtype)
    }

    #[must_use]
    pub fn tag(&self, tag: &str) -> String {
        self.key(Namespace::Tag, tag)
    }

    /// SCAN pattern matching every tag set of the current version
    #[must_use]
    pub fn tag_pattern(&self) -> String {
        format!("{}:*:{}", Namespace::Tag.prefix(), self.version)
    }

    /// Inverse of [`tag`](Self::tag); `None` for keys of another version
    #[must_use]
    pub fn tag_name<'a>(&self, tag_key: &'a str) -> Option<&'a str> {
        tag_key
            .strip_prefix(Namespace::Tag.prefix())?
            .strip_prefix(':')?
            .strip_suffix(self.version.as_str())?
            .strip_suffix(':')
    }

    #[must_use]
    pub fn lock(&self, kind: LockKind, key: &str) -> String {
        self.key_with_subtype(Namespace::Lock, kind.as_str(), key)
    }

    #[must_use]
    pub fn rate_window(&self, identifier: &str, window_index: u64) -> String {
        format!(
            "{}:{identifier}:{window_index}:{}",
            Namespace::Rate.prefix(),
            self.version
        )
    }

    /// SCAN pattern matching every window of `identifier`
    #[must_use]
    pub fn rate_pattern(&self, identifier: &str) -> String {
        format!(
            "{}:{}:*:{}",
            Namespace::Rate.prefix(),
            escape_glob(identifier),
            self.version
        )
    }

    #[must_use]
    pub fn metric_hits(&self) -> String {
        self.key(Namespace::Metric, "hits")
    }

    #[must_use]
    pub fn metric_misses(&self) -> String {
        self.key(Namespace::Metric, "misses")
    }

    #[must_use]
    pub fn metric_latency(&self, namespace: &str) -> String {
        self.key_with_subtype(Namespace::Metric, "latency", namespace)
    }

    #[must_use]
    pub fn metric_latency_pattern(&self) -> String {
        format!("{}:latency:*:{}", Namespace::Metric.prefix(), self.version)
    }

    #[must_use]
    pub fn blacklist(&self, token: &str) -> String {
        self.key(Namespace::Blacklist, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_namespace_and_version() {
        let keys = KeyBuilder::new("v2");
        assert_eq!(keys.conversation("abc"), "conv:abc:v2");
        assert_eq!(keys.user("42", "profile"), "user:42:profile:v2");
        assert_eq!(keys.rate_window("10.0.0.1", 7), "rate:10.0.0.1:7:v2");
        assert_eq!(keys.metric_latency("conv"), "metric:latency:conv:v2");
    }

    #[test]
    fn fetch_and_refresh_locks_never_collide() {
        let keys = KeyBuilder::default();
        let fetch = keys.lock(LockKind::Fetch, "conv:abc:v1");
        let refresh = keys.lock(LockKind::Refresh, "conv:abc:v1");
        assert_ne!(fetch, refresh);
        assert!(fetch.starts_with("lock:fetch:"));
        assert!(refresh.starts_with("lock:refresh:"));
    }

    #[test]
    fn tag_names_round_trip_through_keys() {
        let keys = KeyBuilder::default();
        let key = keys.tag("user:42");
        assert_eq!(key, "tag:user:42:v1");
        assert_eq!(keys.tag_name(&key), Some("user:42"));
        assert_eq!(KeyBuilder::new("v2").tag_name(&key), None);
    }

    #[test]
    fn namespace_of_uses_first_segment() {
        assert_eq!(namespace_of("user:42:profile"), "user");
        assert_eq!(namespace_of("plainkey"), "other");
        assert_eq!(namespace_of(":leading"), "other");
    }

    #[test]
    fn rate_pattern_escapes_identifier() {
        let keys = KeyBuilder::default();
        assert_eq!(keys.rate_pattern("a*b"), "rate:a\\*b:*:v1");
    }

    #[test]
    fn prefixes_are_unique() {
        let all = [
            Namespace::Conversation,
            Namespace::Roadmap,
            Namespace::Flashcard,
            Namespace::Quiz,
            Namespace::User,
            Namespace::Tag,
            Namespace::Lock,
            Namespace::Rate,
            Namespace::Metric,
            Namespace::Blacklist,
        ];
        for ns in all {
            assert_eq!(Namespace::from_prefix(ns.prefix()), Some(ns));
        }
    }
}
