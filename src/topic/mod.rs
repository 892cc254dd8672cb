//! Topic names, topic filters, and the subscription directory.
//!
//! Topics are `/`-separated UTF-8 segment sequences. Names are concrete
//! (no wildcards); filters may use `+` for exactly one level and `#` for
//! the remainder, `#` only as the final level. Topics rooted at `$` are
//! excluded from root-level wildcard matches.

mod trie;

pub(crate) use trie::SubscriptionTrie;

use std::fmt;
use std::sync::Arc;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::message::QoS;

/// Errors from topic parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Malformed topic name (wildcards, NUL, empty)
    InvalidName(&'static str),
    /// Malformed topic filter (`#`/`+` placement)
    InvalidFilter(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::InvalidName(reason) => write!(f, "invalid topic name: {}", reason),
            TopicError::InvalidFilter(reason) => write!(f, "invalid topic filter: {}", reason),
        }
    }
}

impl std::error::Error for TopicError {}

/// A parsed topic name or topic filter.
///
/// Immutable once constructed; equality and hashing use the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    raw: CompactString,
    segments: SmallVec<[CompactString; 8]>,
    wildcard: bool,
}

impl Topic {
    /// Parse a concrete topic name, as used in a publish.
    pub fn name(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::InvalidName("topic name cannot be empty"));
        }
        if raw.len() > 65535 {
            return Err(TopicError::InvalidName("topic name exceeds maximum length"));
        }
        if raw.contains('\0') {
            return Err(TopicError::InvalidName(
                "topic name cannot contain null character",
            ));
        }
        if raw.contains('+') || raw.contains('#') {
            return Err(TopicError::InvalidName("topic name cannot contain wildcards"));
        }
        Ok(Self::from_validated(raw, false))
    }

    /// Parse a topic filter, as used in a subscription.
    pub fn filter(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::InvalidFilter("topic filter cannot be empty"));
        }
        if raw.len() > 65535 {
            return Err(TopicError::InvalidFilter(
                "topic filter exceeds maximum length",
            ));
        }
        if raw.contains('\0') {
            return Err(TopicError::InvalidFilter(
                "topic filter cannot contain null character",
            ));
        }

        let levels: Vec<&str> = raw.split('/').collect();
        let mut wildcard = false;
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') {
                // # must be the entire level and the last level
                if *level != "#" {
                    return Err(TopicError::InvalidFilter(
                        "multi-level wildcard must occupy entire level",
                    ));
                }
                if i != levels.len() - 1 {
                    return Err(TopicError::InvalidFilter(
                        "multi-level wildcard must be last level",
                    ));
                }
                wildcard = true;
            }
            if level.contains('+') {
                // + must be the entire level
                if *level != "+" {
                    return Err(TopicError::InvalidFilter(
                        "single-level wildcard must occupy entire level",
                    ));
                }
                wildcard = true;
            }
        }

        Ok(Self::from_validated(raw, wildcard))
    }

    fn from_validated(raw: &str, wildcard: bool) -> Self {
        Self {
            raw: CompactString::new(raw),
            segments: raw.split('/').map(CompactString::new).collect(),
            wildcard,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[CompactString] {
        &self.segments
    }

    /// True if this topic contains `+` or `#`
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// True for `$`-rooted topics (`$SYS/...`), which root-level wildcards
    /// never match.
    pub fn is_system(&self) -> bool {
        self.raw.starts_with('$')
    }

    /// Check whether this filter matches a concrete topic name, segment by
    /// segment from the root.
    pub fn matches(&self, name: &Topic) -> bool {
        if name.is_system() && (self.raw.starts_with('+') || self.raw.starts_with('#')) {
            return false;
        }

        let mut ni = 0;
        let mut fi = 0;
        while fi < self.segments.len() {
            let filter_level = &self.segments[fi];
            if filter_level == "#" {
                return true;
            }
            if ni >= name.segments.len() {
                return false;
            }
            if filter_level == "+" || *filter_level == name.segments[ni] {
                ni += 1;
                fi += 1;
            } else {
                return false;
            }
        }
        ni == name.segments.len()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A subscription entry: one client's interest in one filter at one QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: Arc<str>,
    /// Topic filter
    pub filter: Topic,
    /// Requested QoS
    pub qos: QoS,
}

impl Subscription {
    pub fn new(client_id: impl Into<Arc<str>>, filter: Topic, qos: QoS) -> Self {
        Self {
            client_id: client_id.into(),
            filter,
            qos,
        }
    }
}

/// Concurrent index from topic filters to subscribers.
///
/// Reads take a consistent snapshot of the trie and traverse without locks;
/// writes rebuild the touched path and publish it with a compare-and-swap on
/// the root, retrying on contention. At most one subscription exists per
/// `(client_id, filter)` pair; re-subscribing replaces the QoS.
pub struct SubscriptionDirectory {
    trie: SubscriptionTrie,
}

impl SubscriptionDirectory {
    pub fn new() -> Self {
        Self {
            trie: SubscriptionTrie::new(),
        }
    }

    /// Idempotent upsert keyed on `(client_id, filter)`.
    pub fn add(&self, subscription: Subscription) {
        self.trie.insert(subscription);
    }

    /// Remove one subscription. No-op (returns false) if absent.
    pub fn remove(&self, filter: &Topic, client_id: &str) -> bool {
        self.trie.remove(filter, client_id)
    }

    /// Every subscription whose filter matches `name`, deduplicated by
    /// `(client_id, filter)`. An empty directory yields an empty set.
    pub fn matching(&self, name: &Topic) -> Vec<Subscription> {
        self.trie.matches(name)
    }

    /// Drop every subscription a client holds; returns what was removed.
    /// Used on clean-session eviction.
    pub fn remove_all_for(&self, client_id: &str) -> Vec<Subscription> {
        self.trie.remove_client(client_id)
    }

    /// All subscriptions currently held by one client.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        self.trie.collect_for_client(client_id)
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.trie.subscription_count()
    }

    /// Repopulate from durable storage at startup.
    pub fn load<I: IntoIterator<Item = Subscription>>(&self, subscriptions: I) {
        for subscription in subscriptions {
            self.trie.insert(subscription);
        }
    }
}

impl Default for SubscriptionDirectory {
    fn default() -> Self {
        Self::new()
    }
}
