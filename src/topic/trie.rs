//! Copy-on-write trie backing the subscription directory.
//!
//! Nodes are immutable once published and shared through `Arc`. A writer
//! snapshots the root, rebuilds only the path its filter touches (all other
//! branches are shared with the snapshot), and installs the new root with a
//! compare-and-swap; a writer that lost a race rebuilds against the fresh
//! root and tries again. Readers clone the root `Arc` and traverse with no
//! lock held, so a match in flight always sees a consistent trie.

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;

use super::{Subscription, Topic};

#[derive(Debug, Clone, Default)]
struct TrieNode {
    /// Subscriptions whose filter terminates at this node
    subscriptions: Vec<Subscription>,
    /// Subscriptions whose filter ends with `#` at this level
    multi_wildcard: Vec<Subscription>,
    /// Literal children keyed by topic level
    children: AHashMap<CompactString, Arc<TrieNode>>,
    /// Single-level wildcard (`+`) child
    single_wildcard: Option<Arc<TrieNode>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.multi_wildcard.is_empty()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
    }
}

pub(crate) struct SubscriptionTrie {
    root: RwLock<Arc<TrieNode>>,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Arc::new(TrieNode::default())),
        }
    }

    fn snapshot(&self) -> Arc<TrieNode> {
        self.root.read().clone()
    }

    /// Install `next` if the root is still `expected`. The lock guards only
    /// the pointer swap; rebuilding happens outside it.
    fn publish(&self, expected: &Arc<TrieNode>, next: Arc<TrieNode>) -> bool {
        let mut root = self.root.write();
        if Arc::ptr_eq(&root, expected) {
            *root = next;
            true
        } else {
            false
        }
    }

    /// Upsert keyed on `(client_id, filter)`; an existing entry only has its
    /// QoS replaced.
    pub fn insert(&self, subscription: Subscription) {
        loop {
            let snapshot = self.snapshot();
            let next = Arc::new(inserted(
                &snapshot,
                subscription.filter.segments(),
                &subscription,
            ));
            if self.publish(&snapshot, next) {
                return;
            }
        }
    }

    /// Remove one `(client_id, filter)` entry; false if it was absent.
    pub fn remove(&self, filter: &Topic, client_id: &str) -> bool {
        loop {
            let snapshot = self.snapshot();
            let mut found = false;
            let next = Arc::new(removed(&snapshot, filter.segments(), client_id, &mut found));
            if !found {
                return false;
            }
            if self.publish(&snapshot, next) {
                return true;
            }
        }
    }

    /// Remove every entry belonging to `client_id`; returns what was removed.
    pub fn remove_client(&self, client_id: &str) -> Vec<Subscription> {
        loop {
            let snapshot = self.snapshot();
            let mut dropped = Vec::new();
            let next = Arc::new(without_client(&snapshot, client_id, &mut dropped));
            if dropped.is_empty() {
                return dropped;
            }
            if self.publish(&snapshot, next) {
                return dropped;
            }
        }
    }

    /// All subscriptions matching a concrete topic name.
    pub fn matches(&self, name: &Topic) -> Vec<Subscription> {
        let root = self.snapshot();
        let mut out = Vec::new();
        collect_matches(&root, name.segments(), 0, name.is_system(), &mut out);
        out
    }

    pub fn collect_for_client(&self, client_id: &str) -> Vec<Subscription> {
        let root = self.snapshot();
        let mut out = Vec::new();
        collect_client(&root, client_id, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        let root = self.snapshot();
        let mut count = 0;
        count_subscriptions(&root, &mut count);
        count
    }
}

fn upsert(list: &mut Vec<Subscription>, subscription: &Subscription) {
    if let Some(existing) = list
        .iter_mut()
        .find(|s| s.client_id == subscription.client_id)
    {
        existing.qos = subscription.qos;
    } else {
        list.push(subscription.clone());
    }
}

/// Rebuild the path for `segments`, sharing every untouched branch with the
/// source node.
fn inserted(node: &TrieNode, segments: &[CompactString], subscription: &Subscription) -> TrieNode {
    let mut next = node.clone();
    match segments.split_first() {
        None => upsert(&mut next.subscriptions, subscription),
        Some((level, rest)) => {
            if level == "#" {
                upsert(&mut next.multi_wildcard, subscription);
            } else if level == "+" {
                let empty = TrieNode::default();
                let child = node.single_wildcard.as_deref().unwrap_or(&empty);
                next.single_wildcard = Some(Arc::new(inserted(child, rest, subscription)));
            } else {
                let empty = TrieNode::default();
                let child = node.children.get(level).map(Arc::as_ref).unwrap_or(&empty);
                next.children
                    .insert(level.clone(), Arc::new(inserted(child, rest, subscription)));
            }
        }
    }
    next
}

/// Rebuild the path for `segments` without the client's entry, pruning nodes
/// that end up empty.
fn removed(
    node: &TrieNode,
    segments: &[CompactString],
    client_id: &str,
    found: &mut bool,
) -> TrieNode {
    let mut next = node.clone();
    match segments.split_first() {
        None => {
            let before = next.subscriptions.len();
            next.subscriptions.retain(|s| s.client_id.as_ref() != client_id);
            *found |= next.subscriptions.len() != before;
        }
        Some((level, rest)) => {
            if level == "#" {
                let before = next.multi_wildcard.len();
                next.multi_wildcard
                    .retain(|s| s.client_id.as_ref() != client_id);
                *found |= next.multi_wildcard.len() != before;
            } else if level == "+" {
                if let Some(child) = &node.single_wildcard {
                    let rebuilt = removed(child, rest, client_id, found);
                    next.single_wildcard = if rebuilt.is_empty() {
                        None
                    } else {
                        Some(Arc::new(rebuilt))
                    };
                }
            } else if let Some(child) = node.children.get(level) {
                let rebuilt = removed(child, rest, client_id, found);
                if rebuilt.is_empty() {
                    next.children.remove(level);
                } else {
                    next.children.insert(level.clone(), Arc::new(rebuilt));
                }
            }
        }
    }
    next
}

/// Rebuild the whole trie without one client's entries, pruning empty nodes.
fn without_client(node: &TrieNode, client_id: &str, dropped: &mut Vec<Subscription>) -> TrieNode {
    let mut next = TrieNode::default();

    for subscription in &node.subscriptions {
        if subscription.client_id.as_ref() == client_id {
            dropped.push(subscription.clone());
        } else {
            next.subscriptions.push(subscription.clone());
        }
    }
    for subscription in &node.multi_wildcard {
        if subscription.client_id.as_ref() == client_id {
            dropped.push(subscription.clone());
        } else {
            next.multi_wildcard.push(subscription.clone());
        }
    }

    if let Some(child) = &node.single_wildcard {
        let rebuilt = without_client(child, client_id, dropped);
        if !rebuilt.is_empty() {
            next.single_wildcard = Some(Arc::new(rebuilt));
        }
    }
    for (level, child) in &node.children {
        let rebuilt = without_client(child, client_id, dropped);
        if !rebuilt.is_empty() {
            next.children.insert(level.clone(), Arc::new(rebuilt));
        }
    }

    next
}

fn collect_matches(
    node: &TrieNode,
    segments: &[CompactString],
    index: usize,
    is_system: bool,
    out: &mut Vec<Subscription>,
) {
    // A trailing # also matches the levels above it, but never a $-root
    if !(is_system && index == 0) {
        out.extend_from_slice(&node.multi_wildcard);
    }

    if index >= segments.len() {
        out.extend_from_slice(&node.subscriptions);
        return;
    }

    if !(is_system && index == 0) {
        if let Some(child) = &node.single_wildcard {
            collect_matches(child, segments, index + 1, is_system, out);
        }
    }

    if let Some(child) = node.children.get(segments[index].as_str()) {
        collect_matches(child, segments, index + 1, is_system, out);
    }
}

fn collect_client(node: &TrieNode, client_id: &str, out: &mut Vec<Subscription>) {
    out.extend(
        node.subscriptions
            .iter()
            .chain(&node.multi_wildcard)
            .filter(|s| s.client_id.as_ref() == client_id)
            .cloned(),
    );
    if let Some(child) = &node.single_wildcard {
        collect_client(child, client_id, out);
    }
    for child in node.children.values() {
        collect_client(child, client_id, out);
    }
}

fn count_subscriptions(node: &TrieNode, count: &mut usize) {
    *count += node.subscriptions.len() + node.multi_wildcard.len();
    if let Some(child) = &node.single_wildcard {
        count_subscriptions(child, count);
    }
    for child in node.children.values() {
        count_subscriptions(child, count);
    }
}
