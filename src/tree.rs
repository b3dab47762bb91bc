//! Wildcard subscription tree and topic matcher.
//!
//! Subscriptions are stored level by level; `+` and `#` live on dedicated
//! child slots keyed literally, and their wildcard meaning is applied only
//! while matching a concrete publish topic:
//!
//! - `+` consumes exactly one level.
//! - `#` matches all remaining levels, but only as the final level of a
//!   subscription, and only once at least the path up to its parent has
//!   been consumed (`a/#` matches `a/b` and `a/b/c`, never `a` itself).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::Client;
use crate::error::{Error, Result};

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// The client is the first subscriber on this exact path.
    pub first: bool,
    /// The client was actually inserted (false when already subscribed).
    pub added: bool,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// The client was the final subscriber on this exact path.
    pub last: bool,
    /// The client was actually removed (false when it was not subscribed).
    pub removed: bool,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    wild_plus: Option<Box<Node>>,
    wild_hash: Option<Box<Node>>,
    subscribers: Vec<Arc<Client>>,
}

/// Subscription storage and matcher, safe for concurrent use.
pub struct TopicTree {
    root: RwLock<Node>,
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTree {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::default()),
        }
    }

    /// Insert `client` as a subscriber of `topic` (which may carry
    /// wildcards). Returns whether it is the first subscriber on the path.
    pub fn add_subscription(&self, client: &Arc<Client>, topic: &str) -> Result<SubscribeOutcome> {
        let levels = split_levels(topic).map_err(|_| Error::MalformedTopic(topic.to_string()))?;
        validate_pattern(&levels).map_err(|_| Error::MalformedTopic(topic.to_string()))?;

        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in &levels {
            node = match *level {
                "+" => &mut **node.wild_plus.get_or_insert_with(Box::default),
                "#" => &mut **node.wild_hash.get_or_insert_with(Box::default),
                _ => node.children.entry(level.to_string()).or_default(),
            };
        }

        if node.subscribers.iter().any(|c| c.id() == client.id()) {
            return Ok(SubscribeOutcome { first: false, added: false });
        }

        let first = node.subscribers.is_empty();
        node.subscribers.push(Arc::clone(client));
        Ok(SubscribeOutcome { first, added: true })
    }

    /// Remove `client_id`'s subscription on `topic`. Returns whether it
    /// was the last subscriber on the path.
    pub fn remove_subscription(&self, client_id: &str, topic: &str) -> Result<RemoveOutcome> {
        let levels = split_levels(topic).map_err(|_| Error::MalformedTopic(topic.to_string()))?;
        validate_pattern(&levels).map_err(|_| Error::MalformedTopic(topic.to_string()))?;

        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in &levels {
            let next = match *level {
                "+" => node.wild_plus.as_deref_mut(),
                "#" => node.wild_hash.as_deref_mut(),
                _ => node.children.get_mut(*level),
            };
            node = match next {
                Some(n) => n,
                None => return Ok(RemoveOutcome { last: false, removed: false }),
            };
        }

        let before = node.subscribers.len();
        node.subscribers.retain(|c| c.id() != client_id);
        let removed = node.subscribers.len() != before;
        Ok(RemoveOutcome {
            last: removed && node.subscribers.is_empty(),
            removed,
        })
    }

    /// All clients whose subscriptions match the concrete topic `topic`.
    ///
    /// The result is a set: a client matching through several paths
    /// appears once. Malformed or wildcard-bearing topics error.
    pub fn subscribers_of(&self, topic: &str) -> Result<Vec<Arc<Client>>> {
        let levels = split_levels(topic).map_err(|_| Error::Match(topic.to_string()))?;
        if levels.iter().any(|l| l.contains('+') || l.contains('#')) {
            return Err(Error::Match(topic.to_string()));
        }

        let root = self.root.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        collect(&root, &levels, 0, &mut seen, &mut out);
        Ok(out)
    }

    /// Sweep every subscription of `client_id` out of the tree.
    ///
    /// Returns the affected topic paths, each flagged with whether the
    /// client was the last subscriber there (so the caller can release
    /// the matching upstream subscription).
    pub fn remove_client(&self, client_id: &str) -> Vec<(String, bool)> {
        let mut root = self.root.write();
        let mut out = Vec::new();
        let mut path = Vec::new();
        sweep(&mut root, &mut path, client_id, &mut out);
        out
    }
}

/// Tokenize a topic into levels.
///
/// A leading `/` produces a single leading empty level; any other empty
/// level (interior `//` or trailing `/`) is illegal, as is an empty topic.
fn split_levels(topic: &str) -> std::result::Result<Vec<&str>, ()> {
    if topic.is_empty() {
        return Err(());
    }
    let levels: Vec<&str> = topic.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.is_empty() && i != 0 {
            return Err(());
        }
    }
    Ok(levels)
}

/// Wildcard placement rules for subscription patterns.
fn validate_pattern(levels: &[&str]) -> std::result::Result<(), ()> {
    for (i, level) in levels.iter().enumerate() {
        match *level {
            "#" if i != levels.len() - 1 => return Err(()),
            "#" | "+" => {}
            _ if level.contains('+') || level.contains('#') => return Err(()),
            _ => {}
        }
    }
    Ok(())
}

fn collect(
    node: &Node,
    levels: &[&str],
    i: usize,
    seen: &mut HashSet<Arc<str>>,
    out: &mut Vec<Arc<Client>>,
) {
    if i == levels.len() {
        take_subscribers(node, seen, out);
        return;
    }

    // A `#` edge swallows every remaining level, but never zero of them:
    // it is only consulted while levels remain to consume.
    if let Some(hash) = &node.wild_hash {
        take_subscribers(hash, seen, out);
    }
    if let Some(child) = node.children.get(levels[i]) {
        collect(child, levels, i + 1, seen, out);
    }
    if let Some(plus) = &node.wild_plus {
        collect(plus, levels, i + 1, seen, out);
    }
}

fn take_subscribers(node: &Node, seen: &mut HashSet<Arc<str>>, out: &mut Vec<Arc<Client>>) {
    for client in &node.subscribers {
        if seen.insert(client.id_arc()) {
            out.push(Arc::clone(client));
        }
    }
}

fn sweep(node: &mut Node, path: &mut Vec<String>, client_id: &str, out: &mut Vec<(String, bool)>) {
    let before = node.subscribers.len();
    node.subscribers.retain(|c| c.id() != client_id);
    if node.subscribers.len() != before {
        out.push((path.join("/"), node.subscribers.is_empty()));
    }

    for (level, child) in node.children.iter_mut() {
        path.push(level.clone());
        sweep(child, path, client_id, out);
        path.pop();
    }
    if let Some(plus) = node.wild_plus.as_deref_mut() {
        path.push("+".to_string());
        sweep(plus, path, client_id, out);
        path.pop();
    }
    if let Some(hash) = node.wild_hash.as_deref_mut() {
        path.push("#".to_string());
        sweep(hash, path, client_id, out);
        path.pop();
    }
}
