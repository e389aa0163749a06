//! Wildcard pattern trie over dot-separated resource IDs.
//!
//! ```text
//! root ─┬─ "a" ─┬─ "b" ─── "c"      a.b.c
//!       │       ├─ *   ─── "c"      a.*.c
//!       │       └─ >                a.>
//!       └─ ...
//! ```
//!
//! Matching precedence is evaluated at every depth: an exact token first,
//! then the partial wildcard `*`, then the full wildcard `>`.

use std::collections::HashMap;
use thiserror::Error;

const PARTIAL_WILDCARD: &str = "*";
const FULL_WILDCARD: &str = ">";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern already registered: {0}")]
    Conflict(String),
    #[error("malformed pattern: {0}")]
    Malformed(String),
}

/// A trie node. `value` is set when a pattern ends exactly here.
struct Node<T> {
    value: Option<T>,
    nodes: HashMap<String, Node<T>>,
    partial: Option<Box<Node<T>>>,
    full: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            value: None,
            nodes: HashMap::new(),
            partial: None,
            full: None,
        }
    }
}

/// Maps resource ID patterns to values of type `T`.
pub struct PatternMap<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for PatternMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PatternMap<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Register `value` under `pattern`.
    ///
    /// Fails with [`PatternError::Malformed`] on an empty token or on tokens
    /// following `>`, and with [`PatternError::Conflict`] if the exact same
    /// pattern is already registered.
    pub fn add(&mut self, pattern: &str, value: T) -> Result<(), PatternError> {
        let tokens: Vec<&str> = pattern.split('.').collect();
        let last = tokens.len() - 1;
        let mut node = &mut self.root;

        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(PatternError::Malformed(pattern.to_string()));
            }
            if *token == FULL_WILDCARD {
                if i != last {
                    return Err(PatternError::Malformed(pattern.to_string()));
                }
                if node.full.is_some() {
                    return Err(PatternError::Conflict(pattern.to_string()));
                }
                node.full = Some(value);
                self.len += 1;
                return Ok(());
            }
            node = if *token == PARTIAL_WILDCARD {
                &mut **node.partial.get_or_insert_with(|| Box::new(Node::new()))
            } else {
                node.nodes.entry(token.to_string()).or_insert_with(Node::new)
            };
        }

        if node.value.is_some() {
            return Err(PatternError::Conflict(pattern.to_string()));
        }
        node.value = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Find the value registered for the best matching pattern.
    ///
    /// A trailing `?query` part of `rid` is ignored.
    pub fn get(&self, rid: &str) -> Option<&T> {
        let name = rid.split_once('?').map_or(rid, |(name, _)| name);
        let tokens: Vec<&str> = name.split('.').collect();
        Self::lookup(&self.root, &tokens)
    }

    fn lookup<'a>(node: &'a Node<T>, tokens: &[&str]) -> Option<&'a T> {
        let Some((token, rest)) = tokens.split_first() else {
            return node.value.as_ref();
        };
        if let Some(found) = node.nodes.get(*token).and_then(|n| Self::lookup(n, rest)) {
            return Some(found);
        }
        if let Some(found) = node.partial.as_deref().and_then(|n| Self::lookup(n, rest)) {
            return Some(found);
        }
        node.full.as_ref()
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
