use std::collections::HashMap;
use std::fmt;

use crate::Error;

/// A hostname pattern: DNS labels stored in reverse order (so
/// `example.com` becomes `[com, example]`), plus a wildcard flag for
/// subdomain patterns like `*.example.com`. The lone `*` is the empty
/// label sequence with the wildcard set.
///
/// Matching treats a wildcard as covering the name itself and anything
/// below it; reversal makes that a prefix relation on label sequences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostnameKey {
    labels: Vec<String>,
    wildcard: bool,
}

impl HostnameKey {
    /// Parses a hostname pattern, normalizing to lowercase.
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        if pattern == "*" {
            return Ok(Self {
                labels: Vec::new(),
                wildcard: true,
            });
        }
        let (wildcard, rest) = match pattern.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        if rest.is_empty() {
            return Err(Error::config(format!("invalid hostname pattern: {pattern:?}")));
        }
        let mut labels = Vec::new();
        for label in rest.split('.') {
            if !valid_label(label) {
                return Err(Error::config(format!(
                    "invalid hostname label {label:?} in pattern {pattern:?}"
                )));
            }
            labels.push(label.to_ascii_lowercase());
        }
        labels.reverse();
        Ok(Self { labels, wildcard })
    }

    /// Parses a concrete hostname (no wildcard allowed), e.g. from a Host
    /// header or SNI. Returns the reversed, lowercased label sequence.
    pub fn parse_name(name: &str) -> Result<Self, Error> {
        let key = Self::parse(name)?;
        if key.wildcard {
            return Err(Error::config(format!(
                "wildcard not allowed in concrete hostname: {name:?}"
            )));
        }
        Ok(key)
    }

    /// Labels in reverse order (TLD first).
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

/// A longest-match map keyed by hostname patterns.
///
/// Reversed labels make wildcard matching a prefix walk: an exact entry
/// must consume every label; a wildcard entry matches its name and
/// anything below it, with the deepest wildcard winning and the bare `*`
/// (wildcard at the root) matching last.
#[derive(Debug)]
pub(crate) struct HostMap<V> {
    root: HostMapNode<V>,
}

#[derive(Debug)]
struct HostMapNode<V> {
    children: HashMap<String, HostMapNode<V>>,
    exact: Option<V>,
    wildcard: Option<V>,
}

impl<V> Default for HostMapNode<V> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            exact: None,
            wildcard: None,
        }
    }
}

impl<V> Default for HostMap<V> {
    fn default() -> Self {
        Self {
            root: HostMapNode::default(),
        }
    }
}

impl<V> HostMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for a pattern, created on demand. Callers decide whether an
    /// occupied slot is a duplicate error or a merge.
    pub fn slot_mut(&mut self, key: &HostnameKey) -> &mut Option<V> {
        let mut node = &mut self.root;
        for label in key.labels() {
            node = node.children.entry(label.clone()).or_default();
        }
        if key.is_wildcard() {
            &mut node.wildcard
        } else {
            &mut node.exact
        }
    }

    /// Longest-match lookup for a concrete name given as reversed labels.
    pub fn find(&self, labels: &[String]) -> Option<&V> {
        let mut node = &self.root;
        let mut best_wildcard = node.wildcard.as_ref();
        for label in labels {
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    if let Some(value) = node.wildcard.as_ref() {
                        best_wildcard = Some(value);
                    }
                }
                None => return best_wildcard,
            }
        }
        node.exact.as_ref().or(best_wildcard)
    }

    /// Looks up by hostname string; unparseable names match nothing.
    pub fn find_name(&self, name: &str) -> Option<&V> {
        let key = HostnameKey::parse_name(name).ok()?;
        self.find(key.labels())
    }
}

impl fmt::Display for HostnameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str("*");
        }
        if self.wildcard {
            f.write_str("*.")?;
        }
        for (n, label) in self.labels.iter().rev().enumerate() {
            if n > 0 {
                f.write_str(".")?;
            }
            f.write_str(label)?;
        }
        Ok(())
    }
}
