//! Links: typed edges of a perspective graph

use crate::address::Node;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `(source, predicate, target)` edge stamped with author and time.
///
/// Links are immutable values. Two links are the same edge when their
/// [`LinkIdentity`] matches; the timestamp is metadata and does not take
/// part in identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub source: Node,
    pub predicate: Node,
    pub target: Node,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

/// The identifying part of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkIdentity {
    pub source: Node,
    pub predicate: Node,
    pub target: Node,
    pub author: String,
}

impl Link {
    /// Create a link authored now.
    pub fn new(source: Node, predicate: Node, target: Node, author: impl Into<String>) -> Self {
        Self {
            source,
            predicate,
            target,
            author: author.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn identity(&self) -> LinkIdentity {
        LinkIdentity {
            source: self.source.clone(),
            predicate: self.predicate.clone(),
            target: self.target.clone(),
            author: self.author.clone(),
        }
    }

    pub fn same_edge(&self, other: &Link) -> bool {
        self.source == other.source
            && self.predicate == other.predicate
            && self.target == other.target
            && self.author == other.author
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A link as submitted by a caller, before the engine stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInput {
    pub source: Node,
    pub predicate: Node,
    pub target: Node,
}

impl LinkInput {
    pub fn new(source: Node, predicate: Node, target: Node) -> Self {
        Self {
            source,
            predicate,
            target,
        }
    }

    pub fn into_link(self, author: impl Into<String>) -> Link {
        Link::new(self.source, self.predicate, self.target, author)
    }
}

/// Link pattern. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Node>,
    /// Only links stamped at or after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<DateTime<Utc>>,
    /// Only links stamped at or before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl LinkQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn source(mut self, node: Node) -> Self {
        self.source = Some(node);
        self
    }

    pub fn predicate(mut self, node: Node) -> Self {
        self.predicate = Some(node);
        self
    }

    pub fn target(mut self, node: Node) -> Self {
        self.target = Some(node);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Field-wise match; `limit` is applied by the caller.
    pub fn matches(&self, link: &Link) -> bool {
        fn field(pattern: &Option<Node>, value: &Node) -> bool {
            pattern.as_ref().map_or(true, |p| p == value)
        }

        field(&self.source, &link.source)
            && field(&self.predicate, &link.predicate)
            && field(&self.target, &link.target)
            && self.from_date.map_or(true, |from| link.timestamp >= from)
            && self.until_date.map_or(true, |until| link.timestamp <= until)
    }
}

/// A batch of link changes exchanged with a neighbourhood.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerspectiveDiff {
    #[serde(default)]
    pub additions: Vec<Link>,
    #[serde(default)]
    pub removals: Vec<Link>,
}

impl PerspectiveDiff {
    pub fn addition(link: Link) -> Self {
        Self {
            additions: vec![link],
            removals: Vec::new(),
        }
    }

    pub fn removal(link: Link) -> Self {
        Self {
            additions: Vec::new(),
            removals: vec![link],
        }
    }

    pub fn update(old: Link, new: Link) -> Self {
        Self {
            additions: vec![new],
            removals: vec![old],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(s: &str) -> Node {
        Node::parse(s).unwrap()
    }

    #[test]
    fn test_identity_ignores_timestamp() {
        let a = Link::new(node("l://a"), node("l://b"), node("l://c"), "did:key:me");
        let b = a.clone().with_timestamp(a.timestamp + Duration::seconds(5));
        assert_ne!(a, b);
        assert!(a.same_edge(&b));
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_query_wildcards() {
        let link = Link::new(node("l://a"), node("l://b"), node("l://c"), "did:key:me");

        assert!(LinkQuery::all().matches(&link));
        assert!(LinkQuery::all().source(node("l://a")).matches(&link));
        assert!(!LinkQuery::all().source(node("l://x")).matches(&link));
        assert!(LinkQuery::all()
            .predicate(node("l://b"))
            .target(node("l://c"))
            .matches(&link));
    }

    #[test]
    fn test_query_date_window() {
        let link = Link::new(node("root"), node("l://p"), node("l://t"), "did:key:me");
        let before = link.timestamp - Duration::seconds(1);
        let after = link.timestamp + Duration::seconds(1);

        let mut query = LinkQuery::all();
        query.from_date = Some(before);
        query.until_date = Some(after);
        assert!(query.matches(&link));

        query.from_date = Some(after);
        assert!(!query.matches(&link));
    }

    #[test]
    fn test_link_json_shape() {
        let link = Link::new(node("root"), node("l://p"), node("l://t"), "did:key:me");
        let value = serde_json::to_value(&link).unwrap();
        assert_eq!(value["source"], "root");
        assert_eq!(value["predicate"], "l://p");
        assert_eq!(value["author"], "did:key:me");
    }
}
