//! Ordered link set of one perspective.
//!
//! The store is a plain value: it knows nothing about events or
//! persistence. The owning perspective serializes mutations and decides
//! what to publish from the return values here. Links live behind an
//! `Arc`, so snapshots and running queries are unaffected by later
//! mutations (copy-on-write).

use crate::error::{CoreError, Result};
use ad4m_types::{Link, LinkQuery, PerspectiveDiff};
use std::sync::Arc;

/// What an update displaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// The link that was swapped out
    pub replaced: Link,
    /// An existing edge equal to the new link, dropped along with its index
    pub collapsed: Option<(usize, Link)>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkStore {
    links: Arc<Vec<Link>>,
}

fn validate(link: &Link) -> Result<()> {
    if link.author.trim().is_empty() {
        return Err(CoreError::InvalidLink("link has no author".into()));
    }
    Ok(())
}

impl LinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted links, keeping the first of any duplicates.
    pub fn from_links(links: impl IntoIterator<Item = Link>) -> Self {
        let mut store = Self::new();
        let inner = Arc::make_mut(&mut store.links);
        for link in links {
            if !inner.iter().any(|l| l.same_edge(&link)) {
                inner.push(link);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, link: &Link) -> bool {
        self.position(link).is_some()
    }

    /// The stored link with the same identity as `link`.
    pub fn get(&self, link: &Link) -> Option<&Link> {
        self.position(link).map(|i| &self.links[i])
    }

    fn position(&self, link: &Link) -> Option<usize> {
        self.links.iter().position(|l| l.same_edge(link))
    }

    /// Insert `link` unless an identical edge is present.
    ///
    /// Returns `true` when the set changed. Referenced addresses are not
    /// resolved.
    pub fn add_link(&mut self, link: Link) -> Result<bool> {
        validate(&link)?;
        if self.contains(&link) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.links).push(link);
        Ok(true)
    }

    /// Remove the link with `link`'s identity, returning the stored value.
    pub fn remove_link(&mut self, link: &Link) -> Option<Link> {
        let index = self.position(link)?;
        Some(Arc::make_mut(&mut self.links).remove(index))
    }

    /// Replace `old` with `new` in place.
    ///
    /// Fails with `NotFound` if `old` is absent; the set is then unchanged.
    pub fn update_link(&mut self, old: &Link, new: Link) -> Result<Replacement> {
        validate(&new)?;
        let index = self
            .position(old)
            .ok_or_else(|| CoreError::NotFound("link".into()))?;

        let links = Arc::make_mut(&mut self.links);
        let replaced = std::mem::replace(&mut links[index], new);
        // `new` may coincide with another edge already in the set.
        let duplicate = links
            .iter()
            .enumerate()
            .position(|(i, l)| i != index && l.same_edge(&links[index]));
        let collapsed = duplicate.map(|d| (d, links.remove(d)));
        Ok(Replacement { replaced, collapsed })
    }

    /// Undo an [`update_link`](Self::update_link) that put `new` in place,
    /// restoring the original order.
    pub fn undo_update(&mut self, new: &Link, replacement: Replacement) {
        let Some(index) = self.position(new) else {
            return;
        };
        let links = Arc::make_mut(&mut self.links);
        links[index] = replacement.replaced;
        if let Some((position, link)) = replacement.collapsed {
            links.insert(position.min(links.len()), link);
        }
    }

    /// Lazy matches of `query` over the current links, in insertion order.
    pub fn query(&self, query: &LinkQuery) -> LinkMatches {
        LinkMatches {
            links: self.links.clone(),
            query: query.clone(),
            position: 0,
            remaining: query.limit,
        }
    }

    pub fn snapshot(&self) -> Vec<Link> {
        self.links.as_ref().clone()
    }

    /// Apply a remote diff, removals first.
    ///
    /// Returns the part of the diff that actually changed the set.
    pub fn apply_diff(&mut self, diff: &PerspectiveDiff) -> PerspectiveDiff {
        let mut applied = PerspectiveDiff::default();
        for link in &diff.removals {
            if let Some(removed) = self.remove_link(link) {
                applied.removals.push(removed);
            }
        }
        for link in &diff.additions {
            if let Ok(true) = self.add_link(link.clone()) {
                applied.additions.push(link.clone());
            }
        }
        applied
    }
}

/// Finite, restartable query result.
///
/// A clone continues independently from the same position over the same
/// snapshot of links; [`LinkMatches::restart`] starts over.
#[derive(Debug, Clone)]
pub struct LinkMatches {
    links: Arc<Vec<Link>>,
    query: LinkQuery,
    position: usize,
    remaining: Option<usize>,
}

impl LinkMatches {
    /// A fresh iterator over the same snapshot.
    pub fn restart(&self) -> Self {
        Self {
            links: self.links.clone(),
            query: self.query.clone(),
            position: 0,
            remaining: self.query.limit,
        }
    }
}

impl Iterator for LinkMatches {
    type Item = Link;

    fn next(&mut self) -> Option<Link> {
        if self.remaining == Some(0) {
            return None;
        }
        while let Some(link) = self.links.get(self.position) {
            self.position += 1;
            if self.query.matches(link) {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(link.clone());
            }
        }
        None
    }
}
