//! In-process link synchronization for shared perspectives.
//!
//! A [`NeighbourhoodHub`] plays the part of the network: it keeps the
//! agreed link set and a revision log, and forwards every accepted diff to
//! all other peers. Each agent attaches through its own
//! [`LocalNeighbourhood`] language instance.

use super::{interfaces, ExpressionSigner, Language, LinkSyncAdapter, RemoteLinksCallback};
use crate::error::AdapterError;
use ad4m_types::{Address, Expression, Link, PerspectiveDiff};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
enum HubError {
    #[error("neighbourhood is not accepting commits")]
    Rejected,

    #[error("link languages do not store expressions")]
    NoExpressions,
}

type SharedCallback = Arc<dyn Fn(PerspectiveDiff) + Send + Sync>;

#[derive(Default)]
struct HubState {
    links: Vec<Link>,
    revisions: Vec<String>,
    peers: HashMap<u64, SharedCallback>,
}

pub struct NeighbourhoodHub {
    state: Mutex<HubState>,
    accepting: AtomicBool,
    next_peer: AtomicU64,
}

impl NeighbourhoodHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            accepting: AtomicBool::new(true),
            next_peer: AtomicU64::new(1),
        })
    }

    /// Make subsequent commits fail, simulating an unreachable network.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<Link> {
        self.state.lock().links.clone()
    }

    pub fn revision(&self) -> Option<String> {
        self.state.lock().revisions.last().cloned()
    }

    fn commit(&self, origin: u64, diff: PerspectiveDiff) -> Result<String, HubError> {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!(peer = origin, "neighbourhood commit rejected");
            return Err(HubError::Rejected);
        }

        let (revision, recipients) = {
            let mut state = self.state.lock();
            for removed in &diff.removals {
                state.links.retain(|l| !l.same_edge(removed));
            }
            for added in &diff.additions {
                if !state.links.iter().any(|l| l.same_edge(added)) {
                    state.links.push(added.clone());
                }
            }

            let mut hasher = blake3::Hasher::new();
            if let Some(previous) = state.revisions.last() {
                hasher.update(previous.as_bytes());
            }
            hasher.update(serde_json::to_string(&diff).unwrap_or_default().as_bytes());
            let revision = hasher.finalize().to_hex().to_string();
            state.revisions.push(revision.clone());

            let recipients: Vec<SharedCallback> = state
                .peers
                .iter()
                .filter(|(peer, _)| **peer != origin)
                .map(|(_, callback)| callback.clone())
                .collect();
            (revision, recipients)
        };

        debug!(peer = origin, %revision, recipients = recipients.len(), "neighbourhood commit");
        for callback in recipients {
            callback(diff.clone());
        }
        Ok(revision)
    }
}

/// One agent's view of a hub, as a link-sync adapter.
#[derive(Clone)]
struct HubPeer {
    hub: Arc<NeighbourhoodHub>,
    peer: u64,
}

#[async_trait]
impl LinkSyncAdapter for HubPeer {
    async fn current_revision(&self) -> Result<Option<String>, AdapterError> {
        Ok(self.hub.revision())
    }

    async fn render(&self) -> Result<Vec<Link>, AdapterError> {
        Ok(self.hub.links())
    }

    async fn commit(&self, diff: PerspectiveDiff) -> Result<String, AdapterError> {
        Ok(self.hub.commit(self.peer, diff)?)
    }

    fn subscribe_remote_links(&self, callback: RemoteLinksCallback) {
        self.hub
            .state
            .lock()
            .peers
            .insert(self.peer, Arc::from(callback));
    }

    fn unsubscribe_remote_links(&self) {
        self.hub.state.lock().peers.remove(&self.peer);
    }
}

/// Link language attaching one agent to a [`NeighbourhoodHub`].
pub struct LocalNeighbourhood {
    id: String,
    peer: HubPeer,
    settings: RwLock<Value>,
}

impl LocalNeighbourhood {
    pub fn join(id: impl Into<String>, hub: Arc<NeighbourhoodHub>) -> Self {
        let peer = hub.next_peer.fetch_add(1, Ordering::SeqCst);
        Self {
            id: id.into(),
            peer: HubPeer { hub, peer },
            settings: RwLock::new(Value::Object(Default::default())),
        }
    }
}

#[async_trait]
impl Language for LocalNeighbourhood {
    fn id(&self) -> &str {
        &self.id
    }

    fn interfaces(&self) -> Vec<&'static str> {
        vec![interfaces::LINK_SYNC, interfaces::SETTINGS]
    }

    async fn get(&self, _content_id: &str) -> Result<Option<Expression>, AdapterError> {
        Ok(None)
    }

    async fn put(&self, _data: Value, _signer: &dyn ExpressionSigner) -> Result<Address, AdapterError> {
        Err(HubError::NoExpressions.into())
    }

    fn settings(&self) -> Value {
        self.settings.read().clone()
    }

    fn put_settings(&self, settings: Value) -> Result<(), AdapterError> {
        *self.settings.write() = settings;
        Ok(())
    }

    fn link_sync(&self) -> Option<Arc<dyn LinkSyncAdapter>> {
        Some(Arc::new(self.peer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad4m_types::Node;

    fn link(target: &str) -> Link {
        Link::new(
            Node::root(),
            Node::parse("l://p").unwrap(),
            Node::parse(target).unwrap(),
            "did:key:alice",
        )
    }

    #[tokio::test]
    async fn test_commit_reaches_other_peers_only() {
        let hub = NeighbourhoodHub::new();
        let alice = LocalNeighbourhood::join("nh", hub.clone()).link_sync().unwrap();
        let bob = LocalNeighbourhood::join("nh", hub.clone()).link_sync().unwrap();

        let seen_by_alice = Arc::new(Mutex::new(Vec::new()));
        let seen_by_bob = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen_by_alice.clone();
            alice.subscribe_remote_links(Box::new(move |diff| seen.lock().push(diff)));
            let seen = seen_by_bob.clone();
            bob.subscribe_remote_links(Box::new(move |diff| seen.lock().push(diff)));
        }

        let revision = alice.commit(PerspectiveDiff::addition(link("l://t"))).await.unwrap();
        assert_eq!(alice.current_revision().await.unwrap(), Some(revision));
        assert_eq!(bob.render().await.unwrap().len(), 1);
        assert!(seen_by_alice.lock().is_empty());
        assert_eq!(seen_by_bob.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_peer_gets_nothing() {
        let hub = NeighbourhoodHub::new();
        let alice = LocalNeighbourhood::join("nh", hub.clone()).link_sync().unwrap();
        let bob = LocalNeighbourhood::join("nh", hub.clone()).link_sync().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bob.subscribe_remote_links(Box::new(move |diff| sink.lock().push(diff)));
        bob.unsubscribe_remote_links();
        bob.unsubscribe_remote_links();

        alice.commit(PerspectiveDiff::addition(link("l://t"))).await.unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(bob.render().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_hub_fails_commit() {
        let hub = NeighbourhoodHub::new();
        let alice = LocalNeighbourhood::join("nh", hub.clone()).link_sync().unwrap();
        hub.set_accepting(false);

        assert!(alice.commit(PerspectiveDiff::addition(link("l://t"))).await.is_err());
        assert!(hub.links().is_empty());
        assert!(hub.revision().is_none());
    }
}
