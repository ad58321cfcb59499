//! One live perspective.
//!
//! Every mutation, local or remote, goes through `turn`, a tokio mutex
//! that serializes them. Events are published while the turn is held, so
//! subscribers see them in application order. Readers never wait for a
//! turn: they clone the copy-on-write view.
//!
//! On a shared perspective a local mutation is applied and published
//! first, then committed to the link-sync adapter. If the commit fails the
//! change is reverted, the inverse event is published and the caller gets
//! `AdapterFailure`.

use crate::bus::ChangeBus;
use crate::error::{CoreError, Result};
use crate::language::LinkSyncAdapter;
use crate::link_store::{LinkMatches, LinkStore};
use crate::persistence::StateStore;
use ad4m_types::{Address, ChangeEvent, Link, LinkQuery, PerspectiveDiff, PerspectiveHandle, PerspectiveSnapshot};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

struct View {
    handle: PerspectiveHandle,
    links: LinkStore,
}

pub struct PerspectiveInstance {
    uuid: Uuid,
    view: RwLock<View>,
    sync: RwLock<Option<Arc<dyn LinkSyncAdapter>>>,
    turn: Mutex<()>,
    removed: AtomicBool,
    bus: ChangeBus,
    store: Arc<dyn StateStore>,
}

impl PerspectiveInstance {
    pub fn new(snapshot: PerspectiveSnapshot, bus: ChangeBus, store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            uuid: snapshot.handle.uuid,
            view: RwLock::new(View {
                handle: snapshot.handle,
                links: LinkStore::from_links(snapshot.links),
            }),
            sync: RwLock::new(None),
            turn: Mutex::new(()),
            removed: AtomicBool::new(false),
            bus,
            store,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn handle(&self) -> PerspectiveHandle {
        self.view.read().handle.clone()
    }

    pub fn snapshot(&self) -> PerspectiveSnapshot {
        let view = self.view.read();
        PerspectiveSnapshot {
            handle: view.handle.clone(),
            links: view.links.snapshot(),
        }
    }

    pub fn query(&self, query: &LinkQuery) -> LinkMatches {
        self.view.read().links.query(query)
    }

    pub fn link_count(&self) -> usize {
        self.view.read().links.len()
    }

    pub fn link_sync(&self) -> Option<Arc<dyn LinkSyncAdapter>> {
        self.sync.read().clone()
    }

    pub(crate) fn attach(&self, sync: Arc<dyn LinkSyncAdapter>) {
        *self.sync.write() = Some(sync);
    }

    /// Refuse further mutations; in-flight ones finish first.
    pub(crate) async fn close(&self) {
        let _turn = self.turn.lock().await;
        self.removed.store(true, Ordering::SeqCst);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(CoreError::NotFound(format!("perspective {}", self.uuid)));
        }
        Ok(())
    }

    fn shared_url(&self) -> String {
        self.view
            .read()
            .handle
            .shared_url
            .as_ref()
            .map_or_else(|| self.uuid.to_string(), |url| url.to_string())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.store.save_perspective(&snapshot).await
    }

    /// Commit `diff` if shared. On failure run `revert` and report.
    async fn commit(&self, diff: PerspectiveDiff, revert: impl FnOnce()) -> Result<()> {
        let Some(sync) = self.link_sync() else {
            return Ok(());
        };
        match sync.commit(diff).await {
            Ok(revision) => {
                debug!(perspective = %self.uuid, %revision, "commit acknowledged");
                Ok(())
            }
            Err(e) => {
                warn!(perspective = %self.uuid, error = %e, "commit rejected, reverting");
                revert();
                Err(CoreError::AdapterFailure {
                    address: self.shared_url(),
                    source: e,
                })
            }
        }
    }

    /// Add `link`. Returns the stored link, which is the earlier one when
    /// the edge already existed.
    pub async fn add_link(&self, link: Link) -> Result<Link> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;

        let added = self.view.write().links.add_link(link.clone())?;
        if !added {
            let view = self.view.read();
            return Ok(view.links.get(&link).cloned().unwrap_or(link));
        }
        self.publish_added(&link);

        self.commit(PerspectiveDiff::addition(link.clone()), || {
            self.view.write().links.remove_link(&link);
            self.publish_removed(&link);
        })
        .await?;

        self.persist().await?;
        Ok(link)
    }

    /// Remove the link with `link`'s identity. Absent links are a no-op.
    pub async fn remove_link(&self, link: &Link) -> Result<bool> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;

        let Some(removed) = self.view.write().links.remove_link(link) else {
            return Ok(false);
        };
        self.publish_removed(&removed);

        self.commit(PerspectiveDiff::removal(removed.clone()), || {
            // Restores at the end rather than the original position.
            let _ = self.view.write().links.add_link(removed.clone());
            self.publish_added(&removed);
        })
        .await?;

        self.persist().await?;
        Ok(true)
    }

    /// Swap `old` for `new` as one change with a single `LinkUpdated`.
    pub async fn update_link(&self, old: &Link, new: Link) -> Result<Link> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;

        let replacement = self.view.write().links.update_link(old, new.clone())?;
        let replaced = replacement.replaced.clone();
        self.bus.publish(ChangeEvent::LinkUpdated {
            perspective: self.uuid,
            old_link: replaced.clone(),
            new_link: new.clone(),
        });

        self.commit(PerspectiveDiff::update(replaced.clone(), new.clone()), || {
            // Also brings back an edge the update collapsed into `new`.
            self.view.write().links.undo_update(&new, replacement);
            self.bus.publish(ChangeEvent::LinkUpdated {
                perspective: self.uuid,
                old_link: new.clone(),
                new_link: replaced.clone(),
            });
        })
        .await?;

        self.persist().await?;
        Ok(new)
    }

    /// Apply a diff received from the neighbourhood.
    pub async fn apply_remote(&self, diff: PerspectiveDiff) -> Result<PerspectiveDiff> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;

        let applied = self.view.write().links.apply_diff(&diff);
        if applied.is_empty() {
            return Ok(applied);
        }
        for link in &applied.removals {
            self.publish_removed(link);
        }
        for link in &applied.additions {
            self.publish_added(link);
        }
        debug!(
            perspective = %self.uuid,
            added = applied.additions.len(),
            removed = applied.removals.len(),
            "remote diff applied"
        );

        self.persist().await?;
        Ok(applied)
    }

    pub async fn rename(&self, name: String) -> Result<PerspectiveHandle> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;

        let handle = {
            let mut view = self.view.write();
            view.handle.name = name;
            view.handle.clone()
        };
        self.persist().await?;
        self.bus.publish(ChangeEvent::PerspectiveUpdated {
            perspective: handle.clone(),
        });
        Ok(handle)
    }

    /// Push every current link to `sync` and mark the perspective shared.
    pub(crate) async fn share(&self, url: Address, sync: Arc<dyn LinkSyncAdapter>) -> Result<PerspectiveHandle> {
        let _turn = self.turn.lock().await;
        self.ensure_live()?;
        if self.view.read().handle.is_shared() {
            return Err(CoreError::AlreadyShared(self.uuid.to_string()));
        }

        let links = self.view.read().links.snapshot();
        if !links.is_empty() {
            sync.commit(PerspectiveDiff {
                additions: links,
                removals: Vec::new(),
            })
            .await
            .map_err(|e| CoreError::adapter(&url, e))?;
        }

        let handle = {
            let mut view = self.view.write();
            view.handle.shared_url = Some(url);
            view.handle.clone()
        };
        self.attach(sync);
        self.persist().await?;
        self.bus.publish(ChangeEvent::PerspectiveUpdated {
            perspective: handle.clone(),
        });
        Ok(handle)
    }

    fn publish_added(&self, link: &Link) {
        self.bus.publish(ChangeEvent::LinkAdded {
            perspective: self.uuid,
            link: link.clone(),
        });
    }

    fn publish_removed(&self, link: &Link) {
        self.bus.publish(ChangeEvent::LinkRemoved {
            perspective: self.uuid,
            link: link.clone(),
        });
    }
}
