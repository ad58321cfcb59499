//! Perspectives: the agent's local link graphs, optionally shared through a
//! neighbourhood.

mod instance;

pub use instance::PerspectiveInstance;

use crate::agent::AgentService;
use crate::bus::ChangeBus;
use crate::error::{CoreError, Result};
use crate::language::{LanguageController, LinkSyncAdapter};
use crate::persistence::StateStore;
use ad4m_types::{
    Address, ChangeEvent, Link, LinkInput, LinkQuery, Neighbourhood, PerspectiveDiff, PerspectiveHandle,
    PerspectiveSnapshot,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Language holding published `Neighbourhood` expressions
pub const NEIGHBOURHOOD_LANGUAGE_ID: &str = "neighbourhood";

pub struct PerspectivesController {
    perspectives: RwLock<HashMap<Uuid, Arc<PerspectiveInstance>>>,
    languages: Arc<LanguageController>,
    agent: Arc<AgentService>,
    bus: ChangeBus,
    store: Arc<dyn StateStore>,
    /// Remote-link listener task per shared perspective
    listeners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Link language id to the perspective it carries
    bindings: Mutex<HashMap<String, Uuid>>,
}

impl PerspectivesController {
    pub fn new(
        languages: Arc<LanguageController>,
        agent: Arc<AgentService>,
        bus: ChangeBus,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            perspectives: RwLock::new(HashMap::new()),
            languages,
            agent,
            bus,
            store,
            listeners: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Bring persisted perspectives back and reattach shared ones.
    ///
    /// A shared perspective whose neighbourhood cannot be resolved stays
    /// available locally without sync.
    pub async fn load(&self) -> Result<usize> {
        let snapshots = self.store.load_perspectives().await?;
        let count = snapshots.len();
        for snapshot in snapshots {
            let shared_url = snapshot.handle.shared_url.clone();
            let instance = PerspectiveInstance::new(snapshot, self.bus.clone(), self.store.clone());
            self.perspectives.write().insert(instance.uuid(), instance.clone());

            if let Some(url) = shared_url {
                let reattached = match self.link_sync_for(&url).await {
                    Ok((neighbourhood, sync)) => self
                        .bind(&neighbourhood.link_language, instance.uuid())
                        .map(|_| sync),
                    Err(e) => Err(e),
                };
                match reattached {
                    Ok(sync) => {
                        let remote = subscribe_remote(&sync);
                        instance.attach(sync);
                        self.spawn_listener(&instance, remote);
                    }
                    Err(e) => {
                        warn!(perspective = %instance.uuid(), %url, error = %e, "could not reattach neighbourhood")
                    }
                }
            }
        }
        info!(count, "perspectives loaded");
        Ok(count)
    }

    pub fn instance(&self, uuid: Uuid) -> Result<Arc<PerspectiveInstance>> {
        self.perspectives
            .read()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("perspective {uuid}")))
    }

    pub fn get(&self, uuid: Uuid) -> Result<PerspectiveHandle> {
        Ok(self.instance(uuid)?.handle())
    }

    /// All perspectives, ordered by name.
    pub fn all(&self) -> Vec<PerspectiveHandle> {
        let mut handles: Vec<_> = self.perspectives.read().values().map(|p| p.handle()).collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name).then(a.uuid.cmp(&b.uuid)));
        handles
    }

    pub fn snapshot(&self, uuid: Uuid) -> Result<PerspectiveSnapshot> {
        Ok(self.instance(uuid)?.snapshot())
    }

    pub async fn add(&self, name: impl Into<String>) -> Result<PerspectiveHandle> {
        let snapshot = PerspectiveSnapshot {
            handle: PerspectiveHandle::new(name),
            links: Vec::new(),
        };
        self.insert(snapshot, None).await
    }

    async fn insert(
        &self,
        snapshot: PerspectiveSnapshot,
        sync: Option<Arc<dyn LinkSyncAdapter>>,
    ) -> Result<PerspectiveHandle> {
        self.store.save_perspective(&snapshot).await?;
        let handle = snapshot.handle.clone();
        let instance = PerspectiveInstance::new(snapshot, self.bus.clone(), self.store.clone());
        if let Some(sync) = sync {
            instance.attach(sync);
        }
        self.perspectives.write().insert(handle.uuid, instance);
        info!(perspective = %handle.uuid, name = %handle.name, "perspective added");
        self.bus.publish(ChangeEvent::PerspectiveAdded {
            perspective: handle.clone(),
        });
        Ok(handle)
    }

    pub async fn update(&self, uuid: Uuid, name: impl Into<String>) -> Result<PerspectiveHandle> {
        self.instance(uuid)?.rename(name.into()).await
    }

    pub async fn remove(&self, uuid: Uuid) -> Result<()> {
        let instance = self
            .perspectives
            .write()
            .remove(&uuid)
            .ok_or_else(|| CoreError::NotFound(format!("perspective {uuid}")))?;
        instance.close().await;
        if let Some(listener) = self.listeners.lock().remove(&uuid) {
            listener.abort();
        }
        if let Some(sync) = instance.link_sync() {
            sync.unsubscribe_remote_links();
        }
        self.bindings.lock().retain(|_, bound| *bound != uuid);
        self.store.remove_perspective(uuid).await?;
        info!(perspective = %uuid, "perspective removed");
        self.bus.publish(ChangeEvent::PerspectiveRemoved { uuid });
        Ok(())
    }

    fn author(&self) -> Result<String> {
        self.agent.did().ok_or(CoreError::AgentNotInitialized)
    }

    /// Add a link authored by the local agent.
    pub async fn add_link(&self, uuid: Uuid, link: LinkInput) -> Result<Link> {
        let link = link.into_link(self.author()?);
        self.instance(uuid)?.add_link(link).await
    }

    pub async fn update_link(&self, uuid: Uuid, old: &Link, new: LinkInput) -> Result<Link> {
        let new = new.into_link(self.author()?);
        self.instance(uuid)?.update_link(old, new).await
    }

    pub async fn remove_link(&self, uuid: Uuid, link: &Link) -> Result<bool> {
        self.instance(uuid)?.remove_link(link).await
    }

    pub fn query_links(&self, uuid: Uuid, query: &LinkQuery) -> Result<Vec<Link>> {
        Ok(self.instance(uuid)?.query(query).collect())
    }

    /// Share a local perspective as a new neighbourhood carried by
    /// `link_language_id`. Returns the neighbourhood url.
    pub async fn publish(&self, uuid: Uuid, link_language_id: &str, meta: Vec<Link>) -> Result<Address> {
        let instance = self.instance(uuid)?;
        if instance.handle().is_shared() {
            return Err(CoreError::AlreadyShared(uuid.to_string()));
        }
        let sync = self.link_sync_of(link_language_id)?;
        self.bind(link_language_id, uuid)?;

        let neighbourhood = Neighbourhood {
            link_language: link_language_id.to_string(),
            meta,
        };
        let remote = subscribe_remote(&sync);
        let shared = async {
            let url = self
                .languages
                .expression_create(NEIGHBOURHOOD_LANGUAGE_ID, serde_json::to_value(&neighbourhood)?)
                .await?;
            instance.share(url.clone(), sync.clone()).await?;
            Ok::<_, CoreError>(url)
        }
        .await;

        match shared {
            Ok(url) => {
                self.spawn_listener(&instance, remote);
                info!(perspective = %uuid, %url, "perspective published as neighbourhood");
                Ok(url)
            }
            Err(e) => {
                sync.unsubscribe_remote_links();
                self.unbind(link_language_id, uuid);
                Err(e)
            }
        }
    }

    /// Join the neighbourhood at `url`, or return the perspective already
    /// mirroring it.
    pub async fn join_from_url(&self, url: &Address) -> Result<PerspectiveHandle> {
        let existing = self
            .perspectives
            .read()
            .values()
            .map(|p| p.handle())
            .find(|h| h.shared_url.as_ref() == Some(url));
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let (neighbourhood, sync) = self.link_sync_for(url).await?;
        let uuid = Uuid::new_v4();
        self.bind(&neighbourhood.link_language, uuid)?;

        // Subscribe before rendering so nothing committed in between is lost.
        let remote = subscribe_remote(&sync);
        let joined = async {
            let links = sync.render().await.map_err(|e| CoreError::adapter(url, e))?;
            let snapshot = PerspectiveSnapshot {
                handle: PerspectiveHandle {
                    uuid,
                    name: url.to_string(),
                    shared_url: Some(url.clone()),
                },
                links,
            };
            self.insert(snapshot, Some(sync.clone())).await
        }
        .await;

        match joined {
            Ok(handle) => {
                let instance = self.instance(handle.uuid)?;
                self.spawn_listener(&instance, remote);
                info!(perspective = %handle.uuid, %url, "joined neighbourhood");
                Ok(handle)
            }
            Err(e) => {
                sync.unsubscribe_remote_links();
                self.unbind(&neighbourhood.link_language, uuid);
                Err(e)
            }
        }
    }

    /// Claim `language_id` for `uuid`. Each link language carries at most
    /// one local perspective.
    fn bind(&self, language_id: &str, uuid: Uuid) -> Result<()> {
        let mut bindings = self.bindings.lock();
        match bindings.get(language_id) {
            Some(bound) if *bound != uuid => Err(CoreError::LinkLanguageInUse {
                language: language_id.to_string(),
                perspective: bound.to_string(),
            }),
            _ => {
                bindings.insert(language_id.to_string(), uuid);
                Ok(())
            }
        }
    }

    fn unbind(&self, language_id: &str, uuid: Uuid) {
        let mut bindings = self.bindings.lock();
        if bindings.get(language_id) == Some(&uuid) {
            bindings.remove(language_id);
        }
    }

    fn link_sync_of(&self, language_id: &str) -> Result<Arc<dyn LinkSyncAdapter>> {
        let resolved = self.languages.address_space().resolve_language(language_id)?;
        resolved
            .link_sync()
            .ok_or_else(|| CoreError::adapter_for_language(language_id, "language does not provide link sync"))
    }

    async fn link_sync_for(&self, url: &Address) -> Result<(Neighbourhood, Arc<dyn LinkSyncAdapter>)> {
        let expression = self
            .languages
            .get_expression(url)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("neighbourhood {url}")))?;
        let neighbourhood: Neighbourhood = serde_json::from_value(expression.data)?;
        let sync = self.link_sync_of(&neighbourhood.link_language)?;
        Ok((neighbourhood, sync))
    }

    fn spawn_listener(&self, instance: &Arc<PerspectiveInstance>, mut remote: mpsc::UnboundedReceiver<PerspectiveDiff>) {
        let uuid = instance.uuid();
        let target = Arc::downgrade(instance);
        let task = tokio::spawn(async move {
            while let Some(diff) = remote.recv().await {
                let Some(instance) = target.upgrade() else {
                    break;
                };
                match instance.apply_remote(diff).await {
                    Ok(applied) if applied.is_empty() => debug!(perspective = %uuid, "remote diff already present"),
                    Ok(_) => {}
                    Err(CoreError::NotFound(_)) => break,
                    Err(e) => warn!(perspective = %uuid, error = %e, "failed to apply remote diff"),
                }
            }
            debug!(perspective = %uuid, "remote link listener stopped");
        });
        if let Some(previous) = self.listeners.lock().insert(uuid, task) {
            previous.abort();
        }
    }

    /// Stop every remote-link listener.
    pub fn shutdown(&self) {
        for (_, listener) in self.listeners.lock().drain() {
            listener.abort();
        }
    }
}

fn subscribe_remote(sync: &Arc<dyn LinkSyncAdapter>) -> mpsc::UnboundedReceiver<PerspectiveDiff> {
    let (tx, rx) = mpsc::unbounded_channel();
    sync.subscribe_remote_links(Box::new(move |diff| {
        let _ = tx.send(diff);
    }));
    rx
}
