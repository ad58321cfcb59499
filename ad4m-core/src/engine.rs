//! The engine facade.
//!
//! [`Ad4mCore`] wires the components together and is the only surface the
//! executor talks to. Every operation takes the caller's credential (a
//! capability JWT or the admin credential) and checks it against the
//! domain, pointer and action of the operation before doing anything.
//!
//! Pointers per domain:
//! - `perspective`: the perspective uuid
//! - `expression`: the address read, or the language id written to
//! - `language`: the language id
//! - `agent`: `self` for the local agent, the DID for lookups
//! - `neighbourhood`: the perspective uuid when publishing, the url when joining
//! - `capability`: the pairing request id
//!
//! Operations over a whole collection use the empty pointer, so only
//! domain-wide grants cover them.

use crate::address_space::AddressSpace;
use crate::agent::AgentService;
use crate::bus::{ChangeBus, EventFilter, Subscription};
use crate::capability::{AppGrant, CapabilityGuard, CapabilityRequest, IssuedToken};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::language::{AddressScheme, AgentLanguage, ContentLanguage, Language, LanguageController, LanguageInfo};
use crate::persistence::{FileStateStore, MemoryStateStore, StateStore};
use crate::perspectives::{PerspectivesController, NEIGHBOURHOOD_LANGUAGE_ID};
use ad4m_types::{
    actions, domains, Address, Agent, AgentStatus, CapabilityToken, Expression, Link, LinkInput, LinkQuery,
    PerspectiveHandle, PerspectiveSnapshot, Topic,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Pointer naming the local agent
pub const SELF_POINTER: &str = "self";

/// Existing keys to adopt instead of generating new ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentImport {
    pub did: String,
    /// Output of a previous keystore export
    pub keystore: String,
}

pub struct Ad4mCore {
    config: CoreConfig,
    bus: ChangeBus,
    agent: Arc<AgentService>,
    languages: Arc<LanguageController>,
    perspectives: PerspectivesController,
    guard: CapabilityGuard,
}

impl Ad4mCore {
    /// Open the engine on the configured data directory, or in memory.
    pub async fn open(config: CoreConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match &config.data_path {
            Some(path) => Arc::new(FileStateStore::open(path.clone()).await?),
            None => Arc::new(MemoryStateStore::new()),
        };
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: CoreConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let bus = ChangeBus::new(config.bus_capacity);
        let agent = Arc::new(AgentService::load(store.clone(), bus.clone(), config.kdf).await?);

        let languages = Arc::new(LanguageController::new(
            Arc::new(AddressSpace::new()),
            agent.clone(),
            store.clone(),
        ));
        languages.install(Arc::new(AgentLanguage::new())).await?;
        languages
            .install(Arc::new(ContentLanguage::new(NEIGHBOURHOOD_LANGUAGE_ID, AddressScheme::Hash)))
            .await?;

        let secret = match &config.jwt_secret {
            Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
            _ => {
                info!("no jwt secret configured, tokens will not survive a restart");
                rand::random::<[u8; 32]>().to_vec()
            }
        };
        let guard = CapabilityGuard::new(
            &secret,
            config.admin_credential.clone(),
            config.pairing_code_ttl(),
            config.token_ttl(),
            store.clone(),
        );
        let replayed = guard.restore().await?;

        let perspectives = PerspectivesController::new(languages.clone(), agent.clone(), bus.clone(), store);
        perspectives.load().await?;

        info!(
            replayed,
            initialized = agent.is_initialized(),
            persistent = config.data_path.is_some(),
            "engine ready"
        );
        Ok(Self {
            config,
            bus,
            agent,
            languages,
            perspectives,
            guard,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Register a language adapter. Host-level, so no credential.
    pub async fn install_language(&self, language: Arc<dyn Language>) -> Result<u64> {
        self.languages.install(language).await
    }

    /// Stop listeners and end every subscription.
    pub fn shutdown(&self) {
        self.perspectives.shutdown();
        self.bus.close();
        info!("engine shut down");
    }

    fn authorize(&self, credential: &str, domain: &str, pointer: &str, action: &str) -> Result<CapabilityToken> {
        let token = self.guard.resolve(credential)?;
        self.guard.check(&token, domain, pointer, action)?;
        Ok(token)
    }

    /// Resolve a credential that must hold `action` on some part of `domain`.
    fn authorize_partial(&self, credential: &str, domain: &str, action: &str) -> Result<CapabilityToken> {
        let token = self.guard.resolve(credential)?;
        let any = !token.is_expired(Utc::now())
            && token.actions.iter().any(|a| a == action)
            && token.resources.iter().any(|r| r.domain == domain);
        if !any {
            return Err(CoreError::unauthorized(domain, "", action));
        }
        Ok(token)
    }

    // Expressions

    pub async fn get_expression(&self, credential: &str, address: &Address) -> Result<Option<Expression>> {
        self.authorize(credential, domains::EXPRESSION, &address.to_string(), actions::READ)?;
        self.languages.get_expression(address).await
    }

    pub async fn get_expression_raw(&self, credential: &str, address: &Address) -> Result<Option<String>> {
        self.authorize(credential, domains::EXPRESSION, &address.to_string(), actions::READ)?;
        self.languages.get_expression_raw(address).await
    }

    pub async fn create_expression(&self, credential: &str, language_id: &str, data: Value) -> Result<Address> {
        self.authorize(credential, domains::EXPRESSION, language_id, actions::CREATE)?;
        self.languages.expression_create(language_id, data).await
    }

    // Languages

    /// Installed languages the credential may read.
    pub fn languages(&self, credential: &str, interface: Option<&str>) -> Result<Vec<LanguageInfo>> {
        let token = self.authorize_partial(credential, domains::LANGUAGE, actions::READ)?;
        Ok(self
            .languages
            .languages(interface)
            .into_iter()
            .filter(|info| self.guard.authorize(&token, domains::LANGUAGE, &info.id, actions::READ))
            .collect())
    }

    pub fn language(&self, credential: &str, language_id: &str) -> Result<LanguageInfo> {
        self.authorize(credential, domains::LANGUAGE, language_id, actions::READ)?;
        self.languages.language(language_id)
    }

    pub async fn write_language_settings(&self, credential: &str, language_id: &str, settings: Value) -> Result<()> {
        self.authorize(credential, domains::LANGUAGE, language_id, actions::UPDATE)?;
        self.languages.put_settings(language_id, settings).await
    }

    // Perspectives

    /// Perspectives the credential may read.
    pub fn list_perspectives(&self, credential: &str) -> Result<Vec<PerspectiveHandle>> {
        let token = self.authorize_partial(credential, domains::PERSPECTIVE, actions::READ)?;
        Ok(self
            .perspectives
            .all()
            .into_iter()
            .filter(|h| self.guard.authorize(&token, domains::PERSPECTIVE, &h.uuid.to_string(), actions::READ))
            .collect())
    }

    pub fn get_perspective(&self, credential: &str, uuid: Uuid) -> Result<PerspectiveHandle> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::READ)?;
        self.perspectives.get(uuid)
    }

    pub fn perspective_snapshot(&self, credential: &str, uuid: Uuid) -> Result<PerspectiveSnapshot> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::READ)?;
        self.perspectives.snapshot(uuid)
    }

    pub fn query_links(&self, credential: &str, uuid: Uuid, query: &LinkQuery) -> Result<Vec<Link>> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::READ)?;
        self.perspectives.query_links(uuid, query)
    }

    pub async fn create_perspective(&self, credential: &str, name: &str) -> Result<PerspectiveHandle> {
        self.authorize(credential, domains::PERSPECTIVE, "", actions::CREATE)?;
        self.perspectives.add(name).await
    }

    pub async fn update_perspective(&self, credential: &str, uuid: Uuid, name: &str) -> Result<PerspectiveHandle> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::UPDATE)?;
        self.perspectives.update(uuid, name).await
    }

    pub async fn remove_perspective(&self, credential: &str, uuid: Uuid) -> Result<()> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::DELETE)?;
        self.perspectives.remove(uuid).await
    }

    pub async fn add_link(&self, credential: &str, uuid: Uuid, link: LinkInput) -> Result<Link> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::CREATE)?;
        self.perspectives.add_link(uuid, link).await
    }

    pub async fn update_link(&self, credential: &str, uuid: Uuid, old: &Link, new: LinkInput) -> Result<Link> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::UPDATE)?;
        self.perspectives.update_link(uuid, old, new).await
    }

    pub async fn remove_link(&self, credential: &str, uuid: Uuid, link: &Link) -> Result<bool> {
        self.authorize(credential, domains::PERSPECTIVE, &uuid.to_string(), actions::DELETE)?;
        self.perspectives.remove_link(uuid, link).await
    }

    // Neighbourhoods

    pub async fn publish_perspective(
        &self,
        credential: &str,
        uuid: Uuid,
        link_language_id: &str,
        meta: Vec<Link>,
    ) -> Result<Address> {
        self.authorize(credential, domains::NEIGHBOURHOOD, &uuid.to_string(), actions::CREATE)?;
        self.perspectives.publish(uuid, link_language_id, meta).await
    }

    pub async fn join_neighbourhood_from_url(&self, credential: &str, url: &Address) -> Result<PerspectiveHandle> {
        self.authorize(credential, domains::NEIGHBOURHOOD, &url.to_string(), actions::CREATE)?;
        self.perspectives.join_from_url(url).await
    }

    // Agent

    pub fn get_agent_status(&self, credential: &str) -> Result<AgentStatus> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::READ)?;
        Ok(self.agent.status())
    }

    pub fn get_agent(&self, credential: &str) -> Result<Agent> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::READ)?;
        self.agent.agent().ok_or(CoreError::AgentNotInitialized)
    }

    pub async fn agent_by_did(&self, credential: &str, did: &str) -> Result<Option<Agent>> {
        self.authorize(credential, domains::AGENT, did, actions::READ)?;
        self.languages.agent_by_did(did).await
    }

    /// Create the agent, from fresh keys or an exported keystore.
    pub async fn initialize_agent(
        &self,
        credential: &str,
        passphrase: &str,
        import: Option<AgentImport>,
    ) -> Result<AgentStatus> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::CREATE)?;
        let status = match import {
            Some(import) => {
                self.agent
                    .initialize_from_keystore(&import.did, &import.keystore, passphrase)
                    .await?
            }
            None => self.agent.initialize(passphrase).await?,
        };
        if let Some(agent) = self.agent.agent() {
            self.publish_profile(&agent).await;
        }
        Ok(status)
    }

    pub async fn lock_agent(&self, credential: &str, passphrase: &str) -> Result<AgentStatus> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::UPDATE)?;
        self.agent.lock(passphrase).await
    }

    pub async fn unlock_agent(&self, credential: &str, passphrase: &str) -> Result<AgentStatus> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::UPDATE)?;
        self.agent.unlock(passphrase).await
    }

    pub async fn update_agent_public_perspective(&self, credential: &str, perspective: Address) -> Result<Agent> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::UPDATE)?;
        let agent = self.agent.update_public_perspective(perspective).await?;
        self.publish_profile(&agent).await;
        Ok(agent)
    }

    pub async fn update_agent_direct_message_language(&self, credential: &str, language: Address) -> Result<Agent> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::UPDATE)?;
        let agent = self.agent.update_direct_message_language(language).await?;
        self.publish_profile(&agent).await;
        Ok(agent)
    }

    pub fn export_keystore(&self, credential: &str) -> Result<String> {
        self.authorize(credential, domains::AGENT, SELF_POINTER, actions::READ)?;
        self.agent.export_keystore()
    }

    async fn publish_profile(&self, agent: &Agent) {
        if let Err(e) = self.languages.publish_agent_profile(agent).await {
            warn!(did = %agent.did, error = %e, "failed to publish agent profile");
        }
    }

    // Capabilities

    /// File a pairing request. Needs no credential.
    pub async fn request_capability(&self, request: CapabilityRequest) -> Result<String> {
        self.guard.request_capability(request).await
    }

    pub async fn permit_capability(&self, credential: &str, request_id: &str) -> Result<String> {
        self.authorize(credential, domains::CAPABILITY, request_id, actions::UPDATE)?;
        self.guard.permit(request_id).await
    }

    /// Redeem a pairing code. Needs no credential.
    pub async fn generate_jwt(&self, code: &str) -> Result<IssuedToken> {
        self.guard.redeem(code).await
    }

    pub fn apps(&self, credential: &str) -> Result<Vec<AppGrant>> {
        self.authorize(credential, domains::CAPABILITY, "", actions::READ)?;
        Ok(self.guard.apps())
    }

    // Subscriptions

    /// Subscribe to `topic`. Link topics can be narrowed to one perspective.
    pub fn subscribe(&self, credential: &str, topic: Topic, perspective: Option<Uuid>) -> Result<Subscription> {
        let (domain, pointer) = match (topic, perspective) {
            (Topic::AgentUpdated, _) => (domains::AGENT, SELF_POINTER.to_string()),
            (_, Some(uuid)) => (domains::PERSPECTIVE, uuid.to_string()),
            (_, None) => (domains::PERSPECTIVE, String::new()),
        };
        self.authorize(credential, domain, &pointer, actions::SUBSCRIBE)?;

        let filter = match perspective {
            Some(uuid) if topic != Topic::AgentUpdated => EventFilter::Perspective(uuid),
            _ => EventFilter::All,
        };
        Ok(self.bus.subscribe(topic, filter))
    }
}
