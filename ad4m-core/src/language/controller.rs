use super::agent::AGENT_LANGUAGE_ID;
use super::Language;
use crate::address_space::AddressSpace;
use crate::agent::{verify_expression, AgentService};
use crate::error::{CoreError, Result};
use crate::persistence::StateStore;
use ad4m_types::{Address, Agent, Expression};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Public description of an installed language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    pub id: String,
    pub name: String,
    pub interfaces: Vec<String>,
    pub settings: Value,
    pub generation: u64,
}

/// Front door to the address space: install adapters, route expression
/// reads and writes, keep adapter settings persisted.
pub struct LanguageController {
    space: Arc<AddressSpace>,
    agent: Arc<AgentService>,
    store: Arc<dyn StateStore>,
}

impl LanguageController {
    pub fn new(space: Arc<AddressSpace>, agent: Arc<AgentService>, store: Arc<dyn StateStore>) -> Self {
        Self { space, agent, store }
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Register `language` under its own id, restoring saved settings.
    pub async fn install(&self, language: Arc<dyn Language>) -> Result<u64> {
        let id = language.id().to_string();
        if let Some(settings) = self.store.load_language_settings(&id).await? {
            language
                .put_settings(settings)
                .map_err(|e| CoreError::adapter_for_language(&id, e))?;
            debug!(language = %id, "restored language settings");
        }
        self.space.register(id, language)
    }

    pub fn uninstall(&self, language_id: &str) -> Result<bool> {
        self.space.unregister(language_id)
    }

    fn info(&self, id: String, language: &Arc<dyn Language>) -> LanguageInfo {
        LanguageInfo {
            generation: self.space.generation(&id).unwrap_or_default(),
            name: language.name().to_string(),
            interfaces: language.interfaces().iter().map(|i| i.to_string()).collect(),
            settings: language.settings(),
            id,
        }
    }

    /// Installed languages, optionally only those offering `interface`.
    pub fn languages(&self, interface: Option<&str>) -> Vec<LanguageInfo> {
        self.space
            .adapters()
            .into_iter()
            .filter(|(_, language)| {
                interface.map_or(true, |wanted| language.interfaces().iter().any(|i| *i == wanted))
            })
            .map(|(id, language)| self.info(id, &language))
            .collect()
    }

    pub fn language(&self, language_id: &str) -> Result<LanguageInfo> {
        let resolved = self.space.resolve_language(language_id)?;
        Ok(self.info(language_id.to_string(), resolved.adapter()))
    }

    pub fn language_settings(&self, language_id: &str) -> Result<Value> {
        Ok(self.space.resolve_language(language_id)?.settings())
    }

    /// Hand `settings` to the adapter and persist them under its id.
    pub async fn put_settings(&self, language_id: &str, settings: Value) -> Result<()> {
        {
            let resolved = self.space.resolve_language(language_id)?;
            resolved
                .put_settings(settings.clone())
                .map_err(|e| CoreError::adapter_for_language(language_id, e))?;
        }
        self.store.save_language_settings(language_id, &settings).await?;
        info!(language = %language_id, "language settings written");
        Ok(())
    }

    /// Store `data` through `language_id`, signed by the local agent.
    pub async fn expression_create(&self, language_id: &str, data: Value) -> Result<Address> {
        let signer = self.agent.signer()?;
        let resolved = self.space.resolve_language(language_id)?;
        let address = resolved
            .put(data, &signer)
            .await
            .map_err(|e| CoreError::adapter_for_language(language_id, e))?;
        debug!(%address, "expression created");
        Ok(address)
    }

    /// Fetch an expression with its proof checked.
    pub async fn get_expression(&self, address: &Address) -> Result<Option<Expression>> {
        let resolved = self.space.resolve(address)?;
        let expression = resolved
            .get(address.content())
            .await
            .map_err(|e| CoreError::adapter(address, e))?;

        Ok(expression.map(|mut expression| {
            let valid = verify_expression(&expression);
            if !valid {
                warn!(%address, "expression proof does not verify");
            }
            expression.proof.valid = Some(valid);
            expression
        }))
    }

    /// The expression serialized as stored, proof unchecked.
    pub async fn get_expression_raw(&self, address: &Address) -> Result<Option<String>> {
        let resolved = self.space.resolve(address)?;
        let expression = resolved
            .get(address.content())
            .await
            .map_err(|e| CoreError::adapter(address, e))?;
        expression.map(|e| serde_json::to_string(&e)).transpose().map_err(Into::into)
    }

    /// Publish `agent` as a profile expression in the agent language.
    ///
    /// Does nothing when no agent language is installed.
    pub async fn publish_agent_profile(&self, agent: &Agent) -> Result<Option<Address>> {
        if !self.space.contains(AGENT_LANGUAGE_ID) {
            return Ok(None);
        }
        let address = self
            .expression_create(AGENT_LANGUAGE_ID, serde_json::to_value(agent)?)
            .await?;
        Ok(Some(address))
    }

    /// Resolve a DID to its agent profile.
    ///
    /// The local agent is answered directly.
    pub async fn agent_by_did(&self, did: &str) -> Result<Option<Agent>> {
        if let Some(local) = self.agent.agent().filter(|a| a.did == did) {
            return Ok(Some(local));
        }
        let address = Address::parse(did)?;
        match self.get_expression(&address).await? {
            Some(expression) => Ok(Some(serde_json::from_value(expression.data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChangeBus;
    use crate::config::KdfParams;
    use crate::language::{interfaces, AddressScheme, AgentLanguage, ContentBacking, ContentLanguage};
    use crate::persistence::MemoryStateStore;
    use serde_json::json;

    async fn controller(store: Arc<dyn StateStore>) -> LanguageController {
        let agent = AgentService::load(store.clone(), ChangeBus::new(8), KdfParams::fast())
            .await
            .unwrap();
        LanguageController::new(Arc::new(AddressSpace::new()), Arc::new(agent), store)
    }

    #[tokio::test]
    async fn test_create_requires_unlocked_agent() {
        let languages = controller(Arc::new(MemoryStateStore::new())).await;
        languages
            .install(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
            .await
            .unwrap();

        assert!(matches!(
            languages.expression_create("notes", json!("hi")).await,
            Err(CoreError::AgentNotInitialized)
        ));
        languages.agent.initialize("pw").await.unwrap();
        languages.agent.lock("pw").await.unwrap();
        assert!(matches!(
            languages.expression_create("notes", json!("hi")).await,
            Err(CoreError::AgentLocked)
        ));
    }

    #[tokio::test]
    async fn test_expression_roundtrip_verifies_proof() {
        let languages = controller(Arc::new(MemoryStateStore::new())).await;
        languages.agent.initialize("pw").await.unwrap();
        languages
            .install(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
            .await
            .unwrap();

        let address = languages.expression_create("notes", json!({"text": "hi"})).await.unwrap();
        let expression = languages.get_expression(&address).await.unwrap().unwrap();
        assert_eq!(expression.proof.valid, Some(true));
        assert_eq!(expression.author, languages.agent.did().unwrap());

        let raw = languages.get_expression_raw(&address).await.unwrap().unwrap();
        assert!(raw.contains("\"text\":\"hi\""));

        let missing = Address::parse("nowhere://x").unwrap();
        assert!(matches!(
            languages.get_expression(&missing).await,
            Err(CoreError::AdapterNotFound(id)) if id == "nowhere"
        ));
    }

    #[tokio::test]
    async fn test_adapter_errors_are_wrapped() {
        let languages = controller(Arc::new(MemoryStateStore::new())).await;
        languages.agent.initialize("pw").await.unwrap();
        languages
            .install(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
            .await
            .unwrap();

        let err = languages.expression_create("notes", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoreError::AdapterFailure { address, .. } if address == "notes://"));
    }

    #[tokio::test]
    async fn test_settings_persist_across_install() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = controller(store.clone()).await;
        first
            .install(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
            .await
            .unwrap();
        first.put_settings("notes", json!({"maxBytes": 64})).await.unwrap();

        let second = controller(store).await;
        second
            .install(Arc::new(ContentLanguage::new("notes", AddressScheme::Hash)))
            .await
            .unwrap();
        assert_eq!(second.language_settings("notes").unwrap(), json!({"maxBytes": 64}));
    }

    #[tokio::test]
    async fn test_languages_filter_by_interface() {
        let languages = controller(Arc::new(MemoryStateStore::new())).await;
        let backing = ContentBacking::new();
        languages
            .install(Arc::new(ContentLanguage::with_backing("notes", AddressScheme::Hash, backing)))
            .await
            .unwrap();
        languages.install(Arc::new(AgentLanguage::new())).await.unwrap();

        assert_eq!(languages.languages(None).len(), 2);
        let agents = languages.languages(Some(interfaces::AGENT));
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "did");
        assert!(languages.languages(Some(interfaces::LINK_SYNC)).is_empty());
        assert!(matches!(languages.language("nope"), Err(CoreError::AdapterNotFound(_))));
    }

    #[tokio::test]
    async fn test_agent_profile_resolves_by_did() {
        let languages = controller(Arc::new(MemoryStateStore::new())).await;
        languages.install(Arc::new(AgentLanguage::new())).await.unwrap();
        languages.agent.initialize("pw").await.unwrap();
        let agent = languages.agent.agent().unwrap();

        let address = languages.publish_agent_profile(&agent).await.unwrap().unwrap();
        let expression = languages.get_expression(&address).await.unwrap().unwrap();
        let profile: Agent = serde_json::from_value(expression.data).unwrap();
        assert_eq!(profile.did, agent.did);
        assert_eq!(languages.agent_by_did(&agent.did).await.unwrap(), Some(agent));
    }
}
