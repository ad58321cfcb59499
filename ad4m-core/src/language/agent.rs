//! DID-resolution adapter: one profile expression per agent.

use super::{interfaces, sign_expression, ExpressionSigner, Language};
use crate::error::AdapterError;
use ad4m_types::{Address, Expression};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const AGENT_LANGUAGE_ID: &str = "did";

/// Stores agent profiles addressed by the agent's own DID.
///
/// Addresses are `did:<method>:<id>`, so the language id is `did` and the
/// content id is the rest of the DID. An agent may only publish its own
/// profile; a later put replaces the earlier one.
pub struct AgentLanguage {
    profiles: Arc<RwLock<HashMap<String, Expression>>>,
    settings: RwLock<Value>,
}

impl Default for AgentLanguage {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLanguage {
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
            settings: RwLock::new(Value::Object(Default::default())),
        }
    }

    /// Share profile storage with another instance (e.g. another agent in-process).
    pub fn shared_with(other: &AgentLanguage) -> Self {
        Self {
            profiles: other.profiles.clone(),
            settings: RwLock::new(Value::Object(Default::default())),
        }
    }
}

#[async_trait]
impl Language for AgentLanguage {
    fn id(&self) -> &str {
        AGENT_LANGUAGE_ID
    }

    fn name(&self) -> &str {
        "agent-profiles"
    }

    fn interfaces(&self) -> Vec<&'static str> {
        vec![interfaces::EXPRESSION, interfaces::AGENT]
    }

    async fn get(&self, content_id: &str) -> Result<Option<Expression>, AdapterError> {
        Ok(self.profiles.read().get(content_id).cloned())
    }

    async fn put(&self, data: Value, signer: &dyn ExpressionSigner) -> Result<Address, AdapterError> {
        let address = Address::parse(signer.did())?;
        if address.language() != AGENT_LANGUAGE_ID {
            return Err(format!("signer id '{}' is not a DID", signer.did()).into());
        }
        let expression = sign_expression(address.clone(), data, signer);
        self.profiles
            .write()
            .insert(address.content().to_string(), expression);
        debug!(did = %signer.did(), "agent profile published");
        Ok(address)
    }

    fn settings(&self) -> Value {
        self.settings.read().clone()
    }

    fn put_settings(&self, settings: Value) -> Result<(), AdapterError> {
        *self.settings.write() = settings;
        Ok(())
    }
}
