//! In-memory content-addressed expression store.

use super::{interfaces, sign_expression, ExpressionSigner, Language};
use crate::error::AdapterError;
use ad4m_types::{Address, Expression};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// How a content language derives content ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressScheme {
    /// blake3 of the canonical JSON of the data
    Hash,
    /// Monotonic counter per backing store
    Sequence,
}

#[derive(Debug, Error)]
enum ContentError {
    #[error("refusing to store null content")]
    NullContent,

    #[error("content is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("settings must be a JSON object")]
    SettingsNotObject,
}

/// Storage shared by every instance attached to it.
///
/// Several agents in one process can attach languages to the same backing
/// to see each other's expressions, standing in for a network store.
#[derive(Clone, Default)]
pub struct ContentBacking {
    entries: Arc<RwLock<HashMap<String, Expression>>>,
    sequence: Arc<AtomicU64>,
}

impl ContentBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ContentLanguage {
    id: String,
    scheme: AddressScheme,
    backing: ContentBacking,
    settings: RwLock<Value>,
}

impl ContentLanguage {
    pub fn new(id: impl Into<String>, scheme: AddressScheme) -> Self {
        Self::with_backing(id, scheme, ContentBacking::new())
    }

    pub fn with_backing(id: impl Into<String>, scheme: AddressScheme, backing: ContentBacking) -> Self {
        Self {
            id: id.into(),
            scheme,
            backing,
            settings: RwLock::new(Value::Object(Default::default())),
        }
    }

    pub fn scheme(&self) -> AddressScheme {
        self.scheme
    }

    fn content_id(&self, data: &Value) -> String {
        match self.scheme {
            AddressScheme::Hash => blake3::hash(data.to_string().as_bytes()).to_hex().to_string(),
            AddressScheme::Sequence => {
                let n = self.backing.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                n.to_string()
            }
        }
    }

    fn size_limit(&self) -> Option<usize> {
        self.settings
            .read()
            .get("maxBytes")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }
}

#[async_trait]
impl Language for ContentLanguage {
    fn id(&self) -> &str {
        &self.id
    }

    fn interfaces(&self) -> Vec<&'static str> {
        vec![interfaces::EXPRESSION, interfaces::SETTINGS]
    }

    async fn get(&self, content_id: &str) -> Result<Option<Expression>, AdapterError> {
        Ok(self.backing.entries.read().get(content_id).cloned())
    }

    async fn put(&self, data: Value, signer: &dyn ExpressionSigner) -> Result<Address, AdapterError> {
        if data.is_null() {
            return Err(ContentError::NullContent.into());
        }
        if let Some(limit) = self.size_limit() {
            let size = data.to_string().len();
            if size > limit {
                return Err(ContentError::TooLarge { size, limit }.into());
            }
        }

        let content_id = self.content_id(&data);
        let address = Address::new(self.id.clone(), content_id.clone())?;

        let mut entries = self.backing.entries.write();
        // Identical content already stored keeps its original expression.
        if !entries.contains_key(&content_id) {
            let expression = sign_expression(address.clone(), data, signer);
            entries.insert(content_id, expression);
            debug!(%address, "expression stored");
        }
        Ok(address)
    }

    fn settings(&self) -> Value {
        self.settings.read().clone()
    }

    fn put_settings(&self, settings: Value) -> Result<(), AdapterError> {
        if !settings.is_object() {
            return Err(ContentError::SettingsNotObject.into());
        }
        *self.settings.write() = settings;
        Ok(())
    }
}
