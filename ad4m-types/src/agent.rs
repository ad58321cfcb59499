use crate::address::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single local agent of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub did: String,
    /// Public perspective expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_message_language: Option<Address>,
    #[serde(default)]
    pub locked: bool,
}

impl Agent {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            perspective: None,
            direct_message_language: None,
            locked: false,
        }
    }
}

/// Lifecycle snapshot reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub is_initialized: bool,
    pub is_unlocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did_document: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
