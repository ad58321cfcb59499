use crate::address::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signature over `(author, timestamp, data)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionProof {
    /// Signer's public key, hex encoded
    pub key: String,
    /// ed25519 signature, hex encoded
    pub signature: String,
    /// Set by the engine when the expression is read back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

/// An immutable, signed unit of content owned by one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub address: Address,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub proof: ExpressionProof,
}

impl Expression {
    /// Bytes covered by the proof.
    ///
    /// serde_json keeps object keys sorted, so the encoding is stable for
    /// equal values.
    pub fn signing_payload(author: &str, timestamp: &DateTime<Utc>, data: &Value) -> Vec<u8> {
        let payload = serde_json::json!({
            "author": author,
            "timestamp": timestamp.to_rfc3339(),
            "data": data,
        });
        payload.to_string().into_bytes()
    }

    pub fn payload(&self) -> Vec<u8> {
        Self::signing_payload(&self.author, &self.timestamp, &self.data)
    }
}
