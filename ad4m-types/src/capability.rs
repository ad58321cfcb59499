use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource domains a capability can scope.
pub mod domains {
    pub const AGENT: &str = "agent";
    pub const EXPRESSION: &str = "expression";
    pub const LANGUAGE: &str = "language";
    pub const PERSPECTIVE: &str = "perspective";
    pub const NEIGHBOURHOOD: &str = "neighbourhood";
    pub const CAPABILITY: &str = "capability";

    pub const ALL: [&str; 6] = [AGENT, EXPRESSION, LANGUAGE, PERSPECTIVE, NEIGHBOURHOOD, CAPABILITY];
}

/// Actions a capability can grant.
pub mod actions {
    pub const READ: &str = "READ";
    pub const CREATE: &str = "CREATE";
    pub const UPDATE: &str = "UPDATE";
    pub const DELETE: &str = "DELETE";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";

    pub const ALL: [&str; 5] = [READ, CREATE, UPDATE, DELETE, SUBSCRIBE];
}

/// A domain plus the pointers inside it. No pointers means the whole domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub domain: String,
    #[serde(default)]
    pub pointers: Vec<String>,
}

impl Resource {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            pointers: Vec::new(),
        }
    }

    pub fn pointer(domain: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            pointers: vec![pointer.into()],
        }
    }
}

/// A scoped, expirable grant of actions over resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub issuer: String,
    pub subject: String,
    pub resources: Vec<Resource>,
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl CapabilityToken {
    pub fn new(
        issuer: impl Into<String>,
        subject: impl Into<String>,
        resources: Vec<Resource>,
        actions: Vec<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            subject: subject.into(),
            resources,
            actions,
            expiry: None,
        }
    }

    /// Every action on every domain.
    pub fn admin(issuer: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(
            issuer,
            subject,
            domains::ALL.iter().map(|d| Resource::domain(*d)).collect(),
            actions::ALL.iter().map(|a| a.to_string()).collect(),
        )
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map_or(false, |expiry| now >= expiry)
    }
}
