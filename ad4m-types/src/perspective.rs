use crate::address::Address;
use crate::link::Link;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and metadata of a perspective, without its links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveHandle {
    pub uuid: Uuid,
    pub name: String,
    /// Neighbourhood this perspective mirrors, if shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_url: Option<Address>,
}

impl PerspectiveHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            shared_url: None,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared_url.is_some()
    }
}

/// A perspective together with its links at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveSnapshot {
    #[serde(flatten)]
    pub handle: PerspectiveHandle,
    pub links: Vec<Link>,
}

/// Content of a published neighbourhood expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbourhood {
    /// Language id of the link-sync adapter carrying the shared links
    pub link_language: String,
    #[serde(default)]
    pub meta: Vec<Link>,
}
