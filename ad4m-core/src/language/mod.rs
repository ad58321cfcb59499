//! Language adapters: the pluggable units that own one class of content.
//!
//! Every adapter implements [`Language`]: fetch an expression by content id,
//! store new content and sign it, and keep a settings blob. Adapters that
//! carry a shared perspective additionally hand out a [`LinkSyncAdapter`].
//!
//! Concrete adapters:
//! - [`ContentLanguage`]: content-addressed (hash or sequence) store
//! - [`AgentLanguage`]: resolves DIDs to agent profile expressions
//! - [`LocalNeighbourhood`]: in-process link sync through a [`NeighbourhoodHub`]

mod agent;
mod content;
mod controller;
mod neighbourhood;

pub use agent::AgentLanguage;
pub use content::{AddressScheme, ContentBacking, ContentLanguage};
pub use controller::{LanguageController, LanguageInfo};
pub use neighbourhood::{LocalNeighbourhood, NeighbourhoodHub};

use crate::error::AdapterError;
use ad4m_types::{Address, Expression, ExpressionProof, Link, PerspectiveDiff};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Interface names reported by [`Language::interfaces`].
pub mod interfaces {
    pub const EXPRESSION: &str = "expression";
    pub const AGENT: &str = "agent";
    pub const LINK_SYNC: &str = "linkSync";
    pub const SETTINGS: &str = "settings";
}

/// Produces proofs for new expressions on behalf of the local agent.
pub trait ExpressionSigner: Send + Sync {
    fn did(&self) -> &str;

    fn sign(&self, payload: &[u8]) -> ExpressionProof;
}

/// Callback receiving diffs committed by other agents.
pub type RemoteLinksCallback = Box<dyn Fn(PerspectiveDiff) + Send + Sync>;

/// The capability set every language adapter provides.
#[async_trait]
pub trait Language: Send + Sync {
    /// Stable identifier; also the namespace of the adapter's addresses
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn interfaces(&self) -> Vec<&'static str>;

    /// Fetch the expression stored under `content_id`.
    async fn get(&self, content_id: &str) -> Result<Option<Expression>, AdapterError>;

    /// Store `data`, signed by `signer`, and return its address.
    async fn put(&self, data: Value, signer: &dyn ExpressionSigner) -> Result<Address, AdapterError>;

    fn settings(&self) -> Value;

    fn put_settings(&self, settings: Value) -> Result<(), AdapterError>;

    /// Link-sync capability of neighbourhood adapters.
    fn link_sync(&self) -> Option<Arc<dyn LinkSyncAdapter>> {
        None
    }
}

/// Synchronizes one perspective's links with other agents.
#[async_trait]
pub trait LinkSyncAdapter: Send + Sync {
    async fn current_revision(&self) -> Result<Option<String>, AdapterError>;

    /// Full current link set as seen by the neighbourhood
    async fn render(&self) -> Result<Vec<Link>, AdapterError>;

    /// Publish a local diff. The returned revision acknowledges it.
    async fn commit(&self, diff: PerspectiveDiff) -> Result<String, AdapterError>;

    /// Deliver diffs committed by other agents to `callback`.
    fn subscribe_remote_links(&self, callback: RemoteLinksCallback);

    /// Drop the callback registered by `subscribe_remote_links`.
    fn unsubscribe_remote_links(&self);
}

/// Build and sign an expression for `data` stored at `address`.
pub fn sign_expression(address: Address, data: Value, signer: &dyn ExpressionSigner) -> Expression {
    let timestamp = Utc::now();
    let author = signer.did().to_string();
    let payload = Expression::signing_payload(&author, &timestamp, &data);
    let proof = signer.sign(&payload);
    Expression {
        address,
        author,
        timestamp,
        data,
        proof,
    }
}
