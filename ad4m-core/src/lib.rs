//! ad4m-core - agent-centric perspective engine
//!
//! This crate hosts one local agent and the graphs it keeps. Content lives
//! behind pluggable language adapters; the agent's own knowledge is a set of
//! perspectives, each a graph of links between addresses. Perspectives can
//! be shared with other agents through a neighbourhood.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Ad4mCore                            │
//! │        (facade: every call checked by CapabilityGuard)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  AgentService   LanguageController   PerspectivesController  │
//! │   (keys, DID)     │                    │                     │
//! │                   ▼                    ▼                     │
//! │             AddressSpace      PerspectiveInstance (1/uuid)   │
//! │        (language id → adapter)   LinkStore + LinkSyncAdapter │
//! │                                        │                     │
//! │                  ChangeBus ◄───────────┘                     │
//! │        (bounded per-subscriber queues, topic + filter)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Addresses and languages
//!
//! An [`Address`] is `language://content`. The [`AddressSpace`] maps the
//! language part to the registered [`Language`] adapter, which alone knows
//! how to fetch and store that content.
//!
//! ## Perspectives
//!
//! A perspective's links are only ever changed through its serialized
//! mutation path, local or remote. Subscribers see changes in the order
//! they were applied.
//!
//! ## Capabilities
//!
//! Apps pair with the agent to obtain a [`CapabilityToken`] scoped to
//! domains, pointers and actions; see [`capability`].
//!
//! # Example
//!
//! ```ignore
//! use ad4m_core::{Ad4mCore, CoreConfig};
//!
//! let config = CoreConfig {
//!     admin_credential: Some("secret".into()),
//!     ..CoreConfig::ephemeral()
//! };
//! let core = Ad4mCore::open(config).await?;
//! let admin = "secret";
//! core.initialize_agent(admin, "passphrase", None).await?;
//! let home = core.create_perspective(admin, "home").await?;
//! ```

pub mod address_space;
pub mod agent;
pub mod bus;
pub mod capability;
pub mod config;
mod engine;
pub mod error;
pub mod language;
pub mod link_store;
pub mod persistence;
pub mod perspectives;

pub use address_space::{AddressSpace, ResolvedLanguage};
pub use agent::{AgentService, AgentSigner, StoredAgent};
pub use bus::{ChangeBus, EventFilter, Subscription, SubscriptionId};
pub use capability::{AppGrant, CapabilityGuard, CapabilityRecord, CapabilityRequest, IssuedToken};
pub use config::{CoreConfig, KdfParams};
pub use engine::{Ad4mCore, AgentImport, SELF_POINTER};
pub use error::{AdapterError, CoreError, Result};
pub use language::{
    AddressScheme, AgentLanguage, ContentBacking, ContentLanguage, ExpressionSigner, Language, LanguageController,
    LanguageInfo, LinkSyncAdapter, LocalNeighbourhood, NeighbourhoodHub,
};
pub use link_store::{LinkMatches, LinkStore, Replacement};
pub use persistence::{FileStateStore, MemoryStateStore, StateStore};
pub use perspectives::{PerspectiveInstance, PerspectivesController, NEIGHBOURHOOD_LANGUAGE_ID};

pub use ad4m_types::{
    actions, domains, Address, Agent, AgentStatus, CapabilityToken, ChangeEvent, Expression, Link, LinkInput,
    LinkQuery, Node, PerspectiveDiff, PerspectiveHandle, PerspectiveSnapshot, Resource, Topic,
};
