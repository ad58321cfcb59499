//! Shared types for ad4m
//!
//! This crate provides the value types passed between the engine, its
//! language adapters and the executor: addresses, expressions, links,
//! perspectives, agents, capability tokens and change events.

mod address;
mod agent;
mod capability;
mod event;
mod expression;
mod link;
mod perspective;

pub use address::{Address, AddressError, Node, Sentinel};
pub use agent::{Agent, AgentStatus};
pub use capability::{actions, domains, CapabilityToken, Resource};
pub use event::{ChangeEvent, Topic};
pub use expression::{Expression, ExpressionProof};
pub use link::{Link, LinkIdentity, LinkInput, LinkQuery, PerspectiveDiff};
pub use perspective::{Neighbourhood, PerspectiveHandle, PerspectiveSnapshot};
