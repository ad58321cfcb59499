use crate::agent::Agent;
use crate::link::Link;
use crate::perspective::PerspectiveHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Broadcast topics of the change bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    AgentUpdated,
    PerspectiveAdded,
    PerspectiveUpdated,
    PerspectiveRemoved,
    LinkAdded,
    LinkRemoved,
    LinkUpdated,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::AgentUpdated,
        Topic::PerspectiveAdded,
        Topic::PerspectiveUpdated,
        Topic::PerspectiveRemoved,
        Topic::LinkAdded,
        Topic::LinkRemoved,
        Topic::LinkUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::AgentUpdated => "agentUpdated",
            Topic::PerspectiveAdded => "perspectiveAdded",
            Topic::PerspectiveUpdated => "perspectiveUpdated",
            Topic::PerspectiveRemoved => "perspectiveRemoved",
            Topic::LinkAdded => "linkAdded",
            Topic::LinkRemoved => "linkRemoved",
            Topic::LinkUpdated => "linkUpdated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown topic '{s}'"))
    }
}

/// A change published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    AgentUpdated {
        agent: Agent,
    },
    PerspectiveAdded {
        perspective: PerspectiveHandle,
    },
    PerspectiveUpdated {
        perspective: PerspectiveHandle,
    },
    PerspectiveRemoved {
        uuid: Uuid,
    },
    LinkAdded {
        perspective: Uuid,
        link: Link,
    },
    LinkRemoved {
        perspective: Uuid,
        link: Link,
    },
    #[serde(rename_all = "camelCase")]
    LinkUpdated {
        perspective: Uuid,
        old_link: Link,
        new_link: Link,
    },
}

impl ChangeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChangeEvent::AgentUpdated { .. } => Topic::AgentUpdated,
            ChangeEvent::PerspectiveAdded { .. } => Topic::PerspectiveAdded,
            ChangeEvent::PerspectiveUpdated { .. } => Topic::PerspectiveUpdated,
            ChangeEvent::PerspectiveRemoved { .. } => Topic::PerspectiveRemoved,
            ChangeEvent::LinkAdded { .. } => Topic::LinkAdded,
            ChangeEvent::LinkRemoved { .. } => Topic::LinkRemoved,
            ChangeEvent::LinkUpdated { .. } => Topic::LinkUpdated,
        }
    }

    /// Perspective the event concerns, if any.
    pub fn perspective_uuid(&self) -> Option<Uuid> {
        match self {
            ChangeEvent::AgentUpdated { .. } => None,
            ChangeEvent::PerspectiveAdded { perspective }
            | ChangeEvent::PerspectiveUpdated { perspective } => Some(perspective.uuid),
            ChangeEvent::PerspectiveRemoved { uuid } => Some(*uuid),
            ChangeEvent::LinkAdded { perspective, .. }
            | ChangeEvent::LinkRemoved { perspective, .. }
            | ChangeEvent::LinkUpdated { perspective, .. } => Some(*perspective),
        }
    }
}
