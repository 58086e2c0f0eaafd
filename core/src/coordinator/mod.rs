//! Multi-tab coordinator
//!
//! Tabs of one origin elect a single leader over a broadcast channel. Only
//! the leader keeps a relay connection; followers forward requests to it.
//! There is no external arbiter, so two leaders can briefly coexist after a
//! race; availability wins over strict exclusivity.

pub mod channel;
pub mod tab;

pub use channel::{BroadcastChannel, LocalBroadcast};
pub use tab::{AppMessageHandler, ElectedHandler, RequestHandler, TabCoordinator, TabHandlers};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Silence after a leadership request before claiming leadership
    #[serde(with = "crate::config::duration_ms")]
    pub election_timeout: Duration,
    /// How long an unloading follower has to prove it is still alive
    #[serde(with = "crate::config::duration_ms")]
    pub child_ack_timeout: Duration,
    /// Follower → leader request deadline
    #[serde(with = "crate::config::duration_ms")]
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(1),
            child_ack_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Broadcast channel error: {0}")]
    Channel(String),
    #[error("No answer from the leader within {0:?}")]
    RequestTimeout(Duration),
    #[error("No request handler registered on the leader")]
    NoRequestHandler,
    #[error("Tab has been unloaded")]
    Unloaded,
}

/// Payload of one broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabBody {
    RequestLeadership,
    LeaderExists,
    /// Sent by a resigning leader; `recipient` is the nominee, if any
    LeaderDead { followers: Vec<String> },
    ChildUnload,
    IsChildAlive,
    ChildStillAlive,
    Request {
        correlation_id: String,
        payload: serde_json::Value,
    },
    Response {
        correlation_id: String,
        payload: serde_json::Value,
    },
    /// Application traffic, handed to the message handler untouched
    App(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMessage {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub body: TabBody,
}

impl TabMessage {
    pub fn broadcast(sender: &str, body: TabBody) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: None,
            body,
        }
    }

    pub fn to(sender: &str, recipient: &str, body: TabBody) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: Some(recipient.to_string()),
            body,
        }
    }

    pub fn is_for(&self, id: &str) -> bool {
        self.recipient.as_deref() == Some(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    NoLeader,
    Electing,
    Leader,
    Follower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// We asked for leadership
    Started,
    /// Nobody answered within the election timeout
    ElectionTimedOut,
    /// The current leader answered our request
    LeaderAnswered,
    /// The resigning leader picked us
    Nominated,
    /// The leader resigned without naming a successor
    LeaderLost,
    /// We are unloading
    Resigned,
}

impl CoordinatorState {
    pub fn apply(self, event: ElectionEvent) -> CoordinatorState {
        use CoordinatorState::*;
        use ElectionEvent::*;

        match (self, event) {
            (_, Resigned) => NoLeader,
            (_, Nominated) => Leader,
            (NoLeader | Follower, Started | LeaderLost) => Electing,
            (Electing, ElectionTimedOut) => Leader,
            (NoLeader | Electing, LeaderAnswered) => Follower,
            (state, _) => state,
        }
    }
}
