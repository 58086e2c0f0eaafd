//! Relay wire types and the request surface the client needs from a relay node

use super::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const EVENT_TYPE_MESSAGE: &str = "m.room.message";
pub const EVENT_TYPE_MEMBER: &str = "m.room.member";
pub const EVENT_TYPE_CREATE: &str = "m.room.create";
pub const MSGTYPE_TEXT: &str = "m.text";

/// What `RelayClient::start` logs in with.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    /// Local part of the user id (hex hash of the public key)
    pub user: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: UserIdentifier,
    pub password: String,
    pub device_id: String,
}

impl From<&LoginCredentials> for LoginRequest {
    fn from(credentials: &LoginCredentials) -> Self {
        Self {
            kind: "m.login.password".to_string(),
            identifier: UserIdentifier {
                kind: "m.id.user".to_string(),
                user: credentials.user.clone(),
            },
            password: credentials.password.clone(),
            device_id: credentials.device_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// A room event as delivered by sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl RoomEvent {
    pub fn is_create(&self) -> bool {
        self.kind == EVENT_TYPE_CREATE && self.content.get("creator").is_some()
    }

    pub fn is_join(&self) -> bool {
        self.kind == EVENT_TYPE_MEMBER
            && self.content.get("membership").and_then(|m| m.as_str()) == Some("join")
    }

    pub fn is_message(&self) -> bool {
        self.kind == EVENT_TYPE_MESSAGE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub state: EventBatch,
    #[serde(default)]
    pub timeline: EventBatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoomSync {
    #[serde(default)]
    pub invite_state: EventBatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftRoomSync {
    #[serde(default)]
    pub state: EventBatch,
    #[serde(default)]
    pub timeline: EventBatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoomSync>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoomSync>,
    #[serde(default)]
    pub leave: BTreeMap<String, LeftRoomSync>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Option<SyncRooms>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub room_version: String,
    pub invite: Vec<String>,
    pub preset: String,
    pub is_direct: bool,
}

impl CreateRoomRequest {
    /// A direct room between us and `members`.
    pub fn trusted_private(members: &[String]) -> Self {
        Self {
            room_version: "5".to_string(),
            invite: members.to_vec(),
            preset: "trusted_private_chat".to_string(),
            is_direct: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub msgtype: String,
    pub body: String,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub event_id: String,
}

/// Requests against one relay node. Every call after `login` carries the access token.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, RelayError>;

    /// Long poll: returns when new events exist or `timeout` elapses.
    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse, RelayError>;

    async fn create_room(
        &self,
        access_token: &str,
        request: &CreateRoomRequest,
    ) -> Result<CreateRoomResponse, RelayError>;

    async fn invite(&self, access_token: &str, room_id: &str, user_id: &str)
        -> Result<(), RelayError>;

    async fn join(&self, access_token: &str, room_id: &str) -> Result<(), RelayError>;

    async fn send_message(
        &self,
        access_token: &str,
        room_id: &str,
        txn_id: &str,
        content: &MessageContent,
    ) -> Result<SendResponse, RelayError>;
}

/// Opens a `RelayApi` for a relay host name.
pub trait RelayConnector: Send + Sync {
    fn connect(&self, host: &str) -> Result<Arc<dyn RelayApi>, RelayError>;
}
