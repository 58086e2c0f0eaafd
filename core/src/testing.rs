//! In-process relay network for tests and local demos
//!
//! Every host shares one room space, the way federated servers do. Logins are
//! checked against the signed time-bucket password, membership rules follow
//! the real server (join needs an invite, invite and send need membership),
//! and sync is a genuine long poll.

use crate::crypto::{hex_hash, verify_login_password};
use crate::relay::api::{
    CreateRoomRequest, CreateRoomResponse, EventBatch, InvitedRoomSync, JoinedRoomSync,
    LoginRequest, LoginResponse, MessageContent, RelayApi, RelayConnector, RoomEvent,
    SendResponse, SyncResponse, SyncRooms, EVENT_TYPE_CREATE, EVENT_TYPE_MEMBER,
    EVENT_TYPE_MESSAGE,
};
use crate::relay::RelayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Invite,
    Join,
    Leave,
}

struct LocalRoom {
    /// user id → (membership, position of the membership event)
    members: BTreeMap<String, (Membership, u64)>,
    events: Vec<(u64, RoomEvent)>,
}

#[derive(Default)]
struct WorldState {
    position: u64,
    next_id: u64,
    tokens: HashMap<String, String>,
    rooms: BTreeMap<String, LocalRoom>,
    failing_syncs: HashMap<String, u32>,
    sync_calls: HashMap<String, u64>,
}

impl WorldState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_event(
        &mut self,
        room_id: &str,
        kind: &str,
        sender: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
    ) -> Result<String, RelayError> {
        self.position += 1;
        let position = self.position;
        let event_id = format!("${}", self.next_id());
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RelayError::Forbidden(format!("unknown room {}", room_id)))?;

        room.events.push((
            position,
            RoomEvent {
                event_id: Some(event_id.clone()),
                kind: kind.to_string(),
                sender: sender.to_string(),
                origin_server_ts: Some(now_millis()),
                state_key: state_key.map(str::to_string),
                content,
            },
        ));
        Ok(event_id)
    }

    fn set_membership(
        &mut self,
        room_id: &str,
        user_id: &str,
        membership: Membership,
        sender: &str,
    ) -> Result<(), RelayError> {
        let value = match membership {
            Membership::Invite => "invite",
            Membership::Join => "join",
            Membership::Leave => "leave",
        };
        self.push_event(
            room_id,
            EVENT_TYPE_MEMBER,
            sender,
            Some(user_id),
            json!({ "membership": value }),
        )?;
        let position = self.position;
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members
                .insert(user_id.to_string(), (membership, position));
        }
        Ok(())
    }

    fn membership(&self, room_id: &str, user_id: &str) -> Option<Membership> {
        self.rooms
            .get(room_id)
            .and_then(|room| room.members.get(user_id))
            .map(|(membership, _)| *membership)
    }

    fn user_for(&self, token: &str) -> Result<String, RelayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| RelayError::Server {
                status: 401,
                errcode: "M_UNKNOWN_TOKEN".to_string(),
                message: "unknown access token".to_string(),
            })
    }

    fn collect(&self, user_id: &str, since: u64) -> SyncResponse {
        let mut rooms = SyncRooms::default();

        for (room_id, room) in &self.rooms {
            let Some((membership, joined_at)) = room.members.get(user_id) else {
                continue;
            };
            match membership {
                Membership::Join => {
                    // A fresh join sees the whole history
                    let from = if *joined_at > since { 0 } else { since };
                    let events: Vec<RoomEvent> = room
                        .events
                        .iter()
                        .filter(|(position, _)| *position > from)
                        .map(|(_, event)| event.clone())
                        .collect();
                    if !events.is_empty() {
                        rooms.join.insert(
                            room_id.clone(),
                            JoinedRoomSync {
                                state: EventBatch::default(),
                                timeline: EventBatch { events },
                            },
                        );
                    }
                }
                Membership::Invite if *joined_at > since => {
                    let events = room
                        .events
                        .iter()
                        .filter(|(_, event)| event.kind != EVENT_TYPE_MESSAGE)
                        .map(|(_, event)| event.clone())
                        .collect();
                    rooms.invite.insert(
                        room_id.clone(),
                        InvitedRoomSync {
                            invite_state: EventBatch { events },
                        },
                    );
                }
                _ => {}
            }
        }

        let has_rooms = !rooms.join.is_empty() || !rooms.invite.is_empty();
        SyncResponse {
            next_batch: self.position.to_string(),
            rooms: has_rooms.then_some(rooms),
        }
    }
}

struct World {
    state: Mutex<WorldState>,
    changed: Notify,
}

/// Shared room space behind any number of relay hosts.
#[derive(Clone)]
pub struct LocalRelayNetwork {
    world: Arc<World>,
}

impl Default for LocalRelayNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelayNetwork {
    pub fn new() -> Self {
        Self {
            world: Arc::new(World {
                state: Mutex::new(WorldState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn relay(&self, host: &str) -> LocalRelay {
        LocalRelay {
            host: host.to_string(),
            world: self.world.clone(),
        }
    }

    /// Make the next `count` syncs against `host` fail.
    pub fn fail_next_syncs(&self, host: &str, count: u32) {
        self.world
            .state
            .lock()
            .failing_syncs
            .insert(host.to_string(), count);
        self.world.changed.notify_waiters();
    }

    /// Number of sync requests served for `host`, failed ones included.
    pub fn sync_calls(&self, host: &str) -> u64 {
        self.world
            .state
            .lock()
            .sync_calls
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// Remove a user from a room, as if they had been kicked.
    pub fn kick(&self, room_id: &str, user_id: &str) {
        let mut state = self.world.state.lock();
        if state.membership(room_id, user_id).is_some() {
            let _ = state.set_membership(room_id, user_id, Membership::Leave, user_id);
        }
        drop(state);
        self.world.changed.notify_waiters();
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.world.state.lock().rooms.keys().cloned().collect()
    }

    /// Rooms `user_id` has joined.
    pub fn joined_rooms_of(&self, user_id: &str) -> Vec<String> {
        let state = self.world.state.lock();
        state
            .rooms
            .iter()
            .filter(|(_, room)| {
                matches!(room.members.get(user_id), Some((Membership::Join, _)))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Bodies of all messages ever posted into a room.
    pub fn message_bodies(&self, room_id: &str) -> Vec<String> {
        let state = self.world.state.lock();
        state
            .rooms
            .get(room_id)
            .map(|room| {
                room.events
                    .iter()
                    .filter(|(_, event)| event.kind == EVENT_TYPE_MESSAGE)
                    .filter_map(|(_, event)| {
                        event.content.get("body").and_then(|b| b.as_str()).map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl RelayConnector for LocalRelayNetwork {
    fn connect(&self, host: &str) -> Result<Arc<dyn RelayApi>, RelayError> {
        Ok(Arc::new(self.relay(host)))
    }
}

/// One host of a `LocalRelayNetwork`.
#[derive(Clone)]
pub struct LocalRelay {
    host: String,
    world: Arc<World>,
}

impl LocalRelay {
    pub fn host(&self) -> &str {
        &self.host
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut WorldState) -> Result<T, RelayError>,
    ) -> Result<T, RelayError> {
        let result = f(&mut self.world.state.lock());
        self.world.changed.notify_waiters();
        result
    }
}

#[async_trait]
impl RelayApi for LocalRelay {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, RelayError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let public_key = verify_login_password(&request.password, now)
            .map_err(|e| RelayError::Forbidden(format!("invalid login: {}", e)))?;
        if hex_hash(&public_key) != request.identifier.user {
            return Err(RelayError::Forbidden("user does not match key".to_string()));
        }

        let user_id = format!("@{}:{}", request.identifier.user, self.host);
        let mut state = self.world.state.lock();
        let access_token = format!("token-{}", state.next_id());
        state.tokens.insert(access_token.clone(), user_id.clone());

        Ok(LoginResponse {
            user_id,
            access_token,
            device_id: Some(request.device_id.clone()),
        })
    }

    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse, RelayError> {
        let user_id = {
            let mut state = self.world.state.lock();
            *state.sync_calls.entry(self.host.clone()).or_default() += 1;
            if let Some(remaining) = state.failing_syncs.get_mut(&self.host) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RelayError::Http("connection reset".to_string()));
                }
            }
            state.user_for(access_token)?
        };

        let since_position = match since {
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| RelayError::Decode(format!("bad since token {}", token)))?,
            None => 0,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.world.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let response = self.world.state.lock().collect(&user_id, since_position);
            if since.is_none() || response.rooms.is_some() {
                return Ok(response);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.world.state.lock().collect(&user_id, since_position));
            }
        }
    }

    async fn create_room(
        &self,
        access_token: &str,
        request: &CreateRoomRequest,
    ) -> Result<CreateRoomResponse, RelayError> {
        self.mutate(|state| {
            let creator = state.user_for(access_token)?;
            let room_id = format!("!{}:{}", state.next_id(), self.host);
            state.rooms.insert(
                room_id.clone(),
                LocalRoom {
                    members: BTreeMap::new(),
                    events: Vec::new(),
                },
            );

            state.push_event(
                &room_id,
                EVENT_TYPE_CREATE,
                &creator,
                Some(""),
                json!({ "creator": creator, "room_version": request.room_version }),
            )?;
            state.set_membership(&room_id, &creator, Membership::Join, &creator)?;
            for invitee in &request.invite {
                state.set_membership(&room_id, invitee, Membership::Invite, &creator)?;
            }

            Ok(CreateRoomResponse { room_id })
        })
    }

    async fn invite(
        &self,
        access_token: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), RelayError> {
        self.mutate(|state| {
            let inviter = state.user_for(access_token)?;
            if state.membership(room_id, &inviter) != Some(Membership::Join) {
                return Err(RelayError::Forbidden(format!(
                    "{} is not in room {}",
                    inviter, room_id
                )));
            }
            match state.membership(room_id, user_id) {
                Some(Membership::Join) | Some(Membership::Invite) => Ok(()),
                _ => state.set_membership(room_id, user_id, Membership::Invite, &inviter),
            }
        })
    }

    async fn join(&self, access_token: &str, room_id: &str) -> Result<(), RelayError> {
        self.mutate(|state| {
            let user = state.user_for(access_token)?;
            match state.membership(room_id, &user) {
                Some(Membership::Join) => Ok(()),
                Some(Membership::Invite) => {
                    state.set_membership(room_id, &user, Membership::Join, &user)
                }
                _ => Err(RelayError::Forbidden(format!(
                    "{} was not invited to {}",
                    user, room_id
                ))),
            }
        })
    }

    async fn send_message(
        &self,
        access_token: &str,
        room_id: &str,
        _txn_id: &str,
        content: &MessageContent,
    ) -> Result<SendResponse, RelayError> {
        self.mutate(|state| {
            let sender = state.user_for(access_token)?;
            if state.membership(room_id, &sender) != Some(Membership::Join) {
                return Err(RelayError::Forbidden(format!(
                    "{} is not in room {}",
                    sender, room_id
                )));
            }
            let content = serde_json::to_value(content)
                .map_err(|e| RelayError::Decode(e.to_string()))?;
            let event_id =
                state.push_event(room_id, EVENT_TYPE_MESSAGE, &sender, None, content)?;
            Ok(SendResponse { event_id })
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
