// Room snapshots built from sync responses

use super::api::{RoomEvent, SyncRooms, MSGTYPE_TEXT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Unknown,
    Joined,
    Invited,
    Left,
}

/// A message event reduced to what the pairing layer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub event_id: Option<String>,
    pub sender: String,
    pub msgtype: String,
    pub body: String,
    /// Server timestamp, unix millis
    pub timestamp: Option<u64>,
}

impl RoomMessage {
    fn from_event(event: &RoomEvent) -> Option<Self> {
        let body = event.content.get("body")?.as_str()?;
        let msgtype = event
            .content
            .get("msgtype")
            .and_then(|m| m.as_str())
            .unwrap_or_default();

        Some(Self {
            event_id: event.event_id.clone(),
            sender: event.sender.clone(),
            msgtype: msgtype.to_string(),
            body: body.to_string(),
            timestamp: event.origin_server_ts,
        })
    }

    pub fn is_text(&self) -> bool {
        self.msgtype == MSGTYPE_TEXT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub status: RoomStatus,
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<RoomMessage>,
}

impl Room {
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: RoomStatus::Unknown,
            members: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Rooms of one sync response: joined, then invited, then left.
    pub fn from_sync(rooms: &SyncRooms) -> Vec<Room> {
        let joined = rooms.join.iter().map(|(id, joined)| {
            let events: Vec<&RoomEvent> = joined
                .state
                .events
                .iter()
                .chain(joined.timeline.events.iter())
                .collect();
            Room::from_events(id, RoomStatus::Joined, &events)
        });

        let invited = rooms.invite.iter().map(|(id, invited)| {
            let events: Vec<&RoomEvent> = invited.invite_state.events.iter().collect();
            let mut room = Room::from_events(id, RoomStatus::Invited, &events);
            room.messages.clear();
            room
        });

        let left = rooms.leave.iter().map(|(id, left)| {
            let events: Vec<&RoomEvent> = left
                .state
                .events
                .iter()
                .chain(left.timeline.events.iter())
                .collect();
            Room::from_events(id, RoomStatus::Left, &events)
        });

        joined.chain(invited).chain(left).collect()
    }

    fn from_events(id: &str, status: RoomStatus, events: &[&RoomEvent]) -> Room {
        let events = unique_events(events);

        let mut members: Vec<String> = Vec::new();
        for event in events.iter().filter(|e| e.is_create() || e.is_join()) {
            if !members.contains(&event.sender) {
                members.push(event.sender.clone());
            }
        }

        let messages = events
            .iter()
            .filter(|e| e.is_message())
            .filter_map(|e| RoomMessage::from_event(e))
            .collect();

        Room {
            id: id.to_string(),
            status,
            members,
            messages,
        }
    }

    /// Fold a fresh snapshot into the previous one: members are unioned,
    /// messages appended, status taken from the fresh snapshot.
    pub fn merge(new_state: Room, previous: Option<&Room>) -> Room {
        let Some(previous) = previous.filter(|p| p.id == new_state.id) else {
            return new_state;
        };

        let mut members = previous.members.clone();
        for member in new_state.members {
            if !members.contains(&member) {
                members.push(member);
            }
        }

        let mut messages = previous.messages.clone();
        messages.extend(new_state.messages);

        Room {
            id: new_state.id,
            status: new_state.status,
            members,
            messages,
        }
    }

    /// Copy without message history, for persistence.
    pub fn without_messages(&self) -> Room {
        Room {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

/// First occurrence of each event id wins; events without an id are all kept.
fn unique_events<'a>(events: &[&'a RoomEvent]) -> Vec<&'a RoomEvent> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter(|event| match &event.event_id {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::api::{EventBatch, InvitedRoomSync, JoinedRoomSync};
    use serde_json::json;

    fn event(id: &str, kind: &str, sender: &str, content: serde_json::Value) -> RoomEvent {
        RoomEvent {
            event_id: Some(id.to_string()),
            kind: kind.to_string(),
            sender: sender.to_string(),
            origin_server_ts: Some(1),
            state_key: None,
            content,
        }
    }

    fn text(id: &str, sender: &str, body: &str) -> RoomEvent {
        event(id, "m.room.message", sender, json!({"msgtype": "m.text", "body": body}))
    }

    #[test]
    fn test_joined_room_members_and_messages() {
        let mut rooms = SyncRooms::default();
        rooms.join.insert(
            "!r".to_string(),
            JoinedRoomSync {
                state: EventBatch {
                    events: vec![
                        event("$1", "m.room.create", "@a", json!({"creator": "@a"})),
                        event("$2", "m.room.member", "@a", json!({"membership": "join"})),
                        event("$3", "m.room.member", "@a", json!({"membership": "invite"})),
                    ],
                },
                timeline: EventBatch {
                    events: vec![
                        event("$4", "m.room.member", "@b", json!({"membership": "join"})),
                        text("$5", "@b", "hi"),
                    ],
                },
            },
        );

        let parsed = Room::from_sync(&rooms);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].status, RoomStatus::Joined);
        assert_eq!(parsed[0].members, vec!["@a".to_string(), "@b".to_string()]);
        assert_eq!(parsed[0].messages.len(), 1);
        assert!(parsed[0].messages[0].is_text());
    }

    #[test]
    fn test_duplicate_event_ids_yield_one_message() {
        let mut rooms = SyncRooms::default();
        rooms.join.insert(
            "!r".to_string(),
            JoinedRoomSync {
                state: EventBatch {
                    events: vec![text("$dup", "@a", "once")],
                },
                timeline: EventBatch {
                    events: vec![text("$dup", "@a", "once"), text("$other", "@a", "twice")],
                },
            },
        );

        let parsed = Room::from_sync(&rooms);
        let bodies: Vec<&str> = parsed[0].messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["once", "twice"]);
    }

    #[test]
    fn test_invited_room() {
        let mut rooms = SyncRooms::default();
        rooms.invite.insert(
            "!i".to_string(),
            InvitedRoomSync {
                invite_state: EventBatch {
                    events: vec![event("$1", "m.room.create", "@a", json!({"creator": "@a"}))],
                },
            },
        );

        let parsed = Room::from_sync(&rooms);
        assert_eq!(parsed[0].status, RoomStatus::Invited);
        assert_eq!(parsed[0].members, vec!["@a".to_string()]);
    }

    #[test]
    fn test_merge_unions_members_and_appends_messages() {
        let previous = Room {
            id: "!r".to_string(),
            status: RoomStatus::Invited,
            members: vec!["@a".to_string()],
            messages: vec![],
        };
        let fresh = Room {
            id: "!r".to_string(),
            status: RoomStatus::Joined,
            members: vec!["@a".to_string(), "@b".to_string()],
            messages: vec![RoomMessage::from_event(&text("$1", "@a", "x")).unwrap()],
        };

        let merged = Room::merge(fresh, Some(&previous));
        assert_eq!(merged.status, RoomStatus::Joined);
        assert_eq!(merged.members.len(), 2);
        assert_eq!(merged.messages.len(), 1);
    }

    #[test]
    fn test_merge_ignores_other_room() {
        let other = Room::unknown("!other");
        let fresh = Room::unknown("!r");

        assert_eq!(Room::merge(fresh.clone(), Some(&other)), fresh);
    }
}
