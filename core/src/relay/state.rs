// Relay session state: in-memory view plus the part preserved across reloads

use super::room::{Room, RoomStatus};
use crate::store::{load_json, store_json, StorageBackend, StorageError, StorageKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Event ids remembered across polls.
pub const SEEN_WINDOW: usize = 1024;

/// Bounded set of recently seen ids; the oldest id is forgotten first.
#[derive(Debug, Clone)]
pub struct SeenWindow {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Returns true if `id` was not in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// What survives a reload, per relay host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreservedState {
    pub sync_token: Option<String>,
    #[serde(default)]
    pub rooms: Vec<Room>,
}

type PreservedStates = BTreeMap<String, PreservedState>;

pub fn load_preserved(
    storage: &dyn StorageBackend,
    host: &str,
) -> Result<Option<PreservedState>, StorageError> {
    let states: Option<PreservedStates> = load_json(storage, &StorageKey::MatrixPreservedState)?;
    Ok(states.and_then(|mut states| states.remove(host)))
}

pub fn save_preserved(
    storage: &dyn StorageBackend,
    host: &str,
    state: PreservedState,
) -> Result<(), StorageError> {
    let mut states: PreservedStates =
        load_json(storage, &StorageKey::MatrixPreservedState)?.unwrap_or_default();
    states.insert(host.to_string(), state);
    store_json(storage, &StorageKey::MatrixPreservedState, &states)
}

/// Live state of one relay connection.
#[derive(Debug)]
pub struct ClientState {
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub sync_token: Option<String>,
    pub is_running: bool,
    pub polling_retries: u32,
    pub txn_no: u64,
    pub rooms: BTreeMap<String, Room>,
    pub seen: SeenWindow,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            access_token: None,
            user_id: None,
            sync_token: None,
            is_running: false,
            polling_retries: 0,
            txn_no: 0,
            rooms: BTreeMap::new(),
            seen: SeenWindow::new(SEEN_WINDOW),
        }
    }
}

impl ClientState {
    pub fn restore(&mut self, preserved: PreservedState) {
        self.sync_token = preserved.sync_token;
        for room in preserved.rooms {
            self.rooms.insert(room.id.clone(), room);
        }
    }

    pub fn preserved(&self) -> PreservedState {
        PreservedState {
            sync_token: self.sync_token.clone(),
            rooms: self.rooms.values().map(Room::without_messages).collect(),
        }
    }

    pub fn rooms_with_status(&self, status: RoomStatus) -> Vec<Room> {
        self.rooms
            .values()
            .filter(|room| room.status == status)
            .cloned()
            .collect()
    }

    /// `m<millis>.<counter>`
    pub fn next_txn_id(&mut self, now_millis: u128) -> String {
        let counter = self.txn_no;
        self.txn_no += 1;
        format!("m{}.{}", now_millis, counter)
    }
}
