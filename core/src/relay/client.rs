//! Relay Client: login, long-poll sync loop, rooms, send

use super::api::{
    CreateRoomRequest, LoginCredentials, LoginRequest, MessageContent, RelayApi,
};
use super::events::{
    EventEmitter, InviteEvent, ListenerId, MessageEvent, RelayEvent, RelayEventKind,
    RelayListener,
};
use super::room::{Room, RoomStatus};
use super::state::{load_preserved, save_preserved, ClientState};
use super::RelayError;
use crate::store::StorageBackend;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages kept per room in memory; older ones are dropped first.
const MAX_ROOM_MESSAGES: usize = 100;

/// Relay client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// Server-side long-poll timeout for one sync
    #[serde(with = "crate::config::duration_ms")]
    pub poll_timeout: Duration,
    /// Consecutive sync failures tolerated before the session is dead
    pub retry_budget: u32,
    /// Pause between failed syncs
    #[serde(with = "crate::config::duration_ms")]
    pub retry_interval: Duration,
    /// Join attempts after an invite when the server answers forbidden
    pub join_retries: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub join_retry_interval: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            retry_budget: 3,
            retry_interval: Duration::from_secs(5),
            join_retries: 10,
            join_retry_interval: Duration::from_millis(200),
        }
    }
}

/// Called once when the sync loop gives up.
pub type FailureCallback = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// One authenticated connection to one relay host.
///
/// Cloning is cheap; clones share the connection. The sync loop runs on the
/// tokio runtime until `stop` or until its retry budget is exhausted.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    api: Arc<dyn RelayApi>,
    config: RelayClientConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    state: Mutex<ClientState>,
    emitter: EventEmitter,
    active: AtomicBool,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    on_failure: RwLock<Option<FailureCallback>>,
}

impl RelayClient {
    pub fn new(
        host: impl Into<String>,
        api: Arc<dyn RelayApi>,
        config: RelayClientConfig,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                api,
                config,
                storage,
                state: Mutex::new(ClientState::default()),
                emitter: EventEmitter::new(),
                active: AtomicBool::new(false),
                sync_task: Mutex::new(None),
                on_failure: RwLock::new(None),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.inner.config
    }

    /// Full user id assigned by the server at login.
    pub fn user_id(&self) -> Option<String> {
        self.inner.state.lock().user_id.clone()
    }

    /// True once a sync has succeeded and the loop is alive.
    pub fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst) && self.inner.state.lock().is_running
    }

    pub fn on_failure(&self, callback: FailureCallback) {
        *self.inner.on_failure.write() = Some(callback);
    }

    /// Log in, restore preserved state and run the first sync.
    ///
    /// Resolves when the first sync succeeds; fails if login fails or the
    /// first sync exhausts the retry budget. Calling it on a running client
    /// is a no-op.
    pub async fn start(&self, credentials: &LoginCredentials) -> Result<(), RelayError> {
        if self.inner.sync_task.lock().is_some() && self.inner.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("Logging in to {} as {}", self.inner.host, credentials.user);
        let response = self
            .inner
            .api
            .login(&LoginRequest::from(credentials))
            .await?;

        {
            let mut state = self.inner.state.lock();
            state.access_token = Some(response.access_token);
            state.user_id = Some(response.user_id);
            if let Some(storage) = &self.inner.storage {
                match load_preserved(storage.as_ref(), &self.inner.host) {
                    Ok(Some(preserved)) => {
                        debug!("Restoring preserved relay state for {}", self.inner.host);
                        state.restore(preserved);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring unreadable preserved relay state: {}", e),
                }
            }
        }
        self.inner.active.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(sync_loop(self.inner.clone(), ready_tx));
        if let Some(previous) = self.inner.sync_task.lock().replace(handle) {
            previous.abort();
        }

        ready_rx.await.map_err(|_| RelayError::Stopped)?
    }

    /// End the sync loop. Later operations fail with `Stopped`.
    pub fn stop(&self) {
        info!("Relay client for {} stopped", self.inner.host);
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.state.lock().is_running = false;
        if let Some(task) = self.inner.sync_task.lock().take() {
            task.abort();
        }
    }

    pub fn subscribe(&self, kind: RelayEventKind, listener: RelayListener) -> ListenerId {
        self.inner.emitter.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.emitter.unsubscribe(id)
    }

    pub fn unsubscribe_all(&self, kind: RelayEventKind) {
        self.inner.emitter.unsubscribe_all(kind)
    }

    /// Room snapshot from local state; an unknown id yields an empty `Unknown` room.
    pub fn get_room_by_id(&self, room_id: &str) -> Room {
        self.inner
            .state
            .lock()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| Room::unknown(room_id))
    }

    pub fn joined_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().rooms_with_status(RoomStatus::Joined)
    }

    pub fn invited_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().rooms_with_status(RoomStatus::Invited)
    }

    pub fn left_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().rooms_with_status(RoomStatus::Left)
    }

    /// Create a direct private room with `members` invited. Returns the room id.
    pub async fn create_trusted_private_room(
        &self,
        members: &[String],
    ) -> Result<String, RelayError> {
        let token = self.inner.access_token("createRoom")?;
        let response = self
            .inner
            .api
            .create_room(&token, &CreateRoomRequest::trusted_private(members))
            .await?;
        info!("Created room {} for {:?}", response.room_id, members);
        Ok(response.room_id)
    }

    pub async fn invite_to_rooms(&self, user: &str, room_ids: &[String]) -> Result<(), RelayError> {
        let token = self.inner.access_token("invite")?;
        try_join_all(
            room_ids
                .iter()
                .map(|room_id| self.inner.api.invite(&token, room_id, user)),
        )
        .await?;
        debug!("Invited {} to {} room(s)", user, room_ids.len());
        Ok(())
    }

    /// Join rooms; joining a room we are already in succeeds.
    pub async fn join_rooms(&self, room_ids: &[String]) -> Result<(), RelayError> {
        let token = self.inner.access_token("join")?;
        try_join_all(room_ids.iter().map(|room_id| self.inner.api.join(&token, room_id))).await?;
        debug!("Joined {} room(s)", room_ids.len());
        Ok(())
    }

    /// Post a text message. Returns the event id.
    pub async fn send_text_message(&self, room_id: &str, body: &str) -> Result<String, RelayError> {
        let token = self.inner.access_token("send")?;
        let txn_id = self.inner.state.lock().next_txn_id(now_millis());
        let response = self
            .inner
            .api
            .send_message(&token, room_id, &txn_id, &MessageContent::text(body))
            .await?;
        debug!("Sent {} to {}", response.event_id, room_id);
        Ok(response.event_id)
    }
}

impl Inner {
    fn access_token(&self, operation: &str) -> Result<String, RelayError> {
        let token = self
            .state
            .lock()
            .access_token
            .clone()
            .ok_or_else(|| RelayError::NotAuthorized(operation.to_string()))?;
        if !self.active.load(Ordering::SeqCst) {
            return Err(RelayError::Stopped);
        }
        Ok(token)
    }

    async fn sync_once(&self) -> Result<(), RelayError> {
        let token = self.access_token("sync")?;
        let since = self.state.lock().sync_token.clone();

        let response = self
            .api
            .sync(&token, since.as_deref(), self.config.poll_timeout)
            .await?;
        if !self.active.load(Ordering::SeqCst) {
            return Err(RelayError::Stopped);
        }

        let events = self.apply_sync(response);
        self.persist();

        for event in &events {
            self.emitter.emit(event);
        }
        Ok(())
    }

    /// Fold one sync response into state; returns the events to dispatch.
    fn apply_sync(&self, response: super::api::SyncResponse) -> Vec<RelayEvent> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.sync_token = Some(response.next_batch);
        state.is_running = true;
        state.polling_retries = 0;

        let Some(rooms) = response.rooms else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for mut room in Room::from_sync(&rooms) {
            let seen = &mut state.seen;
            room.messages.retain(|message| match &message.event_id {
                Some(id) => seen.insert(id),
                None => true,
            });

            if room.status == RoomStatus::Invited {
                events.push(RelayEvent::Invite(InviteEvent {
                    room_id: room.id.clone(),
                    members: room.members.clone(),
                }));
            }
            for message in &room.messages {
                events.push(RelayEvent::Message(MessageEvent {
                    room_id: room.id.clone(),
                    message: message.clone(),
                    timestamp: message.timestamp,
                }));
            }

            let room_id = room.id.clone();
            let mut merged = Room::merge(room, state.rooms.get(&room_id));
            if merged.messages.len() > MAX_ROOM_MESSAGES {
                let excess = merged.messages.len() - MAX_ROOM_MESSAGES;
                merged.messages.drain(..excess);
            }
            state.rooms.insert(merged.id.clone(), merged);
        }
        events
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let preserved = self.state.lock().preserved();
        if let Err(e) = save_preserved(storage.as_ref(), &self.host, preserved) {
            warn!("Could not persist relay state: {}", e);
        }
    }

    fn fail(&self, error: &RelayError) {
        self.active.store(false, Ordering::SeqCst);
        self.state.lock().is_running = false;
        let callback = self.on_failure.read().clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

async fn sync_loop(inner: Arc<Inner>, ready: oneshot::Sender<Result<(), RelayError>>) {
    let mut ready = Some(ready);
    let mut failures: u32 = 0;

    while inner.active.load(Ordering::SeqCst) {
        match inner.sync_once().await {
            Ok(()) => {
                failures = 0;
                if let Some(ready) = ready.take() {
                    info!("First sync with {} complete", inner.host);
                    let _ = ready.send(Ok(()));
                }
            }
            Err(RelayError::Stopped) => break,
            Err(e) => {
                failures += 1;
                {
                    let mut state = inner.state.lock();
                    state.polling_retries = failures;
                    state.is_running = false;
                }

                if failures > inner.config.retry_budget {
                    error!(
                        "Sync with {} failed {} times, giving up: {}",
                        inner.host, failures, e
                    );
                    let fatal = RelayError::SyncFailed { attempts: failures };
                    match ready.take() {
                        Some(ready) => {
                            inner.active.store(false, Ordering::SeqCst);
                            let _ = ready.send(Err(fatal));
                        }
                        None => inner.fail(&fatal),
                    }
                    break;
                }

                warn!(
                    "Sync with {} failed ({}/{}), retrying in {:?}: {}",
                    inner.host, failures, inner.config.retry_budget, inner.config.retry_interval, e
                );
                tokio::time::sleep(inner.config.retry_interval).await;
            }
        }
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
