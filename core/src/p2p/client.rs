//! P2P Communication Client
//!
//! Owns the relay connections of one identity (one per replica host), opens
//! channels with the sealed pairing handshake and exchanges session-encrypted
//! messages with paired peers.

use super::pairing::{
    channel_open_message, channel_open_payload, is_channel_open_for, parse_pairing_response,
    ExtendedPairingResponse, PairingMessageType, PairingRequest, PairingResponse,
    PROTOCOL_VERSION,
};
use super::selection::select_relay_host;
use super::P2pError;
use crate::config::{PairwireConfig, DEFAULT_RELAY_HOST};
use crate::crypto::{
    decrypt_payload, derive_session_keys, encrypt_payload, guid, hash, hex_hash,
    login_password, open_sealed_hex, parse_public_key, recipient_string, seal_hex,
    IdentityKeys,
};
use crate::relay::state::SeenWindow;
use crate::relay::{
    ListenerId, LoginCredentials, MessageEvent, RelayClient, RelayClientConfig, RelayConnector,
    RelayEvent, RelayEventKind, RoomMessage,
};
use crate::store::{load_json, store_json, PeerRecord, StorageBackend, StorageKey};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// A message seen before the first peer listener existed is replayed to it
/// only if it is younger than this.
const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

const JOIN_WAIT_CHECKS: u32 = 200;
/// After this many quick checks, poll once per second.
const JOIN_WAIT_FAST_CHECKS: u32 = 50;

/// Ciphertexts remembered per listener, so replicas deliver once.
const DELIVERED_WINDOW: usize = 256;

pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type ChannelOpenCallback = Arc<dyn Fn(ExtendedPairingResponse) + Send + Sync>;

type Subscriptions = Vec<(RelayClient, ListenerId)>;

/// own relay host → recipient → room id
type PeerRooms = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Default)]
struct InitialCapture {
    latest: Option<MessageEvent>,
    subscriptions: Subscriptions,
}

pub struct P2PCommunicationClient {
    keys: IdentityKeys,
    name: String,
    icon_url: Option<String>,
    app_url: Option<String>,
    relay_hosts: Vec<String>,
    replication_count: usize,
    relay_config: RelayClientConfig,
    storage: Arc<dyn StorageBackend>,
    connector: Arc<dyn RelayConnector>,

    clients: RwLock<Vec<RelayClient>>,
    active_listeners: Mutex<HashMap<String, Subscriptions>>,
    channel_listeners: Mutex<Subscriptions>,
    initial: Arc<Mutex<InitialCapture>>,
    ignored_rooms: Mutex<HashSet<String>>,
    room_locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    room_cache_lock: Mutex<()>,
    opened_channels: Arc<Mutex<SeenWindow>>,
}

impl P2PCommunicationClient {
    pub fn new(
        keys: IdentityKeys,
        config: &PairwireConfig,
        storage: Arc<dyn StorageBackend>,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        let relay_hosts = if config.relay_hosts.is_empty() {
            vec![DEFAULT_RELAY_HOST.to_string()]
        } else {
            config.relay_hosts.clone()
        };
        debug!("P2PCommunicationClient created for {}", short(&keys.public_key_hex()));

        Self {
            keys,
            name: config.name.clone(),
            icon_url: config.icon_url.clone(),
            app_url: config.app_url.clone(),
            relay_hosts,
            replication_count: config.replication_count.max(1),
            relay_config: config.relay.clone(),
            storage,
            connector,
            clients: RwLock::new(Vec::new()),
            active_listeners: Mutex::new(HashMap::new()),
            channel_listeners: Mutex::new(Vec::new()),
            initial: Arc::new(Mutex::new(InitialCapture::default())),
            ignored_rooms: Mutex::new(HashSet::new()),
            room_locks: Mutex::new(HashMap::new()),
            room_cache_lock: Mutex::new(()),
            opened_channels: Arc::new(Mutex::new(SeenWindow::new(DELIVERED_WINDOW))),
        }
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn replication_count(&self) -> usize {
        self.replication_count
    }

    pub fn is_started(&self) -> bool {
        !self.clients.read().is_empty()
    }

    /// Live relay connections, primary first.
    pub fn connections(&self) -> Vec<RelayClient> {
        self.clients.read().clone()
    }

    /// Public keys we currently have a message listener for.
    pub fn listening_to(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.active_listeners.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Our primary relay host. Chosen once by hash distance, then remembered.
    pub fn relay_server(&self) -> Result<String, P2pError> {
        let stored: Option<String> =
            load_json(self.storage.as_ref(), &StorageKey::MatrixSelectedNode)?;
        if let Some(node) = stored.filter(|node| !node.is_empty()) {
            return Ok(node);
        }

        let host = select_relay_host(&self.relay_hosts, &hash(&self.keys.public_key()), 0)
            .ok_or(P2pError::NoRelayHost)?
            .to_string();
        store_json(self.storage.as_ref(), &StorageKey::MatrixSelectedNode, &host)?;
        Ok(host)
    }

    pub fn pairing_request_info(&self) -> Result<PairingRequest, P2pError> {
        Ok(PairingRequest {
            id: guid(),
            kind: PairingMessageType::Request,
            name: self.name.clone(),
            version: Some(PROTOCOL_VERSION.to_string()),
            public_key: self.keys.public_key_hex(),
            relay_server: self.relay_server()?,
            icon: self.icon_url.clone(),
            app_url: self.app_url.clone(),
        })
    }

    pub fn pairing_response_info(
        &self,
        request: &PairingRequest,
    ) -> Result<PairingResponse, P2pError> {
        Ok(PairingResponse {
            id: request.id.clone(),
            kind: PairingMessageType::Response,
            name: self.name.clone(),
            version: PROTOCOL_VERSION.to_string(),
            public_key: self.keys.public_key_hex(),
            relay_server: self.relay_server()?,
            icon: self.icon_url.clone(),
            app_url: self.app_url.clone(),
        })
    }

    /// Log in to every replica host and run their first sync.
    ///
    /// Succeeds if at least one connection comes up. Calling it again while
    /// started is a no-op.
    pub async fn start(&self) -> Result<(), P2pError> {
        if self.is_started() {
            return Ok(());
        }

        let hosts = self.replica_hosts()?;
        let credentials = self.credentials();
        let mut candidates = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let api = self.connector.connect(host)?;
            let client = RelayClient::new(
                host.clone(),
                api,
                self.relay_config.clone(),
                Some(self.storage.clone()),
            );
            self.capture_initial_messages(&client);
            self.join_on_invite(&client);
            candidates.push(client);
        }

        info!(
            "Starting {} relay connection(s) for {}",
            candidates.len(),
            short(&self.keys.public_key_hex())
        );
        let results = join_all(candidates.iter().map(|client| client.start(&credentials))).await;

        let mut started = Vec::new();
        let mut first_error = None;
        for (client, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(()) => started.push(client),
                Err(e) => {
                    warn!("Relay {} did not start: {}", client.host(), e);
                    release(&client);
                    first_error.get_or_insert(e);
                }
            }
        }

        if started.is_empty() {
            return Err(first_error.map(P2pError::from).unwrap_or(P2pError::NoRelayHost));
        }
        *self.clients.write() = started;
        Ok(())
    }

    /// Stop every connection and forget relay session state.
    pub fn stop(&self) {
        let clients = std::mem::take(&mut *self.clients.write());
        if clients.is_empty() {
            return;
        }

        for client in &clients {
            release(client);
        }
        self.active_listeners.lock().clear();
        self.channel_listeners.lock().clear();
        *self.initial.lock() = InitialCapture::default();
        self.ignored_rooms.lock().clear();

        for key in [
            StorageKey::MatrixPeerRoomIds,
            StorageKey::MatrixPreservedState,
            StorageKey::MatrixSelectedNode,
        ] {
            if let Err(e) = self.storage.delete(key.as_str()) {
                warn!("Could not clear {}: {}", key, e);
            }
        }
        info!("P2P client stopped");
    }

    /// Deliver decrypted messages from `sender_public_key` to `callback`.
    ///
    /// At most one listener per sender; later calls are no-ops. The first
    /// listener also receives the latest message seen since start, if recent.
    pub async fn listen_for_encrypted_message(
        &self,
        sender_public_key: &str,
        callback: MessageCallback,
    ) -> Result<(), P2pError> {
        let clients = self.connected_clients()?;
        if self.active_listeners.lock().contains_key(sender_public_key) {
            return Ok(());
        }

        let peer_key = parse_public_key(sender_public_key)?;
        let session = derive_session_keys(&self.keys.signing_key, &peer_key)?;
        let receive_key = Zeroizing::new(session.receive_key);
        let sender_prefix = format!("@{}", hex_hash(&peer_key));
        let delivered = Mutex::new(SeenWindow::new(DELIVERED_WINDOW));

        let handler: Arc<dyn Fn(&MessageEvent) + Send + Sync> =
            Arc::new(move |event: &MessageEvent| {
                let message = &event.message;
                if !message.is_text() || !message.sender.starts_with(&sender_prefix) {
                    return;
                }
                // Anything that does not open with our key was not meant for us
                if let Ok(plaintext) = decrypt_payload(&message.body, &receive_key) {
                    if delivered.lock().insert(&message.body) {
                        callback(plaintext);
                    }
                }
            });

        let subscriptions: Subscriptions = clients
            .iter()
            .map(|client| {
                let handler = handler.clone();
                let id = client.subscribe(
                    RelayEventKind::Message,
                    Arc::new(move |event| {
                        if let RelayEvent::Message(message) = event {
                            handler(message);
                        }
                    }),
                );
                (client.clone(), id)
            })
            .collect();
        self.active_listeners
            .lock()
            .insert(sender_public_key.to_string(), subscriptions);
        debug!("Listening for messages from {}", short(sender_public_key));

        let capture = std::mem::take(&mut *self.initial.lock());
        for (client, id) in capture.subscriptions {
            client.unsubscribe(id);
        }
        match capture.latest {
            Some(event) if is_recent(event.timestamp) => {
                debug!("Replaying message received before listener registration");
                handler(&event);
            }
            _ => debug!("No previous message to replay"),
        }

        Ok(())
    }

    pub fn unsubscribe_from_encrypted_message(
        &self,
        sender_public_key: &str,
    ) -> Result<(), P2pError> {
        self.connected_clients()?;
        if let Some(subscriptions) = self.active_listeners.lock().remove(sender_public_key) {
            for (client, id) in subscriptions {
                client.unsubscribe(id);
            }
        }
        Ok(())
    }

    pub fn unsubscribe_from_encrypted_messages(&self) -> Result<(), P2pError> {
        self.connected_clients()?;
        let listeners = std::mem::take(&mut *self.active_listeners.lock());
        for (client, id) in listeners.into_values().flatten() {
            client.unsubscribe(id);
        }
        Ok(())
    }

    /// Encrypt `message` for `peer` and post it on every connection.
    ///
    /// Succeeds if at least one replica accepted it.
    pub async fn send_message(&self, message: &str, peer: &PeerRecord) -> Result<(), P2pError> {
        let clients = self.connected_clients()?;
        let peer_key = parse_public_key(&peer.public_key)?;
        let session = derive_session_keys(&self.keys.signing_key, &peer_key)?;
        let ciphertext = encrypt_payload(message, &session.transmit_key)?;
        let recipients = self.recipients_for(&peer_key, &peer.relay_server);

        self.deliver(&clients, &recipients, |_| ciphertext.clone(), false)
            .await
    }

    /// Answer an out-of-band pairing request with a sealed channel-open
    /// message in the room shared with the requester.
    pub async fn send_pairing_response(&self, request: &PairingRequest) -> Result<(), P2pError> {
        let clients = self.connected_clients()?;
        let peer_key = parse_public_key(&request.public_key)?;

        let plaintext = match request.version {
            None => self.keys.public_key_hex(),
            Some(_) => serde_json::to_string(&self.pairing_response_info(request)?)
                .map_err(|e| P2pError::InvalidPairing(e.to_string()))?,
        };
        let sealed = seal_hex(&plaintext, &peer_key)?;
        let recipients = self.recipients_for(&peer_key, &request.relay_server);

        info!("Sending pairing response to {}", short(&request.public_key));
        self.deliver(
            &clients,
            &recipients,
            |recipient| channel_open_message(recipient, &sealed),
            true,
        )
        .await
    }

    /// Hand every pairing response addressed to us to `callback`.
    pub fn listen_for_channel_opening(&self, callback: ChannelOpenCallback) -> Result<(), P2pError> {
        let clients = self.connected_clients()?;
        let own_hash = self.keys.public_key_hash();
        let default_relay = self.relay_server()?;

        let mut subscriptions = Vec::with_capacity(clients.len());
        for client in &clients {
            let own_hash = own_hash.clone();
            let default_relay = default_relay.clone();
            let signing_key = self.keys.signing_key.clone();
            let opened = self.opened_channels.clone();
            let callback = callback.clone();

            let id = client.subscribe(
                RelayEventKind::Message,
                Arc::new(move |event| {
                    let RelayEvent::Message(event) = event else {
                        return;
                    };
                    if !event.message.is_text() {
                        return;
                    }
                    let Some(payload) = channel_open_payload(&event.message.body, &own_hash)
                    else {
                        return;
                    };
                    let Ok(plaintext) = open_sealed_hex(payload, &signing_key) else {
                        return;
                    };

                    match parse_pairing_response(&plaintext, &default_relay)
                        .and_then(ExtendedPairingResponse::new)
                    {
                        Ok(response) => {
                            if opened.lock().insert(payload) {
                                info!(
                                    "Channel opened by {} ({})",
                                    response.response.name,
                                    short(&response.response.public_key)
                                );
                                callback(response);
                            }
                        }
                        Err(e) => debug!("Ignoring undecodable pairing response: {}", e),
                    }
                }),
            );
            subscriptions.push((client.clone(), id));
        }

        self.channel_listeners.lock().extend(subscriptions);
        debug!("Listening for channel openings");
        Ok(())
    }

    pub fn is_channel_open_message(&self, body: &str) -> bool {
        is_channel_open_for(body, &self.keys.public_key_hash())
    }

    pub fn is_sender(&self, message: &RoomMessage, sender_public_key: &str) -> Result<bool, P2pError> {
        let key = parse_public_key(sender_public_key)?;
        Ok(message.sender.starts_with(&format!("@{}", hex_hash(&key))))
    }

    fn connected_clients(&self) -> Result<Vec<RelayClient>, P2pError> {
        let clients = self.clients.read().clone();
        if clients.is_empty() {
            return Err(P2pError::NotStarted);
        }
        Ok(clients)
    }

    fn credentials(&self) -> LoginCredentials {
        LoginCredentials {
            user: self.keys.public_key_hash(),
            password: login_password(&self.keys, now().as_secs()),
            device_id: self.keys.public_key_hex(),
        }
    }

    fn replica_hosts(&self) -> Result<Vec<String>, P2pError> {
        let id_hash = hash(&self.keys.public_key());
        let mut hosts = vec![self.relay_server()?];
        for index in 1..self.replication_count {
            if let Some(host) = select_relay_host(&self.relay_hosts, &id_hash, index) {
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.to_string());
                }
            }
        }
        Ok(hosts)
    }

    /// Relay user ids of a peer: its announced host, then its other replicas.
    fn recipients_for(&self, peer_key: &[u8; 32], relay_server: &str) -> Vec<String> {
        let peer_hash = hash(peer_key);
        let mut hosts = vec![relay_server.to_string()];
        for index in 1..self.replication_count {
            if let Some(host) = select_relay_host(&self.relay_hosts, &peer_hash, index) {
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.to_string());
                }
            }
        }
        let peer_hash = hex::encode(peer_hash);
        hosts
            .iter()
            .map(|host| recipient_string(&peer_hash, host))
            .collect()
    }

    fn capture_initial_messages(&self, client: &RelayClient) {
        let initial = self.initial.clone();
        let id = client.subscribe(
            RelayEventKind::Message,
            Arc::new(move |event| {
                let RelayEvent::Message(message) = event else {
                    return;
                };
                let mut capture = initial.lock();
                let newer = match (
                    capture.latest.as_ref().and_then(|latest| latest.timestamp),
                    message.timestamp,
                ) {
                    (Some(latest), Some(timestamp)) => latest < timestamp,
                    _ => true,
                };
                if newer {
                    capture.latest = Some(message.clone());
                }
            }),
        );
        self.initial.lock().subscriptions.push((client.clone(), id));
    }

    fn join_on_invite(&self, client: &RelayClient) {
        let joiner = client.clone();
        let retries = self.relay_config.join_retries;
        let interval = self.relay_config.join_retry_interval;
        client.subscribe(
            RelayEventKind::Invite,
            Arc::new(move |event| {
                if let RelayEvent::Invite(invite) = event {
                    tokio::spawn(try_join(
                        joiner.clone(),
                        invite.room_id.clone(),
                        retries,
                        interval,
                    ));
                }
            }),
        );
    }

    /// Post one body per (connection, recipient); at least one must succeed.
    async fn deliver(
        &self,
        clients: &[RelayClient],
        recipients: &[String],
        body_for: impl Fn(&str) -> String,
        wait_for_join: bool,
    ) -> Result<(), P2pError> {
        let mut sends = Vec::with_capacity(clients.len() * recipients.len());
        for client in clients {
            for recipient in recipients {
                let body = body_for(recipient);
                sends.push(async move {
                    self.send_to(client, recipient, &body, wait_for_join).await
                });
            }
        }
        let results = join_all(sends).await;

        let mut delivered = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Replica send failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (delivered, first_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn send_to(
        &self,
        client: &RelayClient,
        recipient: &str,
        body: &str,
        wait_for_join: bool,
    ) -> Result<(), P2pError> {
        let room_id = self.relevant_room(client, recipient).await?;
        if wait_for_join {
            self.wait_for_join(client, &room_id).await?;
        }

        match client.send_text_message(&room_id, body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_forbidden() => {
                warn!("Room {} refused the message, retrying in a new room", room_id);
                self.forget_room(client.host(), &room_id)?;
                let room_id = self.relevant_room(client, recipient).await?;
                client.send_text_message(&room_id, body).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the counterpart has joined. A room we know nothing about
    /// yet (no members) does not block.
    async fn wait_for_join(&self, client: &RelayClient, room_id: &str) -> Result<(), P2pError> {
        for check in 0..=JOIN_WAIT_CHECKS {
            let members = client.get_room_by_id(room_id).members.len();
            if members >= 2 || members == 0 {
                return Ok(());
            }

            debug!("Waiting for join in {} ({} member), check {}", room_id, members, check);
            let delay = if check > JOIN_WAIT_FAST_CHECKS {
                Duration::from_secs(1)
            } else {
                Duration::from_millis(100)
            };
            tokio::time::sleep(delay).await;
        }

        Err(P2pError::JoinTimeout {
            room_id: room_id.to_string(),
            attempts: JOIN_WAIT_CHECKS + 1,
        })
    }

    /// The room shared with `recipient` on `client`'s host, created on demand.
    async fn relevant_room(&self, client: &RelayClient, recipient: &str) -> Result<String, P2pError> {
        let lock = self
            .room_locks
            .lock()
            .entry((client.host().to_string(), recipient.to_string()))
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(room_id) = self.cached_room(client.host(), recipient)? {
            debug!("Using cached room {} for {}", room_id, recipient);
            return Ok(room_id);
        }

        let ignored = self.ignored_rooms.lock().clone();
        let existing = client
            .joined_rooms()
            .into_iter()
            .filter(|room| !ignored.contains(&room.id))
            .find(|room| room.members.iter().any(|member| member == recipient));

        // Once a room was refused, local sync state is stale: always start fresh
        let room_id = match existing {
            Some(room) if ignored.is_empty() => {
                debug!("Reusing joined room {} for {}", room.id, recipient);
                room.id
            }
            _ => {
                info!("No usable room for {}, creating one", recipient);
                client
                    .create_trusted_private_room(&[recipient.to_string()])
                    .await?
            }
        };

        self.cache_room(client.host(), recipient, &room_id)?;
        Ok(room_id)
    }

    fn cached_room(&self, host: &str, recipient: &str) -> Result<Option<String>, P2pError> {
        let rooms: PeerRooms =
            load_json(self.storage.as_ref(), &StorageKey::MatrixPeerRoomIds)?.unwrap_or_default();
        Ok(rooms.get(host).and_then(|rooms| rooms.get(recipient)).cloned())
    }

    fn cache_room(&self, host: &str, recipient: &str, room_id: &str) -> Result<(), P2pError> {
        let _guard = self.room_cache_lock.lock();
        let mut rooms: PeerRooms =
            load_json(self.storage.as_ref(), &StorageKey::MatrixPeerRoomIds)?.unwrap_or_default();
        rooms
            .entry(host.to_string())
            .or_default()
            .insert(recipient.to_string(), room_id.to_string());
        store_json(self.storage.as_ref(), &StorageKey::MatrixPeerRoomIds, &rooms)?;
        Ok(())
    }

    fn forget_room(&self, host: &str, room_id: &str) -> Result<(), P2pError> {
        {
            let _guard = self.room_cache_lock.lock();
            let mut rooms: PeerRooms = load_json(self.storage.as_ref(), &StorageKey::MatrixPeerRoomIds)?
                .unwrap_or_default();
            if let Some(rooms) = rooms.get_mut(host) {
                rooms.retain(|_, id| id != room_id);
            }
            store_json(self.storage.as_ref(), &StorageKey::MatrixPeerRoomIds, &rooms)?;
        }
        self.ignored_rooms.lock().insert(room_id.to_string());
        Ok(())
    }
}

impl Drop for P2PCommunicationClient {
    fn drop(&mut self) {
        for client in self.clients.get_mut().iter() {
            release(client);
        }
    }
}

/// Join after an invite. Federated servers may refuse a join that arrives
/// right after the invite, so forbidden answers are retried.
async fn try_join(client: RelayClient, room_id: String, retries: u32, interval: Duration) {
    for attempt in 1..=retries.max(1) {
        match client.join_rooms(std::slice::from_ref(&room_id)).await {
            Ok(()) => {
                info!("Joined room {}", room_id);
                return;
            }
            Err(e) if e.is_forbidden() && attempt < retries => {
                debug!("Join of {} refused, retrying ({}/{})", room_id, attempt, retries);
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                warn!("Failed to join {} after {} tries: {}", room_id, attempt, e);
                return;
            }
        }
    }
}

/// Drop our listeners (they hold clones of the client) and stop it.
fn release(client: &RelayClient) {
    client.unsubscribe_all(RelayEventKind::Message);
    client.unsubscribe_all(RelayEventKind::Invite);
    client.stop();
}

fn is_recent(timestamp: Option<u64>) -> bool {
    let Some(timestamp) = timestamp else {
        return false;
    };
    (now().as_millis() as u64).saturating_sub(timestamp) < REPLAY_WINDOW.as_millis() as u64
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
