//! Post-message transport
//!
//! A page and a browser extension share one window. Everything posted on the
//! window reaches every endpoint, so each message names its target side and,
//! optionally, a target endpoint id. The page is the dApp side.

use super::abstraction::{
    ConnectionContext, ListenerRegistry, NewPeerCallback, Origin, PairingRole, StatusCell,
    Transport, TransportError, TransportKind, TransportListener, TransportListenerId,
    TransportStatus,
};
use crate::config::PairwireConfig;
use crate::crypto::{
    decrypt_payload, derive_session_keys, encrypt_payload, guid, open_sealed_hex,
    parse_public_key, seal_hex, sender_id, IdentityKeys,
};
use crate::p2p::PROTOCOL_VERSION;
use crate::relay::state::SeenWindow;
use crate::store::{PeerManager, PeerRecord, StorageBackend, StorageKey};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const OPENED_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    #[serde(rename = "toPage")]
    Page,
    #[serde(rename = "toExtension")]
    Extension,
}

/// Identity of something posting on the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostMessagePairingType {
    #[serde(rename = "postmessage-pairing-request")]
    Request,
    #[serde(rename = "postmessage-pairing-response")]
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessagePairingRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PostMessagePairingType,
    pub name: String,
    pub public_key: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

impl PostMessagePairingRequest {
    /// `page_id` is the endpoint the request came from; replies go there.
    pub fn to_peer_record(&self, page_id: &str) -> Result<PeerRecord, TransportError> {
        let public_key = parse_public_key(&self.public_key)?;
        Ok(PeerRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            relay_server: String::new(),
            version: self.version.clone(),
            sender_id: sender_id(&public_key),
            transport_target_id: Some(page_id.to_string()),
            icon: self.icon.clone(),
            app_url: self.app_url.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessagePairingResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PostMessagePairingType,
    pub name: String,
    pub public_key: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WindowPayload {
    Ping,
    Pong,
    PairingRequest(PostMessagePairingRequest),
    /// Hex sealed box holding a `PostMessagePairingResponse`
    ChannelOpen(String),
    /// Hex secret box under the session key
    Encrypted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowMessage {
    pub target: MessageTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub sender: Endpoint,
    pub payload: WindowPayload,
}

/// In-process stand-in for the shared window.
#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<WindowMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn post(&self, message: WindowMessage) {
        // Nobody listening is not an error on a window
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(64)
    }
}

fn ping(from: &Endpoint) -> WindowMessage {
    WindowMessage {
        target: MessageTarget::Extension,
        target_id: None,
        sender: from.clone(),
        payload: WindowPayload::Ping,
    }
}

fn is_pong_for(message: &WindowMessage, id: &str) -> bool {
    message.payload == WindowPayload::Pong
        && message.target == MessageTarget::Page
        && message.target_id.as_deref() == Some(id)
}

/// True if any extension answers a ping within `timeout`.
pub async fn is_available(bus: &MessageBus, from: &Endpoint, timeout: Duration) -> bool {
    let mut rx = bus.subscribe();
    bus.post(ping(from));

    let answered = async {
        loop {
            match rx.recv().await {
                Ok(message) if is_pong_for(&message, &from.id) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, answered).await.unwrap_or(false)
}

/// Every extension that answers a ping within `timeout`, once each.
pub async fn available_extensions(
    bus: &MessageBus,
    from: &Endpoint,
    timeout: Duration,
) -> Vec<Endpoint> {
    let mut rx = bus.subscribe();
    bus.post(ping(from));

    let deadline = tokio::time::Instant::now() + timeout;
    let mut found: Vec<Endpoint> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(message)) if is_pong_for(&message, &from.id) => {
                if !found.iter().any(|e| e.id == message.sender.id) {
                    debug!("Extension \"{}\" is available", message.sender.name);
                    found.push(message.sender);
                }
            }
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        }
    }
    found
}

pub type PairingRequestCallback =
    Arc<dyn Fn(PostMessagePairingRequest, ConnectionContext) + Send + Sync>;

struct Shared {
    role: PairingRole,
    keys: IdentityKeys,
    endpoint: Endpoint,
    app_url: Option<String>,
    bus: MessageBus,
    peers: PeerManager,
    status: StatusCell,
    listeners: ListenerRegistry,
    /// peer public key → receive key
    active: RwLock<HashMap<String, Zeroizing<[u8; 32]>>>,
    new_peer: RwLock<Option<NewPeerCallback>>,
    pairing_requests: RwLock<Option<PairingRequestCallback>>,
    opened: Mutex<SeenWindow>,
}

impl Shared {
    fn inbound(&self) -> MessageTarget {
        match self.role {
            PairingRole::Dapp => MessageTarget::Page,
            PairingRole::Wallet => MessageTarget::Extension,
        }
    }

    fn outbound(&self) -> MessageTarget {
        match self.role {
            PairingRole::Dapp => MessageTarget::Extension,
            PairingRole::Wallet => MessageTarget::Page,
        }
    }

    fn context(&self, sender: &Endpoint) -> ConnectionContext {
        ConnectionContext {
            origin: match self.role {
                PairingRole::Dapp => Origin::Extension,
                PairingRole::Wallet => Origin::Website,
            },
            id: sender.id.clone(),
        }
    }

    fn post(&self, target_id: Option<String>, payload: WindowPayload) {
        self.bus.post(WindowMessage {
            target: self.outbound(),
            target_id,
            sender: self.endpoint.clone(),
            payload,
        });
    }

    fn listen(&self, public_key: &str) -> Result<(), TransportError> {
        if self.active.read().contains_key(public_key) {
            return Ok(());
        }
        let peer_key = parse_public_key(public_key)?;
        let session = derive_session_keys(&self.keys.signing_key, &peer_key)?;
        self.active
            .write()
            .insert(public_key.to_string(), Zeroizing::new(session.receive_key));
        debug!("Listening for window messages from {}", public_key);
        Ok(())
    }

    fn handle(&self, message: WindowMessage) {
        if message.sender.id == self.endpoint.id || message.target != self.inbound() {
            return;
        }
        if matches!(&message.target_id, Some(id) if *id != self.endpoint.id) {
            return;
        }

        match (self.role, message.payload) {
            (PairingRole::Wallet, WindowPayload::Ping) => {
                self.post(Some(message.sender.id), WindowPayload::Pong);
            }
            (PairingRole::Wallet, WindowPayload::PairingRequest(request)) => {
                info!("Pairing request from {}", request.name);
                let callback = self.pairing_requests.read().clone();
                match callback {
                    Some(callback) => callback(request, self.context(&message.sender)),
                    None => warn!("Pairing request dropped: no handler"),
                }
            }
            (PairingRole::Dapp, WindowPayload::ChannelOpen(sealed)) => {
                if let Err(e) = self.accept_channel(&sealed, &message.sender) {
                    debug!("Ignoring channel opening: {}", e);
                }
            }
            (_, WindowPayload::Encrypted(payload)) => {
                let plaintext = self
                    .active
                    .read()
                    .values()
                    .find_map(|key| decrypt_payload(&payload, key).ok());
                // Not every message on the window is for us
                if let Some(plaintext) = plaintext {
                    self.listeners
                        .notify(&plaintext, &self.context(&message.sender));
                }
            }
            _ => {}
        }
    }

    fn accept_channel(&self, sealed: &str, extension: &Endpoint) -> Result<(), TransportError> {
        let plaintext = open_sealed_hex(sealed, &self.keys.signing_key)?;
        if !self.opened.lock().insert(sealed) {
            return Ok(());
        }
        let response: PostMessagePairingResponse = serde_json::from_str(&plaintext)
            .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        let public_key = parse_public_key(&response.public_key)?;

        let peer = PeerRecord {
            id: response.id,
            name: response.name,
            public_key: response.public_key,
            relay_server: String::new(),
            version: response.version,
            sender_id: sender_id(&public_key),
            transport_target_id: Some(extension.id.clone()),
            icon: response.icon,
            app_url: response.app_url,
        };
        info!("Channel opened by extension {}", extension.name);
        self.listen(&peer.public_key)?;
        self.peers.add_peer(peer.clone())?;
        self.status.set(TransportStatus::Connected);

        let callback = self.new_peer.read().clone();
        if let Some(callback) = callback {
            callback(&peer);
        }
        Ok(())
    }

    fn encrypt_for(&self, message: &str, peer: &PeerRecord) -> Result<String, TransportError> {
        let peer_key = parse_public_key(&peer.public_key)?;
        let session = derive_session_keys(&self.keys.signing_key, &peer_key)?;
        Ok(encrypt_payload(message, &session.transmit_key)?)
    }
}

async fn pump(shared: Weak<Shared>, mut rx: broadcast::Receiver<WindowMessage>) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle(message);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Window bus lagged, {} messages skipped", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub struct PostMessageTransport {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PostMessageTransport {
    /// `endpoint_id` identifies this page or extension on the window.
    pub fn new(
        role: PairingRole,
        keys: IdentityKeys,
        config: &PairwireConfig,
        endpoint_id: impl Into<String>,
        bus: MessageBus,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let key = match role {
            PairingRole::Dapp => StorageKey::DappPeersPostMessage,
            PairingRole::Wallet => StorageKey::WalletPeersPostMessage,
        };

        Self {
            shared: Arc::new(Shared {
                role,
                keys,
                endpoint: Endpoint {
                    id: endpoint_id.into(),
                    name: config.name.clone(),
                    icon_url: config.icon_url.clone(),
                },
                app_url: config.app_url.clone(),
                bus,
                peers: PeerManager::new(storage, key),
                status: StatusCell::new(TransportKind::PostMessage),
                listeners: ListenerRegistry::new(),
                active: RwLock::new(HashMap::new()),
                new_peer: RwLock::new(None),
                pairing_requests: RwLock::new(None),
                opened: Mutex::new(SeenWindow::new(OPENED_WINDOW)),
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn role(&self) -> PairingRole {
        self.shared.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn public_key_hex(&self) -> String {
        self.shared.keys.public_key_hex()
    }

    pub fn pairing_request(&self) -> PostMessagePairingRequest {
        PostMessagePairingRequest {
            id: guid(),
            kind: PostMessagePairingType::Request,
            name: self.shared.endpoint.name.clone(),
            public_key: self.shared.keys.public_key_hex(),
            version: PROTOCOL_VERSION.to_string(),
            icon: self.shared.endpoint.icon_url.clone(),
            app_url: self.shared.app_url.clone(),
        }
    }

    /// Ask the extension `extension_id` to pair with this page.
    pub fn send_pairing_request(&self, extension_id: &str) -> Result<(), TransportError> {
        if self.shared.role != PairingRole::Dapp {
            return Err(TransportError::Unsupported(self.shared.role));
        }
        info!("Sending pairing request to extension {}", extension_id);
        self.shared.post(
            Some(extension_id.to_string()),
            WindowPayload::PairingRequest(self.pairing_request()),
        );
        Ok(())
    }

    /// Wallet side: pairing requests posted by pages.
    pub fn on_pairing_request(&self, callback: PairingRequestCallback) {
        *self.shared.pairing_requests.write() = Some(callback);
    }

    pub fn listen_for_new_peer(&self, callback: NewPeerCallback) {
        *self.shared.new_peer.write() = Some(callback);
    }

    pub fn stop_listening_for_new_peers(&self) {
        *self.shared.new_peer.write() = None;
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PostMessageTransport {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[async_trait]
impl Transport for PostMessageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PostMessage
    }

    fn status(&self) -> TransportStatus {
        self.shared.status.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.shared.status.begin() {
            return Ok(());
        }

        let known = match self.shared.peers.get_peers() {
            Ok(known) => known,
            Err(e) => {
                self.shared.status.set(TransportStatus::NotConnected);
                return Err(e.into());
            }
        };
        if !known.is_empty() {
            info!("Connecting to {} known peers", known.len());
        }
        for peer in &known {
            if let Err(e) = self.shared.listen(&peer.public_key) {
                warn!("Skipping stored peer {}: {}", peer.sender_id, e);
            }
        }

        let rx = self.shared.bus.subscribe();
        let handle = tokio::spawn(pump(Arc::downgrade(&self.shared), rx));
        *self.pump.lock() = Some(handle);

        self.shared.status.set(TransportStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_pump();
        self.shared.active.write().clear();
        self.shared.status.set(TransportStatus::NotConnected);
        Ok(())
    }

    async fn send(&self, message: &str, peer: Option<&PeerRecord>) -> Result<(), TransportError> {
        if self.shared.status.get() != TransportStatus::Connected {
            return Err(TransportError::NotConnected);
        }

        let targets = match peer {
            Some(peer) => vec![peer.clone()],
            None => self.shared.peers.get_peers()?,
        };
        for peer in &targets {
            let payload = self.shared.encrypt_for(message, peer)?;
            self.shared.post(
                peer.transport_target_id.clone(),
                WindowPayload::Encrypted(payload),
            );
        }
        Ok(())
    }

    fn add_listener(&self, listener: TransportListener) -> TransportListenerId {
        self.shared.listeners.add(listener)
    }

    fn remove_listener(&self, id: TransportListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    fn get_peers(&self) -> Result<Vec<PeerRecord>, TransportError> {
        Ok(self.shared.peers.get_peers()?)
    }

    async fn add_peer(&self, peer: PeerRecord) -> Result<(), TransportError> {
        info!("Adding peer {} ({})", peer.name, peer.sender_id);
        let channel_open = match self.shared.role {
            PairingRole::Wallet => {
                let response = PostMessagePairingResponse {
                    id: peer.id.clone(),
                    kind: PostMessagePairingType::Response,
                    name: self.shared.endpoint.name.clone(),
                    public_key: self.shared.keys.public_key_hex(),
                    version: PROTOCOL_VERSION.to_string(),
                    icon: self.shared.endpoint.icon_url.clone(),
                    app_url: self.shared.app_url.clone(),
                };
                let plaintext = serde_json::to_string(&response)
                    .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
                Some(seal_hex(&plaintext, &parse_public_key(&peer.public_key)?)?)
            }
            PairingRole::Dapp => None,
        };

        self.shared.listen(&peer.public_key)?;
        self.shared.peers.add_peer(peer.clone())?;
        if let Some(sealed) = channel_open {
            self.shared
                .post(peer.transport_target_id.clone(), WindowPayload::ChannelOpen(sealed));
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: &PeerRecord) -> Result<(), TransportError> {
        self.shared.peers.remove_peer(&peer.public_key)?;
        self.shared.active.write().remove(&peer.public_key);
        Ok(())
    }

    async fn remove_all_peers(&self) -> Result<(), TransportError> {
        self.shared.peers.remove_all_peers()?;
        self.shared.active.write().clear();
        Ok(())
    }
}
