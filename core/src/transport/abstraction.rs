//! Transport abstraction layer
//!
//! Every concrete transport (relay-based P2P, in-process post-message) speaks
//! the same contract so a facade can swap them without protocol changes.

use crate::crypto::CryptoError;
use crate::p2p::P2pError;
use crate::store::{PeerRecord, StorageError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kinds of transport a facade can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Relay rooms between two apps on different devices
    P2p,
    /// Same-page messaging with a browser extension
    PostMessage,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::P2p => write!(f, "p2p"),
            TransportKind::PostMessage => write!(f, "post_message"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportStatus {
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::NotConnected => write!(f, "NOT_CONNECTED"),
            TransportStatus::Connecting => write!(f, "CONNECTING"),
            TransportStatus::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Where an inbound message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    P2p,
    Extension,
    Website,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub origin: Origin,
    /// Counterpart public key (P2P) or endpoint id (post-message)
    pub id: String,
}

/// Which side of the pairing this transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingRole {
    /// Shares a pairing request and waits for a wallet to open the channel
    Dapp,
    /// Answers pairing requests
    Wallet,
}

impl fmt::Display for PairingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingRole::Dapp => write!(f, "dapp"),
            PairingRole::Wallet => write!(f, "wallet"),
        }
    }
}

/// Errors that can occur in transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Operation not supported for the {0} role")]
    Unsupported(PairingRole),
    #[error(transparent)]
    P2p(#[from] P2pError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type TransportListener = Arc<dyn Fn(&str, &ConnectionContext) + Send + Sync>;

/// Fires once per newly paired counterpart.
pub type NewPeerCallback = Arc<dyn Fn(&PeerRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportListenerId(pub u64);

/// Application listeners of one transport.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(TransportListenerId, TransportListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: TransportListener) -> TransportListenerId {
        let id = TransportListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        debug!("Transport listener {} added", id.0);
        id
    }

    /// Returns false if the listener was already gone.
    pub fn remove(&self, id: TransportListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, message: &str, context: &ConnectionContext) {
        // Snapshot so a listener may add or remove listeners
        let listeners: Vec<TransportListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        if listeners.is_empty() {
            warn!("Message from {} dropped: 0 listeners", context.id);
            return;
        }
        debug!("Notifying {} listeners", listeners.len());
        for listener in listeners {
            listener(message, context);
        }
    }
}

/// Connection status shared by the concrete transports.
///
/// `begin` is the only way out of `NotConnected`, so concurrent connects
/// collapse into one.
pub struct StatusCell {
    kind: TransportKind,
    status: Mutex<TransportStatus>,
}

impl StatusCell {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            status: Mutex::new(TransportStatus::NotConnected),
        }
    }

    pub fn get(&self) -> TransportStatus {
        *self.status.lock()
    }

    /// Move to `Connecting`. False if a connect is already running or done.
    pub fn begin(&self) -> bool {
        let mut status = self.status.lock();
        if *status != TransportStatus::NotConnected {
            return false;
        }
        *status = TransportStatus::Connecting;
        info!("{} transport status: {}", self.kind, TransportStatus::Connecting);
        true
    }

    pub fn set(&self, next: TransportStatus) {
        let mut status = self.status.lock();
        if *status != next {
            *status = next;
            info!("{} transport status: {}", self.kind, next);
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn status(&self) -> TransportStatus;

    /// Idempotent. Re-establishes one listener per known peer before
    /// reporting `Connected`.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send to `peer`, or to every known peer when `None`.
    async fn send(&self, message: &str, peer: Option<&PeerRecord>) -> Result<(), TransportError>;

    fn add_listener(&self, listener: TransportListener) -> TransportListenerId;

    fn remove_listener(&self, id: TransportListenerId) -> bool;

    fn get_peers(&self) -> Result<Vec<PeerRecord>, TransportError>;

    async fn add_peer(&self, peer: PeerRecord) -> Result<(), TransportError>;

    async fn remove_peer(&self, peer: &PeerRecord) -> Result<(), TransportError>;

    async fn remove_all_peers(&self) -> Result<(), TransportError>;
}
