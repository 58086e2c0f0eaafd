//! Relay-backed P2P transport
//!
//! Wraps a `P2PCommunicationClient` and a peer list. The dApp side waits for
//! channel openings; the wallet side opens the channel when a peer is added.

use super::abstraction::{
    ConnectionContext, ListenerRegistry, NewPeerCallback, Origin, PairingRole, StatusCell,
    Transport, TransportError, TransportKind, TransportListener, TransportListenerId,
    TransportStatus,
};
use crate::p2p::{
    ExtendedPairingResponse, P2PCommunicationClient, P2pError, PairingEvent, PairingRequest,
    PairingState,
};
use crate::store::{PeerManager, PeerRecord, StorageBackend, StorageKey};
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Shared {
    client: Arc<P2PCommunicationClient>,
    peers: PeerManager,
    status: StatusCell,
    listeners: Arc<ListenerRegistry>,
    pairing: Mutex<PairingState>,
    new_peer: RwLock<Option<NewPeerCallback>>,
    opening_listener: AtomicBool,
}

impl Shared {
    fn advance_pairing(&self, event: PairingEvent) {
        let mut state = self.pairing.lock();
        match state.clone().apply(event) {
            Ok(next) => {
                debug!("Pairing state: {:?}", next);
                *state = next;
            }
            Err(e) => warn!("{}", e),
        }
    }

    async fn listen(&self, public_key: &str) -> Result<(), P2pError> {
        let listeners = self.listeners.clone();
        let context = ConnectionContext {
            origin: Origin::P2p,
            id: public_key.to_string(),
        };
        self.client
            .listen_for_encrypted_message(
                public_key,
                Arc::new(move |message: String| listeners.notify(&message, &context)),
            )
            .await
    }

    fn forget_listener(&self, public_key: &str) {
        if let Err(e) = self.client.unsubscribe_from_encrypted_message(public_key) {
            warn!("Could not drop listener for {}: {}", public_key, e);
        }
    }

    async fn accept_channel(&self, response: ExtendedPairingResponse) -> Result<(), TransportError> {
        let peer = response.to_peer_record();
        self.listen(&peer.public_key).await?;
        self.peers.add_peer(peer.clone())?;
        self.advance_pairing(PairingEvent::ResponseReceived {
            public_key: peer.public_key.clone(),
        });
        self.status.set(TransportStatus::Connected);

        let callback = self.new_peer.read().clone();
        if let Some(callback) = callback {
            callback(&peer);
        }
        Ok(())
    }
}

pub struct P2PTransport {
    role: PairingRole,
    shared: Arc<Shared>,
}

impl P2PTransport {
    pub fn new(
        role: PairingRole,
        client: Arc<P2PCommunicationClient>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let key = match role {
            PairingRole::Dapp => StorageKey::DappPeersP2p,
            PairingRole::Wallet => StorageKey::WalletPeersP2p,
        };

        Self {
            role,
            shared: Arc::new(Shared {
                client,
                peers: PeerManager::new(storage, key),
                status: StatusCell::new(TransportKind::P2p),
                listeners: Arc::new(ListenerRegistry::new()),
                pairing: Mutex::new(PairingState::Unpaired),
                new_peer: RwLock::new(None),
                opening_listener: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    pub fn client(&self) -> &Arc<P2PCommunicationClient> {
        &self.shared.client
    }

    pub fn pairing_state(&self) -> PairingState {
        self.shared.pairing.lock().clone()
    }

    /// Handshake info to share out of band. Also makes sure the channel
    /// opening that answers it will be seen.
    pub fn pairing_request(&self) -> Result<PairingRequest, TransportError> {
        if self.role != PairingRole::Dapp {
            return Err(TransportError::Unsupported(self.role));
        }
        let request = self.shared.client.pairing_request_info()?;
        if self.shared.client.is_started() {
            self.listen_for_channel_opening()?;
        }
        self.shared.advance_pairing(PairingEvent::RequestShared);
        Ok(request)
    }

    pub fn listen_for_new_peer(&self, callback: NewPeerCallback) {
        debug!("listen_for_new_peer");
        *self.shared.new_peer.write() = Some(callback);
    }

    pub fn stop_listening_for_new_peers(&self) {
        debug!("stop_listening_for_new_peers");
        *self.shared.new_peer.write() = None;
    }

    fn listen_for_channel_opening(&self) -> Result<(), TransportError> {
        if self.shared.opening_listener.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.shared);
        let result = self
            .shared
            .client
            .listen_for_channel_opening(Arc::new(move |response: ExtendedPairingResponse| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let public_key = response.response.public_key.clone();
                    if let Err(e) = shared.accept_channel(response).await {
                        warn!("Could not accept channel from {}: {}", public_key, e);
                    }
                });
            }));

        if let Err(e) = result {
            self.shared.opening_listener.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let mut state = self.shared.pairing.lock();
        if *state == PairingState::Unpaired {
            *state = PairingState::AwaitingResponse;
        }
        Ok(())
    }

    async fn establish(&self) -> Result<(), TransportError> {
        self.shared.client.start().await?;

        let known = self.shared.peers.get_peers()?;
        if known.is_empty() {
            if self.role == PairingRole::Dapp {
                self.listen_for_channel_opening()?;
            }
            return Ok(());
        }

        info!("Connecting to {} known peers", known.len());
        try_join_all(known.iter().map(|peer| self.shared.listen(&peer.public_key))).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for P2PTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::P2p
    }

    fn status(&self) -> TransportStatus {
        self.shared.status.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.shared.status.begin() {
            return Ok(());
        }

        match self.establish().await {
            Ok(()) => {
                self.shared.status.set(TransportStatus::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("P2P connect failed: {}", e);
                self.shared.client.stop();
                self.shared.opening_listener.store(false, Ordering::SeqCst);
                self.shared.status.set(TransportStatus::NotConnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.client.stop();
        self.shared.opening_listener.store(false, Ordering::SeqCst);
        self.shared.status.set(TransportStatus::NotConnected);
        Ok(())
    }

    async fn send(&self, message: &str, peer: Option<&PeerRecord>) -> Result<(), TransportError> {
        if let Some(peer) = peer {
            return Ok(self.shared.client.send_message(message, peer).await?);
        }

        let peers = self.shared.peers.get_peers()?;
        if peers.is_empty() {
            warn!("Broadcast with no known peers");
            return Ok(());
        }
        try_join_all(
            peers
                .iter()
                .map(|peer| self.shared.client.send_message(message, peer)),
        )
        .await?;
        Ok(())
    }

    fn add_listener(&self, listener: TransportListener) -> TransportListenerId {
        self.shared.listeners.add(listener)
    }

    fn remove_listener(&self, id: TransportListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    fn get_peers(&self) -> Result<Vec<PeerRecord>, TransportError> {
        let peers = self.shared.peers.get_peers()?;
        debug!("{} P2P peers", peers.len());
        Ok(peers)
    }

    async fn add_peer(&self, peer: PeerRecord) -> Result<(), TransportError> {
        info!("Adding peer {} ({})", peer.name, peer.sender_id);
        let known = self.shared.peers.has_peer(&peer.public_key)?;
        self.shared.listen(&peer.public_key).await?;

        if self.role == PairingRole::Wallet {
            let sent = self
                .shared
                .client
                .send_pairing_response(&PairingRequest::from_peer_record(&peer))
                .await;
            if let Err(e) = sent {
                if !known {
                    self.shared.forget_listener(&peer.public_key);
                }
                return Err(e.into());
            }
        }

        // Persisted last: a rejected add leaves no record behind
        self.shared.peers.add_peer(peer.clone())?;
        if self.role == PairingRole::Wallet {
            self.shared.advance_pairing(PairingEvent::ResponseSent {
                public_key: peer.public_key,
            });
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: &PeerRecord) -> Result<(), TransportError> {
        info!("Removing peer {} ({})", peer.name, peer.sender_id);
        self.shared.peers.remove_peer(&peer.public_key)?;
        if self.shared.client.is_started() {
            self.shared
                .client
                .unsubscribe_from_encrypted_message(&peer.public_key)?;
        }

        let paired_with_it = matches!(
            &*self.shared.pairing.lock(),
            PairingState::Paired { public_key } if *public_key == peer.public_key
        );
        if paired_with_it {
            self.shared.advance_pairing(PairingEvent::Unpaired);
        }
        Ok(())
    }

    async fn remove_all_peers(&self) -> Result<(), TransportError> {
        info!("Removing all P2P peers");
        self.shared.peers.remove_all_peers()?;
        if self.shared.client.is_started() {
            self.shared.client.unsubscribe_from_encrypted_messages()?;
        }
        self.shared.advance_pairing(PairingEvent::Unpaired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairwireConfig;
    use crate::crypto::IdentityKeys;
    use crate::store::MemoryStorage;
    use crate::testing::LocalRelayNetwork;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn transport(network: &LocalRelayNetwork, role: PairingRole) -> P2PTransport {
        let mut config = PairwireConfig::with_name(role.to_string());
        config.relay_hosts = vec!["relay.test".to_string()];
        config.relay.poll_timeout = Duration::from_millis(200);
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(P2PCommunicationClient::new(
            IdentityKeys::generate(),
            &config,
            storage.clone(),
            Arc::new(network.clone()),
        ));
        P2PTransport::new(role, client, storage)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let network = LocalRelayNetwork::new();
        let dapp = transport(&network, PairingRole::Dapp);
        assert_eq!(dapp.status(), TransportStatus::NotConnected);

        dapp.connect().await.unwrap();
        dapp.connect().await.unwrap();

        assert_eq!(dapp.status(), TransportStatus::Connected);
        assert_eq!(dapp.client().connections().len(), 1);
        assert_eq!(dapp.pairing_state(), PairingState::AwaitingResponse);

        dapp.disconnect().await.unwrap();
        assert_eq!(dapp.status(), TransportStatus::NotConnected);
        assert!(!dapp.client().is_started());
    }

    #[tokio::test]
    async fn test_wallet_cannot_share_requests() {
        let network = LocalRelayNetwork::new();
        let wallet = transport(&network, PairingRole::Wallet);
        assert_eq!(
            wallet.pairing_request().unwrap_err(),
            TransportError::Unsupported(PairingRole::Wallet)
        );
    }

    #[tokio::test]
    async fn test_add_peer_requires_connection() {
        let network = LocalRelayNetwork::new();
        let wallet = transport(&network, PairingRole::Wallet);
        let dapp = transport(&network, PairingRole::Dapp);
        let request = dapp.pairing_request().unwrap();

        let err = wallet
            .add_peer(request.to_peer_record().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::P2p(P2pError::NotStarted));
    }

    #[tokio::test]
    async fn test_failed_add_peer_stores_nothing() {
        let network = LocalRelayNetwork::new();
        let wallet = transport(&network, PairingRole::Wallet);
        let dapp = transport(&network, PairingRole::Dapp);
        let request = dapp.pairing_request().unwrap();

        assert!(wallet
            .add_peer(request.to_peer_record().unwrap())
            .await
            .is_err());
        assert!(wallet.get_peers().unwrap().is_empty());
        assert_eq!(wallet.pairing_state(), PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_pairing_and_removal() {
        let network = LocalRelayNetwork::new();
        let dapp = transport(&network, PairingRole::Dapp);
        let wallet = transport(&network, PairingRole::Wallet);
        dapp.connect().await.unwrap();
        wallet.connect().await.unwrap();

        let (tx, mut new_peers) = mpsc::unbounded_channel();
        dapp.listen_for_new_peer(Arc::new(move |peer: &PeerRecord| {
            let _ = tx.send(peer.public_key.clone());
        }));

        let request = dapp.pairing_request().unwrap();
        wallet
            .add_peer(request.to_peer_record().unwrap())
            .await
            .unwrap();

        let paired = tokio::time::timeout(Duration::from_secs(10), new_peers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paired, wallet.client().public_key_hex());
        assert_eq!(dapp.get_peers().unwrap().len(), 1);
        assert_eq!(
            dapp.pairing_state(),
            PairingState::Paired {
                public_key: paired.clone()
            }
        );
        assert_eq!(
            wallet.pairing_state(),
            PairingState::Paired {
                public_key: dapp.client().public_key_hex()
            }
        );

        let peer = dapp.get_peers().unwrap().remove(0);
        dapp.remove_peer(&peer).await.unwrap();
        assert!(dapp.get_peers().unwrap().is_empty());
        assert!(dapp.client().listening_to().is_empty());
        assert_eq!(dapp.pairing_state(), PairingState::Unpaired);
    }
}
