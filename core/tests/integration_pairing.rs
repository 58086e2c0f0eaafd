//! Pairing and messaging over the in-process relay network
//!
//! Run with: cargo test --test integration_pairing

use pairwire_core::crypto::IdentityKeys;
use pairwire_core::p2p::{P2PCommunicationClient, PairingState, LEGACY_VERSION, PROTOCOL_VERSION};
use pairwire_core::store::{MemoryStorage, PeerManager, PeerRecord, StorageKey};
use pairwire_core::testing::LocalRelayNetwork;
use pairwire_core::transport::{
    ConnectionContext, Origin, P2PTransport, PairingRole, Transport, TransportStatus,
};
use pairwire_core::PairwireConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct App {
    transport: P2PTransport,
    storage: Arc<MemoryStorage>,
}

fn app(network: &LocalRelayNetwork, name: &str, role: PairingRole) -> App {
    let mut config = PairwireConfig::with_name(name);
    config.relay_hosts = vec!["relay.test".to_string()];
    config.relay.poll_timeout = Duration::from_millis(200);

    let storage = Arc::new(MemoryStorage::new());
    let client = Arc::new(P2PCommunicationClient::new(
        IdentityKeys::generate(),
        &config,
        storage.clone(),
        Arc::new(network.clone()),
    ));
    App {
        transport: P2PTransport::new(role, client, storage.clone()),
        storage,
    }
}

fn public_key(app: &App) -> String {
    app.transport.client().public_key_hex()
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

type Inbox = mpsc::UnboundedReceiver<(String, ConnectionContext)>;

fn inbox(app: &App) -> Inbox {
    let (tx, rx) = mpsc::unbounded_channel();
    app.transport
        .add_listener(Arc::new(move |message: &str, context: &ConnectionContext| {
            let _ = tx.send((message.to_string(), context.clone()));
        }));
    rx
}

/// The dApp shares its request, the wallet answers it; returns the peer
/// record the dApp stored for the wallet.
async fn pair(dapp: &App, wallet: &App) -> PeerRecord {
    let (tx, mut paired) = mpsc::unbounded_channel();
    dapp.transport
        .listen_for_new_peer(Arc::new(move |peer: &PeerRecord| {
            let _ = tx.send(peer.clone());
        }));

    let request = dapp.transport.pairing_request().unwrap();
    wallet
        .transport
        .add_peer(request.to_peer_record().unwrap())
        .await
        .unwrap();

    let peer = next(&mut paired).await;
    dapp.transport.stop_listening_for_new_peers();
    peer
}

#[tokio::test]
async fn test_pairing_leaves_one_peer_entry() {
    let network = LocalRelayNetwork::new();
    let dapp = app(&network, "Example dApp", PairingRole::Dapp);
    let wallet = app(&network, "Example Wallet", PairingRole::Wallet);
    dapp.transport.connect().await.unwrap();
    wallet.transport.connect().await.unwrap();

    let peer = pair(&dapp, &wallet).await;

    assert_eq!(peer.name, "Example Wallet");
    assert_eq!(peer.public_key, public_key(&wallet));
    assert_eq!(peer.version, PROTOCOL_VERSION);

    let peers = dapp.transport.get_peers().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].public_key, public_key(&wallet));
    assert_eq!(
        dapp.transport.pairing_state(),
        PairingState::Paired {
            public_key: public_key(&wallet)
        }
    );

    // The wallet stored the dApp under its own key
    let wallet_peers = PeerManager::new(wallet.storage.clone(), StorageKey::WalletPeersP2p)
        .get_peers()
        .unwrap();
    assert_eq!(wallet_peers.len(), 1);
    assert_eq!(wallet_peers[0].name, "Example dApp");

    dapp.transport.disconnect().await.unwrap();
    wallet.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_versionless_request_pairs_with_bare_key() {
    let network = LocalRelayNetwork::new();
    let dapp = app(&network, "Old dApp", PairingRole::Dapp);
    let wallet = app(&network, "Example Wallet", PairingRole::Wallet);
    dapp.transport.connect().await.unwrap();
    wallet.transport.connect().await.unwrap();

    let (tx, mut paired) = mpsc::unbounded_channel();
    dapp.transport
        .listen_for_new_peer(Arc::new(move |peer: &PeerRecord| {
            let _ = tx.send(peer.clone());
        }));

    // Requests from before versioning carry no version field
    let mut request = dapp.transport.pairing_request().unwrap();
    request.version = None;
    let dapp_record = request.to_peer_record().unwrap();
    assert_eq!(dapp_record.version, LEGACY_VERSION);
    wallet.transport.add_peer(dapp_record).await.unwrap();

    // The answer was a bare key: no name, and the dApp's own relay host
    let peer = next(&mut paired).await;
    assert_eq!(peer.public_key, public_key(&wallet));
    assert_eq!(peer.version, LEGACY_VERSION);
    assert!(peer.name.is_empty());
    assert_eq!(peer.relay_server, request.relay_server);
    assert_eq!(dapp.transport.get_peers().unwrap(), vec![peer.clone()]);

    let mut wallet_inbox = inbox(&wallet);
    dapp.transport.send("still works", Some(&peer)).await.unwrap();
    let (message, context) = next(&mut wallet_inbox).await;
    assert_eq!(message, "still works");
    assert_eq!(context.id, public_key(&dapp));
}

#[tokio::test]
async fn test_message_reaches_only_its_listener() {
    let network = LocalRelayNetwork::new();
    let alice = app(&network, "alice", PairingRole::Dapp);
    let carol = app(&network, "carol", PairingRole::Dapp);
    let bob = app(&network, "bob", PairingRole::Wallet);
    for side in [&alice, &carol, &bob] {
        side.transport.connect().await.unwrap();
    }

    let bob_for_alice = pair(&alice, &bob).await;
    pair(&carol, &bob).await;
    assert_eq!(bob.transport.get_peers().unwrap().len(), 2);

    let mut bob_inbox = inbox(&bob);
    let mut carol_inbox = inbox(&carol);

    alice
        .transport
        .send("hello", Some(&bob_for_alice))
        .await
        .unwrap();

    let (message, context) = next(&mut bob_inbox).await;
    assert_eq!(message, "hello");
    assert_eq!(context.origin, Origin::P2p);
    assert_eq!(context.id, public_key(&alice));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(bob_inbox.try_recv().is_err());
    assert!(carol_inbox.try_recv().is_err());

    // Broadcast from the wallet reaches both dApps
    let mut alice_inbox = inbox(&alice);
    bob.transport.send("to everyone", None).await.unwrap();
    assert_eq!(next(&mut alice_inbox).await.0, "to everyone");
    assert_eq!(next(&mut carol_inbox).await.0, "to everyone");
}

#[tokio::test]
async fn test_connect_without_known_peers() {
    let network = LocalRelayNetwork::new();
    let dapp = app(&network, "dApp", PairingRole::Dapp);

    dapp.transport.connect().await.unwrap();

    assert_eq!(dapp.transport.status(), TransportStatus::Connected);
    assert!(dapp.transport.client().listening_to().is_empty());
    assert_eq!(dapp.transport.pairing_state(), PairingState::AwaitingResponse);
}

#[tokio::test]
async fn test_connect_with_one_known_peer() {
    let network = LocalRelayNetwork::new();
    let dapp = app(&network, "dApp", PairingRole::Dapp);
    let wallet_keys = IdentityKeys::generate();
    PeerManager::new(dapp.storage.clone(), StorageKey::DappPeersP2p)
        .add_peer(PeerRecord {
            id: "stored".to_string(),
            name: "Wallet".to_string(),
            public_key: wallet_keys.public_key_hex(),
            relay_server: "relay.test".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            sender_id: wallet_keys.sender_id(),
            transport_target_id: None,
            icon: None,
            app_url: None,
        })
        .unwrap();

    dapp.transport.connect().await.unwrap();

    assert_eq!(dapp.transport.status(), TransportStatus::Connected);
    assert_eq!(
        dapp.transport.client().listening_to(),
        vec![wallet_keys.public_key_hex()]
    );
    assert_eq!(dapp.transport.pairing_state(), PairingState::Unpaired);
}
