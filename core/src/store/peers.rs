// Peer management storage
//
// One JSON list per (role, transport) key. Records are unique by public key.

use super::{load_json, store_json, StorageBackend, StorageError, StorageKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A paired counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Pairing id the counterpart announced
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub relay_server: String,
    pub version: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

#[derive(Clone)]
pub struct PeerManager {
    backend: Arc<dyn StorageBackend>,
    key: StorageKey,
}

impl PeerManager {
    pub fn new(backend: Arc<dyn StorageBackend>, key: StorageKey) -> Self {
        Self { backend, key }
    }

    pub fn storage_key(&self) -> StorageKey {
        self.key
    }

    pub fn get_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        Ok(load_json(self.backend.as_ref(), &self.key)?.unwrap_or_default())
    }

    pub fn get_peer(&self, public_key: &str) -> Result<Option<PeerRecord>, StorageError> {
        Ok(self
            .get_peers()?
            .into_iter()
            .find(|peer| peer.public_key == public_key))
    }

    pub fn has_peer(&self, public_key: &str) -> Result<bool, StorageError> {
        Ok(self.get_peer(public_key)?.is_some())
    }

    /// Insert a peer, replacing any record with the same public key in place.
    pub fn add_peer(&self, peer: PeerRecord) -> Result<(), StorageError> {
        let mut peers = self.get_peers()?;
        match peers.iter_mut().find(|p| p.public_key == peer.public_key) {
            Some(existing) => *existing = peer,
            None => peers.push(peer),
        }
        debug!("{}: {} peer(s)", self.key, peers.len());
        self.save(&peers)
    }

    pub fn remove_peer(&self, public_key: &str) -> Result<(), StorageError> {
        self.remove_peers(&[public_key])
    }

    pub fn remove_peers(&self, public_keys: &[&str]) -> Result<(), StorageError> {
        let mut peers = self.get_peers()?;
        peers.retain(|peer| !public_keys.contains(&peer.public_key.as_str()));
        self.save(&peers)
    }

    pub fn remove_all_peers(&self) -> Result<(), StorageError> {
        self.backend.delete(self.key.as_str())
    }

    fn save(&self, peers: &[PeerRecord]) -> Result<(), StorageError> {
        store_json(self.backend.as_ref(), &self.key, &peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn peer(public_key: &str, name: &str) -> PeerRecord {
        PeerRecord {
            id: format!("id-{}", name),
            name: name.to_string(),
            public_key: public_key.to_string(),
            relay_server: "relay.example.org".to_string(),
            version: "2".to_string(),
            sender_id: format!("sender-{}", name),
            transport_target_id: None,
            icon: None,
            app_url: None,
        }
    }

    #[test]
    fn test_add_and_get() {
        let manager = PeerManager::new(Arc::new(MemoryStorage::new()), StorageKey::DappPeersP2p);

        assert!(manager.get_peers().unwrap().is_empty());
        manager.add_peer(peer("aa", "wallet")).unwrap();

        assert!(manager.has_peer("aa").unwrap());
        assert!(!manager.has_peer("bb").unwrap());
        assert_eq!(manager.get_peer("aa").unwrap().unwrap().name, "wallet");
    }

    #[test]
    fn test_add_same_public_key_replaces() {
        let manager = PeerManager::new(Arc::new(MemoryStorage::new()), StorageKey::DappPeersP2p);
        manager.add_peer(peer("aa", "first")).unwrap();
        manager.add_peer(peer("bb", "other")).unwrap();
        manager.add_peer(peer("aa", "second")).unwrap();

        let peers = manager.get_peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "second");
    }

    #[test]
    fn test_remove() {
        let manager = PeerManager::new(Arc::new(MemoryStorage::new()), StorageKey::WalletPeersP2p);
        for (key, name) in [("aa", "a"), ("bb", "b"), ("cc", "c")] {
            manager.add_peer(peer(key, name)).unwrap();
        }

        manager.remove_peer("bb").unwrap();
        assert_eq!(manager.get_peers().unwrap().len(), 2);

        manager.remove_peers(&["aa", "zz"]).unwrap();
        assert_eq!(manager.get_peers().unwrap().len(), 1);

        manager.remove_all_peers().unwrap();
        assert!(manager.get_peers().unwrap().is_empty());
    }

    #[test]
    fn test_role_lists_are_disjoint() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let dapp = PeerManager::new(storage.clone(), StorageKey::DappPeersP2p);
        let wallet = PeerManager::new(storage, StorageKey::WalletPeersP2p);

        dapp.add_peer(peer("aa", "wallet")).unwrap();
        assert!(wallet.get_peers().unwrap().is_empty());
    }

    #[test]
    fn test_record_uses_camel_case_on_disk() {
        let json = serde_json::to_string(&peer("aa", "x")).unwrap();

        assert!(json.contains("\"publicKey\":\"aa\""));
        assert!(json.contains("\"relayServer\""));
        assert!(!json.contains("transportTargetId"));
    }
}
