// Store module: storage capability, well-known keys, peer lists

pub mod backend;
pub mod peers;

pub use backend::{load_json, store_json, MemoryStorage, SledStorage, StorageBackend};
pub use peers::{PeerManager, PeerRecord};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Every key this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// Wallets a dApp has paired with over the relay
    DappPeersP2p,
    /// dApps a wallet has paired with over the relay
    WalletPeersP2p,
    DappPeersPostMessage,
    WalletPeersPostMessage,
    /// Relay sync token and room snapshot
    MatrixPreservedState,
    /// Counterpart public key → room id
    MatrixPeerRoomIds,
    MatrixSelectedNode,
    IdentitySeed,
}

impl StorageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::DappPeersP2p => "pairwire:dapp-peers-p2p",
            StorageKey::WalletPeersP2p => "pairwire:wallet-peers-p2p",
            StorageKey::DappPeersPostMessage => "pairwire:dapp-peers-postmessage",
            StorageKey::WalletPeersPostMessage => "pairwire:wallet-peers-postmessage",
            StorageKey::MatrixPreservedState => "pairwire:matrix-preserved-state",
            StorageKey::MatrixPeerRoomIds => "pairwire:matrix-peer-rooms",
            StorageKey::MatrixSelectedNode => "pairwire:matrix-selected-node",
            StorageKey::IdentitySeed => "pairwire:identity-seed",
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
