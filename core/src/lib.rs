// Pairwire core: pairing, session crypto and relay transport
//
// Two apps that do not trust each other (a dApp and a wallet) pair once
// through an out-of-band request, then exchange end-to-end encrypted
// messages over untrusted relay servers or an in-page message bus.

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod p2p;
pub mod relay;
pub mod store;
pub mod testing;
pub mod transport;

use thiserror::Error;

pub use config::{PairwireConfig, DEFAULT_RELAY_HOST};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorState, LocalBroadcast, TabCoordinator,
    TabHandlers,
};
pub use crypto::{CryptoError, IdentityKeys};
pub use p2p::{P2PCommunicationClient, P2pError, PairingRequest, PairingState};
pub use relay::{HttpConnector, RelayClient, RelayClientConfig, RelayError};
pub use store::{
    MemoryStorage, PeerManager, PeerRecord, SledStorage, StorageBackend, StorageError,
    StorageKey,
};
pub use transport::{
    ConnectionContext, MessageBus, Origin, P2PTransport, PairingRole, PostMessageTransport,
    Transport, TransportError, TransportKind, TransportStatus,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Coarse classification a UI can render without knowing every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pairing handshake could not complete
    Pairing,
    /// A message did not go out; usually transient
    Send,
    Relay,
    Crypto,
    Storage,
    /// Called in the wrong state (not started, not connected, unloaded)
    State,
}

#[derive(Debug, Error)]
pub enum PairwireError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    P2p(#[from] P2pError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl PairwireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PairwireError::Crypto(_) => ErrorKind::Crypto,
            PairwireError::Storage(_) => ErrorKind::Storage,
            PairwireError::Relay(_) => ErrorKind::Relay,
            PairwireError::P2p(e) => p2p_kind(e),
            PairwireError::Transport(e) => transport_kind(e),
            PairwireError::Coordinator(CoordinatorError::RequestTimeout(_)) => ErrorKind::Send,
            PairwireError::Coordinator(_) => ErrorKind::State,
            PairwireError::Config(_) => ErrorKind::State,
        }
    }
}

fn p2p_kind(error: &P2pError) -> ErrorKind {
    match error {
        P2pError::NotStarted => ErrorKind::State,
        P2pError::NoRelayHost | P2pError::Relay(_) => ErrorKind::Relay,
        P2pError::JoinTimeout { .. } => ErrorKind::Send,
        P2pError::InvalidPairing(_) => ErrorKind::Pairing,
        P2pError::Crypto(_) => ErrorKind::Crypto,
        P2pError::Storage(_) => ErrorKind::Storage,
    }
}

fn transport_kind(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::NotConnected | TransportError::Unsupported(_) => ErrorKind::State,
        TransportError::PeerNotFound(_) | TransportError::SendFailed(_) => ErrorKind::Send,
        TransportError::InvalidPayload(_) => ErrorKind::Pairing,
        TransportError::P2p(e) => p2p_kind(e),
        TransportError::Storage(_) => ErrorKind::Storage,
        TransportError::Crypto(_) => ErrorKind::Crypto,
    }
}

// ============================================================================
// SETUP
// ============================================================================

/// Install the fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}

/// Identity derived from the seed in `storage`, creating the seed on first use.
pub fn load_or_create_identity(storage: &dyn StorageBackend) -> Result<IdentityKeys, PairwireError> {
    let key = StorageKey::IdentitySeed;
    let seed = match store::load_json::<String>(storage, &key)? {
        Some(seed) => seed,
        None => {
            let seed = crypto::guid();
            store::store_json(storage, &key, &seed)?;
            tracing::info!("Created new identity seed");
            seed
        }
    };
    Ok(IdentityKeys::from_seed(&seed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_identity_survives_reload() {
        let storage = MemoryStorage::new();
        let first = load_or_create_identity(&storage).unwrap();
        let second = load_or_create_identity(&storage).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());

        let other = load_or_create_identity(&MemoryStorage::new()).unwrap();
        assert_ne!(first.public_key_hex(), other.public_key_hex());
    }

    #[test]
    fn test_error_kinds() {
        let pairing: PairwireError = P2pError::InvalidPairing("bad".to_string()).into();
        assert_eq!(pairing.kind(), ErrorKind::Pairing);

        let nested: PairwireError = TransportError::P2p(P2pError::NotStarted).into();
        assert_eq!(nested.kind(), ErrorKind::State);

        let timeout: PairwireError =
            CoordinatorError::RequestTimeout(Duration::from_secs(5)).into();
        assert_eq!(timeout.kind(), ErrorKind::Send);

        let relay: PairwireError = RelayError::SyncFailed { attempts: 4 }.into();
        assert_eq!(relay.kind(), ErrorKind::Relay);
        assert_eq!(relay.to_string(), "Sync failed after 4 attempts");
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
    }
}
