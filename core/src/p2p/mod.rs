//! Pairing and encrypted messaging on top of one or more relay connections

pub mod client;
pub mod pairing;
pub mod selection;

pub use client::{ChannelOpenCallback, MessageCallback, P2PCommunicationClient};
pub use pairing::{
    channel_open_message, channel_open_payload, is_channel_open_for, parse_pairing_response,
    ExtendedPairingResponse, PairingEvent, PairingMessageType, PairingRequest, PairingResponse,
    PairingState, LEGACY_VERSION, PROTOCOL_VERSION,
};
pub use selection::select_relay_host;

use crate::crypto::CryptoError;
use crate::relay::RelayError;
use crate::store::StorageError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum P2pError {
    #[error("Client not ready. Call start before using it")]
    NotStarted,
    #[error("No relay host configured")]
    NoRelayHost,
    #[error("No one joined room {room_id} after {attempts} checks")]
    JoinTimeout { room_id: String, attempts: u32 },
    #[error("Invalid pairing payload: {0}")]
    InvalidPairing(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
