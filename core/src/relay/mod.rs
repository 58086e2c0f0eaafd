//! Relay client for a federated chat network used as a store-and-forward channel
//!
//! The relay is not trusted: it sees room membership and ciphertext only.

pub mod api;
pub mod client;
pub mod events;
pub mod http;
pub mod room;
pub mod state;

pub use api::{LoginCredentials, RelayApi, RelayConnector};
pub use client::{RelayClient, RelayClientConfig};
pub use events::{EventEmitter, InviteEvent, ListenerId, MessageEvent, RelayEvent, RelayEventKind};
pub use http::{HttpConnector, HttpRelayApi};
pub use room::{Room, RoomMessage, RoomStatus};

use thiserror::Error;

/// Relay error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// An operation needing an access token ran before login
    #[error("{0} requires authorization but no access token has been provided")]
    NotAuthorized(String),
    /// The server refused the operation (`M_FORBIDDEN`)
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Server error {status} ({errcode}): {message}")]
    Server {
        status: u16,
        errcode: String,
        message: String,
    },
    /// The sync loop exhausted its retry budget
    #[error("Sync failed after {attempts} attempts")]
    SyncFailed { attempts: u32 },
    #[error("Relay client stopped")]
    Stopped,
    #[error("Malformed relay response: {0}")]
    Decode(String),
}

impl RelayError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, RelayError::Forbidden(_))
    }
}
