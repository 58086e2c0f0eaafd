//! Pairing payloads and the channel-open message format
//!
//! A pairing request travels out of band (QR code, deep link). The answer
//! travels in band as a sealed box inside a channel-open room message:
//!
//! ```text
//! @channel-open:@<hex hash of recipient key>:<relay host>:<hex sealed box>
//! ```

use super::P2pError;
use crate::crypto::{parse_public_key, sender_id};
use crate::store::PeerRecord;
use serde::{Deserialize, Serialize};

/// Protocol version announced in pairing payloads.
pub const PROTOCOL_VERSION: &str = "3";

/// Version assumed for counterparts that answer with a bare public key.
pub const LEGACY_VERSION: &str = "1";

const CHANNEL_OPEN_PREFIX: &str = "@channel-open";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMessageType {
    #[serde(rename = "p2p-pairing-request")]
    Request,
    #[serde(rename = "p2p-pairing-response")]
    Response,
}

/// Handshake info shared out of band by the side that waits for a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PairingMessageType,
    pub name: String,
    /// Absent in legacy requests; the answer is then a bare public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub public_key: String,
    pub relay_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

impl PairingRequest {
    /// Rebuild the request a stored peer was created from.
    pub fn from_peer_record(peer: &PeerRecord) -> Self {
        Self {
            id: peer.id.clone(),
            kind: PairingMessageType::Request,
            name: peer.name.clone(),
            version: (peer.version != LEGACY_VERSION).then(|| peer.version.clone()),
            public_key: peer.public_key.clone(),
            relay_server: peer.relay_server.clone(),
            icon: peer.icon.clone(),
            app_url: peer.app_url.clone(),
        }
    }

    pub fn to_peer_record(&self) -> Result<PeerRecord, P2pError> {
        let public_key = parse_public_key(&self.public_key)?;
        Ok(PeerRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            relay_server: self.relay_server.clone(),
            version: self
                .version
                .clone()
                .unwrap_or_else(|| LEGACY_VERSION.to_string()),
            sender_id: sender_id(&public_key),
            transport_target_id: None,
            icon: self.icon.clone(),
            app_url: self.app_url.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PairingMessageType,
    pub name: String,
    pub version: String,
    pub public_key: String,
    pub relay_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

/// A decoded pairing response plus the short id derived from its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedPairingResponse {
    #[serde(flatten)]
    pub response: PairingResponse,
    pub sender_id: String,
}

impl ExtendedPairingResponse {
    pub fn new(response: PairingResponse) -> Result<Self, P2pError> {
        let public_key = parse_public_key(&response.public_key)?;
        Ok(Self {
            sender_id: sender_id(&public_key),
            response,
        })
    }

    pub fn to_peer_record(&self) -> PeerRecord {
        let response = &self.response;
        PeerRecord {
            id: response.id.clone(),
            name: response.name.clone(),
            public_key: response.public_key.clone(),
            relay_server: response.relay_server.clone(),
            version: response.version.clone(),
            sender_id: self.sender_id.clone(),
            transport_target_id: None,
            icon: response.icon.clone(),
            app_url: response.app_url.clone(),
        }
    }
}

/// Decode the plaintext of a sealed pairing answer.
///
/// A bare hex public key is the legacy form; it carries no relay host, so
/// `default_relay_server` is assumed.
pub fn parse_pairing_response(
    plaintext: &str,
    default_relay_server: &str,
) -> Result<PairingResponse, P2pError> {
    if let Ok(response) = serde_json::from_str::<PairingResponse>(plaintext) {
        parse_public_key(&response.public_key)?;
        return Ok(response);
    }

    let legacy_key = plaintext.trim();
    parse_public_key(legacy_key)
        .map_err(|_| P2pError::InvalidPairing("neither a pairing response nor a key".to_string()))?;
    Ok(PairingResponse {
        id: String::new(),
        kind: PairingMessageType::Response,
        name: String::new(),
        version: LEGACY_VERSION.to_string(),
        public_key: legacy_key.to_string(),
        relay_server: default_relay_server.to_string(),
        icon: None,
        app_url: None,
    })
}

/// `@channel-open:<recipient>:<hex sealed box>`
pub fn channel_open_message(recipient: &str, sealed_hex: &str) -> String {
    [CHANNEL_OPEN_PREFIX, recipient, sealed_hex].join(":")
}

/// True if `body` opens a channel towards the key hashing to `own_hash`.
pub fn is_channel_open_for(body: &str, own_hash: &str) -> bool {
    body.starts_with(&format!("{}:@{}", CHANNEL_OPEN_PREFIX, own_hash))
}

/// Sealed payload of a channel-open message addressed to `own_hash`.
pub fn channel_open_payload<'a>(body: &'a str, own_hash: &str) -> Option<&'a str> {
    if !is_channel_open_for(body, own_hash) {
        return None;
    }
    body.rsplit(':').next().filter(|payload| !payload.is_empty())
}

/// Progress of one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    AwaitingResponse,
    Paired { public_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// Our request went out of band; wait for the in-band answer
    RequestShared,
    /// A channel-open answer decoded
    ResponseReceived { public_key: String },
    /// A request was answered directly (wallet side)
    ResponseSent { public_key: String },
    Unpaired,
}

impl PairingState {
    pub fn apply(self, event: PairingEvent) -> Result<PairingState, P2pError> {
        use PairingEvent as E;
        use PairingState as S;

        match (self, event) {
            (_, E::Unpaired) => Ok(S::Unpaired),
            (_, E::RequestShared) => Ok(S::AwaitingResponse),
            (S::AwaitingResponse, E::ResponseReceived { public_key })
            | (S::Unpaired, E::ResponseSent { public_key })
            | (S::Paired { .. }, E::ResponseReceived { public_key })
            | (S::Paired { .. }, E::ResponseSent { public_key }) => Ok(S::Paired { public_key }),
            (state, event) => Err(P2pError::InvalidPairing(format!(
                "{:?} is not valid in state {:?}",
                event, state
            ))),
        }
    }
}
