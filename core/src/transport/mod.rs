// Transport module: one contract, relay and post-message implementations

pub mod abstraction;
pub mod p2p;
pub mod post_message;

pub use abstraction::{
    ConnectionContext, ListenerRegistry, NewPeerCallback, Origin, PairingRole, StatusCell,
    Transport, TransportError, TransportKind, TransportListener, TransportListenerId,
    TransportStatus,
};
pub use p2p::P2PTransport;
pub use post_message::{
    available_extensions, is_available, Endpoint, MessageBus, MessageTarget,
    PairingRequestCallback, PostMessagePairingRequest, PostMessagePairingResponse,
    PostMessagePairingType, PostMessageTransport, WindowMessage, WindowPayload,
};
