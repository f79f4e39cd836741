//! Entity synchronization core
//!
//! This crate provides the protocol core shared by the host and client
//! roles of the peer state-synchronization agent:
//! - Wire codec for category + code addressed application messages
//! - Deferred-message cache with TTL expiry and replay
//! - Handler registry and per-tick message dispatch
//! - Directory-service session state machine and envelope types
//!
//! No I/O happens here. The peer transport and the directory HTTP client
//! are collaborators supplied by the embedding process.

pub mod cache;
pub mod directory;
pub mod dispatch;
pub mod session;
pub mod wire;

// Re-export commonly used types
pub use cache::{MessageCache, SweepStats, DEFAULT_TIMEOUT, SWEEP_INTERVAL};
pub use directory::{
    DirectoryError, QueueItem, QueueItemHandler, QueueItemRegistry, SessionGrant, SessionRecord,
};
pub use dispatch::{
    send_message, send_with_network_id, AttributeValue, EntityWorld, HandlerContext,
    MessageDispatcher, MessageHandler, PeerEvent, PeerTransport, TransportError,
};
pub use session::{
    jittered_renewal_interval, sign_stat_update, RenewalAction, RenewalPolicy, SessionEvent,
    SessionState, MAX_RENEWAL_FAILURES,
};
pub use wire::{
    encode_frame, DecodeError, EncodeError, NetworkMessage, PayloadWriter, PeerId, ReadError,
    SharedMessage,
};
