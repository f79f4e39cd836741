//! Peer state-synchronization agent
//!
//! Wires the `entity_sync` core to the real world: a mio TCP transport
//! between peers, the blocking HTTP client for the directory service,
//! role bootstrap, and the entity message vocabulary.

pub mod bootstrap;
pub mod handlers;
pub mod master;
pub mod metrics;
pub mod transport;
pub mod world;
