//! Peer message dispatch
//!
//! Routes inbound frames to the handler registered for their
//! (category, code) pair and provides the host-side fan-out primitive.
//! Runs on the single logical simulation tick: handlers execute
//! synchronously and must not block.
//!
//! The transport itself is an external collaborator behind
//! [`PeerTransport`]; this module never touches sockets.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::cache::{MessageCache, SWEEP_INTERVAL};
use crate::wire::{encode_frame, NetworkMessage, PeerId, PayloadWriter, SharedMessage};

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Connection abstraction over the peer transport.
///
/// `recv` pulls one inbound frame; `poll_event` pulls one connection
/// state change. Both return `None` when drained for the tick.
pub trait PeerTransport {
    fn send(&mut self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError>;

    /// Host-only fan-out: deliver a frame to every connected peer except
    /// the excluded one.
    fn send_to_all_except(
        &mut self,
        frame: &[u8],
        excluded: Option<PeerId>,
    ) -> Result<(), TransportError>;

    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)>;

    fn poll_event(&mut self) -> Option<PeerEvent>;

    /// The peer outbound traffic defaults to: the host connection on a
    /// client, `None` on a host (hosts address peers explicitly).
    fn active_peer(&self) -> Option<PeerId>;
}

/// Attribute value applied to a resolved entity.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Text(String),
}

/// The surrounding game/world layer the core applies changes against.
pub trait EntityWorld {
    /// Does an entity with this network identifier exist locally?
    fn has_local_representation(&self, network_id: i32) -> bool;

    /// Apply a now-resolved attribute change to the entity.
    fn apply_attribute(&mut self, network_id: i32, attribute: &str, value: AttributeValue);
}

// ============================================================================
// Events
// ============================================================================

/// Connection state changes surfaced to the embedding process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A connection finished its handshake
    ConnectionEstablished { peer: PeerId },
    /// A connection dropped. `peer` is the last known identity, or
    /// `None` when the handshake never completed.
    ConnectionLost {
        peer: Option<PeerId>,
        reason: String,
    },
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Handler callback bound to a (category, code) pair.
pub type MessageHandler = Rc<dyn Fn(&mut HandlerContext<'_>, &SharedMessage)>;

/// Everything a handler may touch while running on the tick.
pub struct HandlerContext<'a> {
    pub cache: &'a mut MessageCache,
    pub world: &'a mut dyn EntityWorld,
    pub transport: &'a mut dyn PeerTransport,
    pub is_host: bool,
}

impl HandlerContext<'_> {
    /// Host-only: mirror an inbound message verbatim to every other
    /// connected client, so sibling peers see attribute changes without
    /// the host re-deriving them.
    pub fn send_to_all_except(&mut self, msg: &SharedMessage) {
        if !self.is_host {
            return;
        }
        let frame = msg.to_frame();
        if let Err(e) = self
            .transport
            .send_to_all_except(&frame, Some(msg.sender()))
        {
            log::warn!("broadcast of {}/{} failed: {}", msg.category(), msg.code(), e);
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound frames and owns the deferred-message cache.
pub struct MessageDispatcher {
    handlers: HashMap<(String, i32), MessageHandler>,
    cache: MessageCache,
    events: Vec<PeerEvent>,
    is_host: bool,
    last_sweep: Instant,
}

impl MessageDispatcher {
    pub fn new(is_host: bool) -> Self {
        MessageDispatcher {
            handlers: HashMap::new(),
            cache: MessageCache::new(),
            events: Vec::new(),
            is_host,
            last_sweep: Instant::now(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Register the handler for a (category, code) pair.
    ///
    /// # Panics
    ///
    /// Panics on double registration; that is a defect in the calling
    /// code, not a runtime condition.
    pub fn add_user_data_handler(
        &mut self,
        category: impl Into<String>,
        code: i32,
        handler: MessageHandler,
    ) {
        let key = (category.into(), code);
        if self.handlers.contains_key(&key) {
            panic!("handler already registered for {}/{}", key.0, key.1);
        }
        self.handlers.insert(key, handler);
    }

    /// Drain inbound frames for this tick, dispatching each to its
    /// registered handler, then run the cache sweep at its cadence.
    pub fn process_queue(
        &mut self,
        transport: &mut dyn PeerTransport,
        world: &mut dyn EntityWorld,
    ) {
        while let Some(event) = transport.poll_event() {
            self.events.push(event);
        }

        while let Some((sender, frame)) = transport.recv() {
            let msg = match NetworkMessage::decode(sender, &frame) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("dropping undecodable frame from {}: {}", sender, e);
                    continue;
                }
            };

            let key = (msg.category().to_string(), msg.code());
            let handler = match self.handlers.get(&key) {
                Some(h) => Rc::clone(h),
                None => {
                    log::debug!("no handler registered for {}/{}", key.0, key.1);
                    continue;
                }
            };

            let msg: SharedMessage = Rc::new(msg);
            msg.bind_handler(Rc::clone(&handler));

            let mut ctx = HandlerContext {
                cache: &mut self.cache,
                world,
                transport,
                is_host: self.is_host,
            };
            handler(&mut ctx, &msg);
        }

        if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
            self.last_sweep = Instant::now();
            self.process_cache(transport, world);
        }
    }

    /// Run one deferred-message sweep: replay every still-live cached
    /// message through its bound handler, then evict expired and
    /// fully-drained entries.
    pub fn process_cache(
        &mut self,
        transport: &mut dyn PeerTransport,
        world: &mut dyn EntityWorld,
    ) {
        let now = Instant::now();
        let replay = self.cache.begin_sweep(now);

        for msg in &replay {
            let handler = match msg.handler() {
                Some(h) => h,
                None => continue,
            };
            // Replays must observe the payload from the start
            msg.reset_cursor();
            let mut ctx = HandlerContext {
                cache: &mut self.cache,
                world,
                transport,
                is_host: self.is_host,
            };
            handler(&mut ctx, msg);
        }

        let stats = self.cache.finish_sweep(now);
        if stats.expired > 0 || stats.drained > 0 {
            log::debug!(
                "cache sweep: {} replayed, {} expired, {} drained",
                stats.replayed,
                stats.expired,
                stats.drained
            );
        }
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut MessageCache {
        &mut self.cache
    }

    /// Drain connection events gathered since the last call.
    pub fn take_events(&mut self) -> Vec<PeerEvent> {
        std::mem::take(&mut self.events)
    }
}

// ============================================================================
// Outbound Helpers
// ============================================================================

/// Serialize and send a message to the currently active peer.
///
/// Returns false (with a warn log) when no connection is active or the
/// category does not fit the header.
pub fn send_message(
    transport: &mut dyn PeerTransport,
    category: &str,
    code: i32,
    payload: &[u8],
) -> bool {
    let frame = match encode_frame(category, code, payload) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("cannot encode {}/{}: {}", category, code, e);
            return false;
        }
    };

    let peer = match transport.active_peer() {
        Some(p) => p,
        None => {
            log::warn!("dropping {}/{}: no active connection", category, code);
            return false;
        }
    };

    match transport.send(peer, &frame) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("send of {}/{} failed: {}", category, code, e);
            false
        }
    }
}

/// Send a message whose payload is a single network identifier.
pub fn send_with_network_id(
    transport: &mut dyn PeerTransport,
    category: &str,
    code: i32,
    network_id: i32,
) -> bool {
    let mut w = PayloadWriter::new();
    w.write_i32(network_id);
    send_message(transport, category, code, &w.finish())
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the peer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No usable connection for this operation
    NotConnected,
    /// Underlying socket failure
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::Io(e) => write!(f, "transport i/o error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Tests
// ============================================================================
