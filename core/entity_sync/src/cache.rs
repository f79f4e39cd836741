//! Deferred-message cache
//!
//! Entities are created asynchronously, so a message referencing a
//! network identifier can arrive before the local representation of
//! that entity exists. Rather than blocking dispatch, such messages are
//! parked here and replayed on a fixed cadence until their handler can
//! complete or their TTL passes.
//!
//! The cache also tracks identifiers announced as "about to exist" so
//! handlers can tell "not yet created" apart from "will never exist".
//!
//! # Sweep protocol
//!
//! The sweep is split in two phases so a handler replayed mid-sweep can
//! re-add its own message without fighting the iteration:
//!
//! 1. [`MessageCache::begin_sweep`] expires pending identifiers, marks
//!    every currently cached entry, and returns the replay list.
//! 2. The dispatcher invokes each bound handler exactly once.
//! 3. [`MessageCache::finish_sweep`] decrements only the marked entries
//!    and evicts the ones that expired or reached zero references.
//!
//! A handler that calls `add_message` on its own message during step 2
//! raises the count before the decrement in step 3, so the entry
//! survives the sweep with its count unchanged.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::wire::SharedMessage;

// ============================================================================
// Constants
// ============================================================================

/// Default TTL for cached messages and pending identifiers (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Cadence at which the dispatcher runs the sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Cache Entries
// ============================================================================

/// A parked message awaiting replay
struct CachedMessage {
    msg: SharedMessage,
    expires_at: Instant,
    /// Number of outstanding deferrals; starts at 1, incremented by
    /// re-submission, decremented once per sweep after replay.
    ref_count: u32,
    /// Set by `begin_sweep` so `finish_sweep` only touches entries that
    /// existed when the sweep started.
    in_sweep: bool,
}

/// Counters reported by `finish_sweep`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries replayed this sweep
    pub replayed: usize,
    /// Entries dropped because their TTL passed
    pub expired: usize,
    /// Entries dropped because their reference count reached zero
    pub drained: usize,
}

// ============================================================================
// Message Cache
// ============================================================================

/// Buffers not-yet-applicable messages and recently announced identifiers.
///
/// Single-threaded by contract: all calls happen on the simulation tick.
pub struct MessageCache {
    /// Parked messages in insertion order (replay is first-in first)
    queue: Vec<CachedMessage>,
    /// Network identifiers announced as "about to exist", with expiry
    pending_ids: HashMap<i32, Instant>,
}

impl MessageCache {
    pub fn new() -> Self {
        MessageCache {
            queue: Vec::new(),
            pending_ids: HashMap::new(),
        }
    }

    /// Park a message, or bump its reference count if already parked.
    ///
    /// Identity is `Rc` pointer identity: re-submitting the same received
    /// message never creates a second entry, it re-arms the existing one.
    /// A fresh insert resets the message's read cursor.
    pub fn add_message(&mut self, msg: &SharedMessage, timeout: Duration) {
        if let Some(entry) = self
            .queue
            .iter_mut()
            .find(|e| Rc::ptr_eq(&e.msg, msg))
        {
            entry.ref_count += 1;
            log::debug!(
                "re-armed cached message {}/{} (refs={})",
                msg.category(),
                msg.code(),
                entry.ref_count
            );
            return;
        }

        msg.reset_cursor();
        self.queue.push(CachedMessage {
            msg: Rc::clone(msg),
            expires_at: Instant::now() + timeout,
            ref_count: 1,
            in_sweep: false,
        });
        log::debug!(
            "cached message {}/{} for up to {:?}",
            msg.category(),
            msg.code(),
            timeout
        );
    }

    /// Park a message with the default 5-second TTL.
    pub fn add_message_default(&mut self, msg: &SharedMessage) {
        self.add_message(msg, DEFAULT_TIMEOUT);
    }

    /// Record that an entity with this network identifier was announced.
    ///
    /// Repeat announcements overwrite the expiry, they never error.
    pub fn add_recently_created_id(&mut self, network_id: i32) {
        self.pending_ids
            .insert(network_id, Instant::now() + DEFAULT_TIMEOUT);
    }

    /// Whether this identifier was announced recently.
    ///
    /// Pure lookup; expiry is only evaluated by the sweep.
    pub fn has_id_been_created_recently(&self, network_id: i32) -> bool {
        self.pending_ids.contains_key(&network_id)
    }

    /// Identity-based membership test.
    pub fn is_in_queue(&self, msg: &SharedMessage) -> bool {
        self.queue.iter().any(|e| Rc::ptr_eq(&e.msg, msg))
    }

    /// Number of parked messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current reference count of a parked message, if present.
    pub fn ref_count_of(&self, msg: &SharedMessage) -> Option<u32> {
        self.queue
            .iter()
            .find(|e| Rc::ptr_eq(&e.msg, msg))
            .map(|e| e.ref_count)
    }

    /// Phase 1 of the sweep: expire pending identifiers, mark every
    /// current entry, and return the not-yet-expired ones for replay
    /// in insertion order.
    pub fn begin_sweep(&mut self, now: Instant) -> Vec<SharedMessage> {
        self.pending_ids.retain(|id, expires_at| {
            let keep = *expires_at > now;
            if !keep {
                log::debug!("pending network id {} expired unobserved", id);
            }
            keep
        });

        let mut replay = Vec::new();
        for entry in &mut self.queue {
            entry.in_sweep = true;
            if entry.expires_at > now {
                replay.push(Rc::clone(&entry.msg));
            }
        }
        replay
    }

    /// Phase 3 of the sweep: decrement and evict the entries marked by
    /// `begin_sweep`. Entries added during replay are left untouched.
    ///
    /// `now` must be the same instant passed to `begin_sweep` so expiry
    /// is evaluated exactly once per sweep.
    pub fn finish_sweep(&mut self, now: Instant) -> SweepStats {
        let mut stats = SweepStats::default();

        self.queue.retain_mut(|entry| {
            if !entry.in_sweep {
                return true;
            }
            entry.in_sweep = false;

            if entry.expires_at <= now {
                stats.expired += 1;
                log::debug!(
                    "cached message {}/{} timed out",
                    entry.msg.category(),
                    entry.msg.code()
                );
                return false;
            }

            stats.replayed += 1;
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                stats.drained += 1;
                return false;
            }
            true
        });

        stats
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{NetworkMessage, PeerId};
    use std::thread;

    fn make_msg(code: i32) -> SharedMessage {
        Rc::new(NetworkMessage::new("entity", code, vec![1, 2, 3], PeerId(1)))
    }

    /// Run a full sweep without replaying anything (no dispatcher here).
    fn sweep(cache: &mut MessageCache) -> SweepStats {
        let now = Instant::now();
        let _replay = cache.begin_sweep(now);
        cache.finish_sweep(now)
    }

    #[test]
    fn test_add_message_inserts_once() {
        let mut cache = MessageCache::new();
        let msg = make_msg(1);

        cache.add_message_default(&msg);
        cache.add_message_default(&msg);

        assert_eq!(cache.len(), 1);
        assert!(cache.is_in_queue(&msg));
        assert_eq!(cache.ref_count_of(&msg), Some(2));
    }

    #[test]
    fn test_identity_not_content_equality() {
        let mut cache = MessageCache::new();
        let a = make_msg(1);
        // Same bytes, different received instance
        let b = make_msg(1);

        cache.add_message_default(&a);
        cache.add_message_default(&b);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.ref_count_of(&a), Some(1));
        assert_eq!(cache.ref_count_of(&b), Some(1));
    }

    #[test]
    fn test_reference_counting_across_sweeps() {
        let mut cache = MessageCache::new();
        let msg = make_msg(1);

        cache.add_message_default(&msg);
        cache.add_message_default(&msg);
        assert_eq!(cache.ref_count_of(&msg), Some(2));

        // First sweep decrements to 1, does not evict
        sweep(&mut cache);
        assert_eq!(cache.ref_count_of(&msg), Some(1));
        assert!(cache.is_in_queue(&msg));

        // Second sweep evicts
        sweep(&mut cache);
        assert!(!cache.is_in_queue(&msg));
    }

    #[test]
    fn test_timeout_eviction_without_replay() {
        let mut cache = MessageCache::new();
        let msg = make_msg(1);

        cache.add_message(&msg, Duration::from_millis(50));
        assert!(cache.is_in_queue(&msg));

        thread::sleep(Duration::from_millis(80));

        let now = Instant::now();
        let replay = cache.begin_sweep(now);
        // Expired entries are never offered for replay
        assert!(replay.is_empty());

        let stats = cache.finish_sweep(now);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.replayed, 0);
        assert!(!cache.is_in_queue(&msg));
    }

    #[test]
    fn test_replay_resurrection_keeps_entry() {
        let mut cache = MessageCache::new();
        let msg = make_msg(1);

        cache.add_message_default(&msg);
        assert_eq!(cache.ref_count_of(&msg), Some(1));

        let now = Instant::now();
        let replay = cache.begin_sweep(now);
        assert_eq!(replay.len(), 1);

        // Handler re-arms itself during replay
        cache.add_message_default(&msg);
        assert_eq!(cache.ref_count_of(&msg), Some(2));

        cache.finish_sweep(now);

        // Net count unchanged, not evicted
        assert!(cache.is_in_queue(&msg));
        assert_eq!(cache.ref_count_of(&msg), Some(1));
    }

    #[test]
    fn test_message_added_during_sweep_not_decremented() {
        let mut cache = MessageCache::new();
        let old = make_msg(1);
        let fresh = make_msg(2);

        cache.add_message_default(&old);

        let now = Instant::now();
        cache.begin_sweep(now);
        // A different message arrives mid-sweep
        cache.add_message_default(&fresh);
        cache.finish_sweep(now);

        assert!(!cache.is_in_queue(&old));
        assert!(cache.is_in_queue(&fresh));
        assert_eq!(cache.ref_count_of(&fresh), Some(1));
    }

    #[test]
    fn test_replay_order_is_insertion_order() {
        let mut cache = MessageCache::new();
        let first = make_msg(1);
        let second = make_msg(2);
        let third = make_msg(3);

        cache.add_message_default(&first);
        cache.add_message_default(&second);
        cache.add_message_default(&third);

        let replay = cache.begin_sweep(Instant::now());
        let codes: Vec<i32> = replay.iter().map(|m| m.code()).collect();
        assert_eq!(codes, vec![1, 2, 3]);
    }

    #[test]
    fn test_pending_id_lookup_and_expiry() {
        let mut cache = MessageCache::new();

        cache.add_recently_created_id(7);
        assert!(cache.has_id_been_created_recently(7));
        assert!(!cache.has_id_been_created_recently(8));

        // Lookup does not sweep
        assert!(cache.has_id_been_created_recently(7));

        // Simulate the TTL passing by sweeping with a future clock
        let future = Instant::now() + DEFAULT_TIMEOUT + Duration::from_millis(1);
        cache.begin_sweep(future);
        cache.finish_sweep(future);

        assert!(!cache.has_id_been_created_recently(7));
    }

    #[test]
    fn test_pending_id_reannounce_overwrites() {
        let mut cache = MessageCache::new();
        cache.add_recently_created_id(42);
        cache.add_recently_created_id(42);
        assert!(cache.has_id_been_created_recently(42));
    }

    #[test]
    fn test_fresh_insert_resets_cursor() {
        let mut cache = MessageCache::new();
        let msg = make_msg(1);

        // Advance the cursor as a handler would
        let _ = msg.read_u8();

        cache.add_message_default(&msg);
        assert_eq!(msg.read_u8().unwrap(), 1);
    }
}
