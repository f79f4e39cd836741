//! Directory session state machine
//!
//! The pure part of the session lifecycle: states, the bounded renewal
//! retry policy, the jittered renewal interval, and the signed
//! stat-update signature. The HTTP calls themselves live in the agent's
//! master-server client; this module decides, the client executes.

use std::fmt;
use std::time::Duration;

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Consecutive renewal failures tolerated before a brand-new session is
/// requested instead.
pub const MAX_RENEWAL_FAILURES: u32 = 3;

/// Lower bound of the randomized renewal interval
pub const RENEWAL_INTERVAL_MIN: Duration = Duration::from_millis(5000);

/// Width of the randomized renewal window (interval is in [min, min+span))
pub const RENEWAL_INTERVAL_SPAN_MS: u64 = 20_000;

/// Constant appended to the nonce before hashing a signed stat update.
/// Must match the directory service's expectation.
const STAT_SIGNATURE_SALT: &str = "entity-sync-stat-v1";

// ============================================================================
// Session State
// ============================================================================

/// Relationship of the local peer to the directory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session requested yet
    None,
    /// Session acquisition or recovery in progress
    Pending,
    /// Session leased and being renewed
    Connected,
    /// The last acquisition attempt ended in error. Terminal for that
    /// attempt; a later `initialize_connection` may retry.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::None => "none",
            SessionState::Pending => "pending",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Session lifecycle notifications drained by the tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionEstablished,
    SessionFailed { reason: String },
}

// ============================================================================
// Renewal Policy
// ============================================================================

/// What the renewal watchdog should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalAction {
    /// Renew the existing session
    Renew,
    /// Too many consecutive failures: request a brand-new session
    RequestNewSession,
}

/// Bounded retry policy for session renewal.
///
/// Counts attempts since the last success. Once the counter reaches
/// [`MAX_RENEWAL_FAILURES`], renewal is abandoned in favor of a fresh
/// `getSession`; its success resets the counter, its failure leaves the
/// watchdog to try again next tick.
#[derive(Debug, Default)]
pub struct RenewalPolicy {
    failed_attempts: u32,
}

impl RenewalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide and account for the next attempt.
    pub fn begin_attempt(&mut self) -> RenewalAction {
        if self.failed_attempts >= MAX_RENEWAL_FAILURES {
            RenewalAction::RequestNewSession
        } else {
            self.failed_attempts += 1;
            RenewalAction::Renew
        }
    }

    /// A renewal or new-session request succeeded.
    pub fn record_success(&mut self) {
        self.failed_attempts = 0;
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}

// ============================================================================
// Renewal Jitter
// ============================================================================

/// Randomized renewal interval in [5000, 25000) ms.
///
/// The jitter keeps a fleet of peers from synchronizing their renewal
/// calls into storms against the directory service. Falls back to the
/// window midpoint if the system RNG fails.
pub fn jittered_renewal_interval(rng: &SystemRandom) -> Duration {
    let mut buf = [0u8; 8];
    if rng.fill(&mut buf).is_err() {
        log::warn!("system rng unavailable, using fixed renewal interval");
        return RENEWAL_INTERVAL_MIN + Duration::from_millis(RENEWAL_INTERVAL_SPAN_MS / 2);
    }
    let r = u64::from_ne_bytes(buf) % RENEWAL_INTERVAL_SPAN_MS;
    RENEWAL_INTERVAL_MIN + Duration::from_millis(r)
}

// ============================================================================
// Stat Signatures
// ============================================================================

/// Compute the signature for a signed stat-update call:
/// lowercase hex of `SHA-256(nonce ++ salt)`.
///
/// The nonce is single-use; the directory returns a fresh one with every
/// successful signed call and rejects replays of old values.
pub fn sign_stat_update(nonce: &str) -> String {
    let mut input = Vec::with_capacity(nonce.len() + STAT_SIGNATURE_SALT.len());
    input.extend_from_slice(nonce.as_bytes());
    input.extend_from_slice(STAT_SIGNATURE_SALT.as_bytes());

    let hash = digest::digest(&digest::SHA256, &input);
    let mut hex = String::with_capacity(hash.as_ref().len() * 2);
    for byte in hash.as_ref() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_under_threshold() {
        let mut policy = RenewalPolicy::new();

        assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
        assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
        assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
        assert_eq!(policy.failed_attempts(), 3);
    }

    #[test]
    fn test_three_failures_trigger_new_session() {
        let mut policy = RenewalPolicy::new();

        // Three renewals attempted, none recorded as successful
        for _ in 0..3 {
            assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
        }

        // Fourth tick abandons renewal for a fresh session
        assert_eq!(policy.begin_attempt(), RenewalAction::RequestNewSession);
        // ...and keeps asking for one until something succeeds
        assert_eq!(policy.begin_attempt(), RenewalAction::RequestNewSession);

        policy.record_success();
        assert_eq!(policy.failed_attempts(), 0);
        assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
    }

    #[test]
    fn test_success_mid_stride_resets() {
        let mut policy = RenewalPolicy::new();

        policy.begin_attempt();
        policy.begin_attempt();
        policy.record_success();

        assert_eq!(policy.failed_attempts(), 0);
        assert_eq!(policy.begin_attempt(), RenewalAction::Renew);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let rng = SystemRandom::new();
        for _ in 0..100 {
            let interval = jittered_renewal_interval(&rng);
            assert!(interval >= Duration::from_millis(5000));
            assert!(interval < Duration::from_millis(25_000));
        }
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = sign_stat_update("abc");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_depends_on_nonce() {
        assert_ne!(sign_stat_update("nonce-1"), sign_stat_update("nonce-2"));
        assert_eq!(sign_stat_update("nonce-1"), sign_stat_update("nonce-1"));
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(format!("{}", SessionState::None), "none");
        assert_eq!(format!("{}", SessionState::Connected), "connected");
    }
}
