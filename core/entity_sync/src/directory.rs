//! Directory service protocol types
//!
//! The directory (master server) speaks small JSON envelopes: every
//! response carries either its payload fields or an `error`/`warning`
//! string. This module parses those envelopes and holds the typed
//! registry for queued out-of-band items delivered with renewals.
//!
//! Directory failures are values ([`DirectoryError`]), never panics:
//! a transient HTTP error and a structured `error` field both flatten
//! to an error kind the caller logs and recovers from.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Error Types
// ============================================================================

/// Why a directory call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Transport-level failure: DNS, connect, timeout
    Unreachable(String),
    /// Non-success HTTP status
    Http(u16),
    /// The service answered with a structured `error` field
    Denied(String),
    /// Response body did not parse as the expected envelope
    Malformed(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryError::Unreachable(e) => write!(f, "directory unreachable: {}", e),
            DirectoryError::Http(status) => write!(f, "directory returned http {}", status),
            DirectoryError::Denied(msg) => write!(f, "directory error: {}", msg),
            DirectoryError::Malformed(e) => write!(f, "malformed directory response: {}", e),
        }
    }
}

impl std::error::Error for DirectoryError {}

// ============================================================================
// Envelope Handling
// ============================================================================

/// Parse a response body and unwrap the success/error envelope.
///
/// A `warning` field is logged and otherwise ignored; an `error` field
/// becomes [`DirectoryError::Denied`].
pub fn parse_envelope(body: &str) -> Result<Value, DirectoryError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| DirectoryError::Malformed(e.to_string()))?;

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(DirectoryError::Denied(error.to_string()));
    }
    if let Some(warning) = value.get("warning").and_then(Value::as_str) {
        log::warn!("directory warning: {}", warning);
    }

    Ok(value)
}

// ============================================================================
// Session Grant
// ============================================================================

/// Lease returned by `getSession` and `renewSession`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionGrant {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Single-use token authorizing the next signed stat update
    pub nonce: String,
    /// Out-of-band items queued for this peer since the last renewal
    #[serde(default)]
    pub queue: Vec<QueueItem>,
}

/// Parse a session grant out of an already-unwrapped envelope.
pub fn parse_session_grant(value: &Value) -> Result<SessionGrant, DirectoryError> {
    serde_json::from_value(value.clone()).map_err(|e| DirectoryError::Malformed(e.to_string()))
}

// ============================================================================
// Queue Items
// ============================================================================

/// An out-of-band item delivered by the directory alongside a renewal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueItem {
    /// Event-type tag selecting the handler
    #[serde(rename = "type")]
    pub kind: String,
    /// Handler-specific payload
    #[serde(default)]
    pub data: Value,
}

/// Handler for one queue-item kind. Runs on the renewal watchdog thread.
pub type QueueItemHandler = Box<dyn Fn(&QueueItem) + Send + Sync>;

/// Typed dispatch table for queue items, keyed by their kind string.
#[derive(Default)]
pub struct QueueItemRegistry {
    handlers: HashMap<String, QueueItemHandler>,
}

impl QueueItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one item kind.
    ///
    /// # Panics
    ///
    /// Panics on double registration (caller defect).
    pub fn register(&mut self, kind: impl Into<String>, handler: QueueItemHandler) {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            panic!("queue item handler already registered for '{}'", kind);
        }
        self.handlers.insert(kind, handler);
    }

    /// Drain a batch of items through their handlers. Items with no
    /// registered handler are logged and skipped.
    pub fn dispatch_all(&self, items: &[QueueItem]) {
        for item in items {
            match self.handlers.get(&item.kind) {
                Some(handler) => handler(item),
                None => log::debug!("no handler for queue item kind '{}'", item.kind),
            }
        }
    }
}

// ============================================================================
// Session Records
// ============================================================================

/// A published session found via `findBySessionVariable`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionRecord {
    /// Player/process name the session was published under
    pub name: String,
    /// Published key/value variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl SessionRecord {
    /// Whether this session published itself as the authoritative host.
    pub fn is_host(&self) -> bool {
        self.variables.get("IsHost").map(String::as_str) == Some("1")
    }

    /// The published peer endpoint, defaulting the port if unpublished.
    pub fn endpoint(&self, default_port: u16) -> Option<SocketAddr> {
        let ip = self.variables.get("IP")?;
        let port = self
            .variables
            .get("Port")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(default_port);
        format!("{}:{}", ip, port).parse().ok()
    }
}

/// Parse the `results` array of a `findBySessionVariable` response.
pub fn parse_session_records(value: &Value) -> Result<Vec<SessionRecord>, DirectoryError> {
    let results = value.get("results").cloned().unwrap_or(Value::Array(vec![]));
    serde_json::from_value(results).map_err(|e| DirectoryError::Malformed(e.to_string()))
}

// ============================================================================
// Endpoint Configuration
// ============================================================================

/// One entry of the remote endpoint-configuration document. The document
/// lets the directory service relocate without shipping a new release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointEntry {
    pub name: String,
    pub url: String,
}

/// Find the directory base URL for a named deployment.
pub fn find_endpoint(body: &str, name: &str) -> Result<Option<String>, DirectoryError> {
    let entries: Vec<EndpointEntry> =
        serde_json::from_str(body).map_err(|e| DirectoryError::Malformed(e.to_string()))?;
    Ok(entries.into_iter().find(|e| e.name == name).map(|e| e.url))
}

// ============================================================================
// Tests
// ============================================================================
