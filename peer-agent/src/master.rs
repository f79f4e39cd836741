//! Master-server (directory service) client
//!
//! Owns the session lease with the remote directory: acquisition,
//! periodic jittered renewal with bounded retry, peer discovery via
//! variable search, and the signed statistics calls.
//!
//! All HTTP runs on background threads through a blocking client so a
//! slow directory never stalls the simulation tick. The `session_id`
//! and `nonce` are shared between the renewal watchdog and signed
//! calls; each sits behind its own mutex, and signed calls additionally
//! hold a dedicated lock so only one is in flight at a time (the nonce
//! is single-use).
//!
//! Directory failures are values: every public call returns a
//! `Result<_, DirectoryError>` and is safe to log-and-ignore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ring::rand::SystemRandom;
use serde_json::Value;

use entity_sync::directory::{
    find_endpoint, parse_envelope, parse_session_grant, parse_session_records, DirectoryError,
    QueueItem, QueueItemRegistry, SessionGrant, SessionRecord,
};
use entity_sync::session::{
    jittered_renewal_interval, sign_stat_update, RenewalAction, RenewalPolicy, SessionEvent,
    SessionState,
};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for individual directory HTTP calls
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Sentinel published when the public address could not be resolved
const NO_ADDRESS: &str = "none";

// ============================================================================
// Configuration
// ============================================================================

/// Static configuration for the directory client.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// URL probed to verify general internet reachability
    pub probe_url: String,
    /// URL returning the caller's public address as plain text
    pub address_echo_url: String,
    /// URL of the endpoint-configuration document
    pub endpoint_config_url: String,
    /// Which configuration entry names our directory deployment
    pub deployment: String,
    /// API key sent with session calls
    pub api_key: String,
    /// Identifying headers sent with every request
    pub app_name: String,
    pub app_version: String,
    pub hardware_id: String,
}

// ============================================================================
// Shared Session State
// ============================================================================

struct SessionShared {
    state: Mutex<SessionState>,
    /// Guarded separately from the nonce: read by the renewal thread,
    /// written on session responses
    session_id: Mutex<Option<String>>,
    /// Single-use token for the next signed stat update
    nonce: Mutex<Option<String>>,
    policy: Mutex<RenewalPolicy>,
    /// Held for the duration of one renewal so only one runs at a time
    renewal_guard: Mutex<()>,
    /// Held for the duration of one signed stat call
    stat_guard: Mutex<()>,
    events: Mutex<Vec<SessionEvent>>,
    base_url: Mutex<Option<String>>,
    public_address: Mutex<String>,
    server_available: AtomicBool,
    shutdown: AtomicBool,
}

impl SessionShared {
    fn new() -> Self {
        SessionShared {
            state: Mutex::new(SessionState::None),
            session_id: Mutex::new(None),
            nonce: Mutex::new(None),
            policy: Mutex::new(RenewalPolicy::new()),
            renewal_guard: Mutex::new(()),
            stat_guard: Mutex::new(()),
            events: Mutex::new(Vec::new()),
            base_url: Mutex::new(None),
            public_address: Mutex::new(NO_ADDRESS.to_string()),
            server_available: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// Master Client
// ============================================================================

pub struct MasterClient {
    http: reqwest::blocking::Client,
    config: MasterConfig,
    shared: Arc<SessionShared>,
    rng: SystemRandom,
}

impl MasterClient {
    pub fn new(config: MasterConfig) -> Result<Self, DirectoryError> {
        use reqwest::header::{HeaderMap, HeaderValue};

        let mut headers = HeaderMap::new();
        let pairs = [
            ("x-app-name", config.app_name.as_str()),
            ("x-app-version", config.app_version.as_str()),
            ("x-hardware-id", config.hardware_id.as_str()),
        ];
        for (name, value) in pairs {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        }

        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| DirectoryError::Unreachable(format!("http client: {}", e)))?;

        Ok(MasterClient {
            http,
            config,
            shared: Arc::new(SessionShared::new()),
            rng: SystemRandom::new(),
        })
    }

    /// Build a client with a known directory base URL, skipping the
    /// endpoint-configuration fetch. Used by tests and manual overrides.
    pub fn with_base_url(config: MasterConfig, base_url: &str) -> Result<Self, DirectoryError> {
        let client = Self::new(config)?;
        *client.shared.base_url.lock().unwrap() = Some(base_url.to_string());
        client.shared.server_available.store(true, Ordering::SeqCst);
        Ok(client)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().unwrap().clone()
    }

    pub fn is_server_available(&self) -> bool {
        self.shared.server_available.load(Ordering::SeqCst)
    }

    pub fn public_address(&self) -> String {
        self.shared.public_address.lock().unwrap().clone()
    }

    /// Drain session lifecycle events gathered since the last call.
    pub fn take_session_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.shared.events.lock().unwrap())
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock().unwrap() = state;
    }

    fn push_event(&self, event: SessionEvent) {
        self.shared.events.lock().unwrap().push(event);
    }

    fn base_url(&self) -> Result<String, DirectoryError> {
        self.shared
            .base_url
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DirectoryError::Unreachable("no directory endpoint".to_string()))
    }

    // ------------------------------------------------------------------
    // Session Lifecycle
    // ------------------------------------------------------------------

    /// Acquire a directory session: reachability probe, best-effort
    /// public address resolution, endpoint discovery, then `getSession`.
    ///
    /// Any failure lands in `Failed` with a `SessionFailed` event;
    /// `Failed` is terminal for this attempt but the whole call may be
    /// retried later. On success the renewal watchdog thread is started.
    pub fn initialize_connection(
        self: &Arc<Self>,
        registry: Arc<QueueItemRegistry>,
    ) -> SessionState {
        self.set_state(SessionState::Pending);

        // 1. General reachability
        if let Err(e) = self.probe_reachability() {
            log::warn!("internet reachability probe failed: {}", e);
            self.fail_session(format!("no internet connectivity: {}", e));
            return SessionState::Failed;
        }

        // 2. Public address, best effort
        match self.resolve_public_address() {
            Ok(addr) => *self.shared.public_address.lock().unwrap() = addr,
            Err(e) => {
                log::warn!("public address resolution failed, publishing '{}': {}", NO_ADDRESS, e);
            }
        }

        // 3. Directory endpoint from the remote configuration document
        match self.discover_endpoint() {
            Ok(Some(url)) => {
                *self.shared.base_url.lock().unwrap() = Some(url);
                self.shared.server_available.store(true, Ordering::SeqCst);
            }
            Ok(None) => {
                log::warn!(
                    "no endpoint configuration entry for deployment '{}'",
                    self.config.deployment
                );
                self.shared.server_available.store(false, Ordering::SeqCst);
                self.fail_session("directory service unavailable".to_string());
                return SessionState::Failed;
            }
            Err(e) => {
                self.fail_session(format!("endpoint discovery failed: {}", e));
                return SessionState::Failed;
            }
        }

        // 4. Lease the session
        match self.get_session(false) {
            Ok(grant) => {
                log::info!("directory session established: {}", grant.session_id);
                self.set_state(SessionState::Connected);
                self.push_event(SessionEvent::SessionEstablished);
                self.spawn_renewal_watchdog(registry);
                SessionState::Connected
            }
            Err(e) => {
                self.fail_session(format!("session request failed: {}", e));
                SessionState::Failed
            }
        }
    }

    fn fail_session(&self, reason: String) {
        log::warn!("session setup failed: {}", reason);
        self.set_state(SessionState::Failed);
        self.push_event(SessionEvent::SessionFailed { reason });
    }

    fn probe_reachability(&self) -> Result<(), DirectoryError> {
        let response = self
            .http
            .get(&self.config.probe_url)
            .send()
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Http(response.status().as_u16()));
        }
        Ok(())
    }

    fn resolve_public_address(&self) -> Result<String, DirectoryError> {
        let response = self
            .http
            .get(&self.config.address_echo_url)
            .send()
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Http(response.status().as_u16()));
        }
        let text = response
            .text()
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        Ok(text.trim().to_string())
    }

    fn discover_endpoint(&self) -> Result<Option<String>, DirectoryError> {
        let response = self
            .http
            .get(&self.config.endpoint_config_url)
            .send()
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Http(response.status().as_u16()));
        }
        let body = response
            .text()
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        find_endpoint(&body, &self.config.deployment)
    }

    /// Request a session lease and store its id and nonce.
    pub fn get_session(&self, no_extra: bool) -> Result<SessionGrant, DirectoryError> {
        let value = self.call(
            "getSession",
            &[
                ("apikey", self.config.api_key.as_str()),
                ("noExtra", if no_extra { "1" } else { "0" }),
            ],
        )?;
        let grant = parse_session_grant(&value)?;

        *self.shared.session_id.lock().unwrap() = Some(grant.session_id.clone());
        *self.shared.nonce.lock().unwrap() = Some(grant.nonce.clone());

        Ok(grant)
    }

    /// Renew the current lease. Returns the queued out-of-band items
    /// accompanying the response (empty when `exclude_queue`).
    pub fn renew_session(&self, exclude_queue: bool) -> Result<Vec<QueueItem>, DirectoryError> {
        let session_id = self
            .session_id()
            .ok_or_else(|| DirectoryError::Denied("no session to renew".to_string()))?;

        let value = self.call("renewSession", &[("session", session_id.as_str())])?;
        let grant = parse_session_grant(&value)?;

        *self.shared.session_id.lock().unwrap() = Some(grant.session_id.clone());
        *self.shared.nonce.lock().unwrap() = Some(grant.nonce.clone());

        if exclude_queue {
            Ok(Vec::new())
        } else {
            Ok(grant.queue)
        }
    }

    /// One watchdog tick: renew, or negotiate a fresh session after
    /// three consecutive failures. Guarded so only one renewal runs at
    /// a time; a tick arriving mid-renewal is skipped.
    pub fn renewal_tick(&self, registry: &QueueItemRegistry) {
        let _guard = match self.shared.renewal_guard.try_lock() {
            Ok(g) => g,
            Err(_) => {
                log::debug!("renewal already in progress, skipping tick");
                return;
            }
        };

        let action = self.shared.policy.lock().unwrap().begin_attempt();

        match action {
            RenewalAction::Renew => match self.renew_session(false) {
                Ok(items) => {
                    self.shared.policy.lock().unwrap().record_success();
                    self.set_state(SessionState::Connected);
                    registry.dispatch_all(&items);
                }
                Err(e) => {
                    // Non-fatal; retried next tick up to the 3-strikes rule
                    log::warn!("session renewal failed: {}", e);
                }
            },
            RenewalAction::RequestNewSession => {
                log::warn!("too many failed renewals, requesting a new session");
                match self.get_session(true) {
                    Ok(grant) => {
                        log::info!("replacement session established: {}", grant.session_id);
                        self.shared.policy.lock().unwrap().record_success();
                        self.set_state(SessionState::Connected);
                    }
                    Err(e) => {
                        log::warn!("replacement session request failed: {}", e);
                        self.set_state(SessionState::Pending);
                    }
                }
            }
        }
    }

    fn spawn_renewal_watchdog(self: &Arc<Self>, registry: Arc<QueueItemRegistry>) {
        let client = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("session-renewal".to_string())
            .spawn(move || {
                log::debug!("renewal watchdog started");
                while !client.shared.shutdown.load(Ordering::SeqCst) {
                    let interval = jittered_renewal_interval(&client.rng);
                    thread::sleep(interval);
                    if client.shared.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match client.state() {
                        SessionState::Connected | SessionState::Pending => {
                            client.renewal_tick(&registry);
                        }
                        _ => {}
                    }
                }
                log::debug!("renewal watchdog stopped");
            });
        if let Err(e) = spawned {
            log::warn!("could not start renewal watchdog: {}", e);
        }
    }

    /// Stop the renewal watchdog at the next wakeup. In-flight HTTP
    /// calls are abandoned with the process; no graceful drain.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Auxiliary Directory Operations
    // ------------------------------------------------------------------

    /// Publish a key/value variable on our session.
    pub fn set_session_variable(&self, key: &str, value: &str) -> Result<(), DirectoryError> {
        let session_id = self
            .session_id()
            .ok_or_else(|| DirectoryError::Denied("no session".to_string()))?;
        self.call(
            "setSessionVariable",
            &[("session", session_id.as_str()), ("key", key), ("value", value)],
        )?;
        Ok(())
    }

    /// Fire-and-forget variant of `set_session_variable` for publish
    /// operations that must not block the tick.
    pub fn set_session_variable_async(self: &Arc<Self>, key: &str, value: &str) {
        let client = Arc::clone(self);
        let key = key.to_string();
        let value = value.to_string();
        thread::spawn(move || {
            if let Err(e) = client.set_session_variable(&key, &value) {
                log::warn!("publishing {}={} failed: {}", key, value, e);
            }
        });
    }

    /// Search all published sessions by variable value.
    pub fn find_by_session_variable(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<SessionRecord>, DirectoryError> {
        let response = self.call("findBySessionVariable", &[("key", key), ("value", value)])?;
        parse_session_records(&response)
    }

    /// Queue an out-of-band item for one session.
    pub fn send_queue_item_to_session(
        &self,
        target_session: &str,
        kind: &str,
        data: &Value,
    ) -> Result<(), DirectoryError> {
        let data = data.to_string();
        self.call(
            "sendQueueItemToSession",
            &[("target", target_session), ("type", kind), ("data", data.as_str())],
        )?;
        Ok(())
    }

    /// Queue an out-of-band item for every live session.
    pub fn send_queue_item_to_all(&self, kind: &str, data: &Value) -> Result<(), DirectoryError> {
        let data = data.to_string();
        self.call("sendQueueItemToAll", &[("type", kind), ("data", data.as_str())])?;
        Ok(())
    }

    /// Fetch per-user data published by the directory.
    pub fn get_user_data(&self, user: &str) -> Result<Value, DirectoryError> {
        self.call("getUserData", &[("user", user)])
    }

    /// Fetch the latest released version string.
    pub fn get_latest_version(&self) -> Result<String, DirectoryError> {
        let value = self.call("getVersion", &[])?;
        value
            .get("version")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| DirectoryError::Malformed("missing version field".to_string()))
    }

    /// Upload a statistics blob (the one POST in the protocol).
    pub fn upload_statistics(&self, blob: &[u8]) -> Result<(), DirectoryError> {
        let base = self.base_url()?;
        let url = format!("{}/statisticFileUpload", base);

        let response = self
            .http
            .post(&url)
            .form(&[("data", String::from_utf8_lossy(blob).to_string())])
            .send()
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Http(response.status().as_u16()));
        }
        let body = response
            .text()
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        parse_envelope(&body)?;
        Ok(())
    }

    /// Signed stat manipulation. Holds the dedicated stat lock for the
    /// whole call so concurrent callers serialize: the second caller
    /// signs with the nonce returned by the first call's response,
    /// never the original (the server rejects replayed nonces).
    pub fn manipulate_stat(&self, stat: &str, amount: i64) -> Result<(), DirectoryError> {
        let _stat_guard = self.shared.stat_guard.lock().unwrap();

        let session_id = self
            .session_id()
            .ok_or_else(|| DirectoryError::Denied("no session".to_string()))?;
        let nonce = self
            .shared
            .nonce
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DirectoryError::Denied("no nonce".to_string()))?;

        let signature = sign_stat_update(&nonce);
        let amount = amount.to_string();
        let value = self.call(
            "manipulateStat",
            &[
                ("session", session_id.as_str()),
                ("stat", stat),
                ("amount", amount.as_str()),
                ("signature", signature.as_str()),
            ],
        )?;

        // Every successful signed call rotates the nonce
        let new_nonce = value
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| DirectoryError::Malformed("missing rotated nonce".to_string()))?;
        *self.shared.nonce.lock().unwrap() = Some(new_nonce.to_string());

        Ok(())
    }

    // ------------------------------------------------------------------
    // HTTP plumbing
    // ------------------------------------------------------------------

    /// Issue one GET against the directory and unwrap its envelope.
    fn call(&self, operation: &str, params: &[(&str, &str)]) -> Result<Value, DirectoryError> {
        let base = self.base_url()?;
        let url = format!("{}/{}", base, operation);

        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Http(response.status().as_u16()));
        }

        let body = response
            .text()
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        parse_envelope(&body)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;

    /// Minimal single-threaded HTTP server: answers `count` requests
    /// through `respond(path_and_query) -> body` and records each
    /// request target.
    struct TinyDirectory {
        base_url: String,
        requests: Arc<StdMutex<Vec<String>>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl TinyDirectory {
        fn start<F>(count: usize, respond: F) -> Self
        where
            F: Fn(&str) -> String + Send + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let requests: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

            let seen = Arc::clone(&requests);
            let handle = thread::spawn(move || {
                for _ in 0..count {
                    let (stream, _) = match listener.accept() {
                        Ok(v) => v,
                        Err(_) => return,
                    };
                    let mut reader = BufReader::new(stream);
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    // Drain headers (and any body we do not care about)
                    loop {
                        let mut line = String::new();
                        match reader.read_line(&mut line) {
                            Ok(_) if line == "\r\n" || line.is_empty() => break,
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }

                    let target = request_line
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("")
                        .to_string();
                    seen.lock().unwrap().push(target.clone());

                    let body = respond(&target);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let mut stream = reader.into_inner();
                    let _ = stream.write_all(response.as_bytes());
                }
            });

            TinyDirectory {
                base_url,
                requests: Arc::clone(&requests),
                handle: Some(handle),
            }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Drop for TinyDirectory {
        fn drop(&mut self) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn test_config() -> MasterConfig {
        MasterConfig {
            probe_url: "http://127.0.0.1:1/unused".to_string(),
            address_echo_url: "http://127.0.0.1:1/unused".to_string(),
            endpoint_config_url: "http://127.0.0.1:1/unused".to_string(),
            deployment: "production".to_string(),
            api_key: "test-key".to_string(),
            app_name: "peer-agent".to_string(),
            app_version: "0.1.0".to_string(),
            hardware_id: "hw-test".to_string(),
        }
    }

    #[test]
    fn test_get_session_stores_id_and_nonce() {
        let server = TinyDirectory::start(1, |_| {
            r#"{"sessionId":"sess-1","nonce":"n-1"}"#.to_string()
        });
        let client = MasterClient::with_base_url(test_config(), &server.base_url).unwrap();

        let grant = client.get_session(false).unwrap();
        assert_eq!(grant.session_id, "sess-1");
        assert_eq!(client.session_id(), Some("sess-1".to_string()));

        let requests = server.requests();
        assert!(requests[0].starts_with("/getSession?"));
        assert!(requests[0].contains("apikey=test-key"));
    }

    #[test]
    fn test_directory_error_envelope_flattens() {
        let server = TinyDirectory::start(1, |_| r#"{"error":"bad api key"}"#.to_string());
        let client = MasterClient::with_base_url(test_config(), &server.base_url).unwrap();

        assert_eq!(
            client.get_session(false),
            Err(DirectoryError::Denied("bad api key".to_string()))
        );
        assert_eq!(client.session_id(), None);
    }

    #[test]
    fn test_unreachable_directory_is_a_value() {
        // Nothing listens on the configured base URL
        let client =
            MasterClient::with_base_url(test_config(), "http://127.0.0.1:9").unwrap();
        assert!(matches!(
            client.get_session(false),
            Err(DirectoryError::Unreachable(_))
        ));
    }

    #[test]
    fn test_three_renewal_failures_negotiate_new_session() {
        // 3 failed renewals + 1 replacement getSession + 1 good renewal
        let server = TinyDirectory::start(5, |target| {
            if target.starts_with("/renewSession") && target.contains("session=sess-1") {
                r#"{"error":"session expired"}"#.to_string()
            } else if target.starts_with("/getSession") {
                r#"{"sessionId":"sess-2","nonce":"n-2"}"#.to_string()
            } else {
                r#"{"sessionId":"sess-2","nonce":"n-3","queue":[]}"#.to_string()
            }
        });

        let client =
            Arc::new(MasterClient::with_base_url(test_config(), &server.base_url).unwrap());
        let registry = QueueItemRegistry::new();

        // Seed the first session by hand
        *client.shared.session_id.lock().unwrap() = Some("sess-1".to_string());
        *client.shared.nonce.lock().unwrap() = Some("n-1".to_string());
        client.set_state(SessionState::Connected);

        // Three failing renewals
        for i in 1..=3 {
            client.renewal_tick(&registry);
            assert_eq!(client.shared.policy.lock().unwrap().failed_attempts(), i);
        }

        // Fourth tick requests a brand-new session and resets the counter
        client.renewal_tick(&registry);
        assert_eq!(client.shared.policy.lock().unwrap().failed_attempts(), 0);
        assert_eq!(client.session_id(), Some("sess-2".to_string()));
        assert_eq!(client.state(), SessionState::Connected);

        let requests = server.requests();
        let new_session_calls = requests
            .iter()
            .filter(|r| r.starts_with("/getSession") && r.contains("noExtra=1"))
            .count();
        assert_eq!(new_session_calls, 1);

        // Fifth tick renews the fresh session normally
        client.renewal_tick(&registry);
        assert_eq!(client.shared.policy.lock().unwrap().failed_attempts(), 0);
    }

    #[test]
    fn test_renewal_drains_queue_items() {
        use std::sync::atomic::AtomicUsize;

        let server = TinyDirectory::start(1, |_| {
            r#"{"sessionId":"s","nonce":"n","queue":[{"type":"message","data":{"text":"hi"}},{"type":"message","data":{"text":"again"}}]}"#
                .to_string()
        });
        let client =
            Arc::new(MasterClient::with_base_url(test_config(), &server.base_url).unwrap());
        *client.shared.session_id.lock().unwrap() = Some("s".to_string());
        client.set_state(SessionState::Connected);

        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = QueueItemRegistry::new();
        let counter = Arc::clone(&hits);
        registry.register(
            "message",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.renewal_tick(&registry);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_stat_updates_serialize_on_nonce() {
        // The server hands out a fresh nonce per call and records the
        // signature each request carried.
        let server = TinyDirectory::start(2, |target| {
            if target.contains("signature=") {
                // Rotate: first response carries n-2, second n-3
                static CALL: AtomicBool = AtomicBool::new(false);
                if !CALL.swap(true, Ordering::SeqCst) {
                    r#"{"ok":true,"nonce":"n-2"}"#.to_string()
                } else {
                    r#"{"ok":true,"nonce":"n-3"}"#.to_string()
                }
            } else {
                r#"{"error":"unexpected"}"#.to_string()
            }
        });

        let client =
            Arc::new(MasterClient::with_base_url(test_config(), &server.base_url).unwrap());
        *client.shared.session_id.lock().unwrap() = Some("s".to_string());
        *client.shared.nonce.lock().unwrap() = Some("n-1".to_string());

        let a = Arc::clone(&client);
        let b = Arc::clone(&client);
        let t1 = thread::spawn(move || a.manipulate_stat("kills", 1));
        let t2 = thread::spawn(move || b.manipulate_stat("kills", 1));
        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 2);

        // The two calls must have signed with n-1 then the rotated n-2,
        // in that order; a replayed n-1 signature would repeat.
        let sig = |r: &String| {
            r.split("signature=")
                .nth(1)
                .unwrap()
                .split('&')
                .next()
                .unwrap()
                .to_string()
        };
        assert_eq!(sig(&requests[0]), sign_stat_update("n-1"));
        assert_eq!(sig(&requests[1]), sign_stat_update("n-2"));

        // After both calls the stored nonce is the latest rotation
        assert_eq!(
            client.shared.nonce.lock().unwrap().clone(),
            Some("n-3".to_string())
        );
    }

    #[test]
    fn test_find_by_session_variable_builds_query() {
        let server = TinyDirectory::start(1, |_| {
            r#"{"results":[{"name":"alice","variables":{"IsHost":"1","IP":"10.0.0.1","Port":"4499"}}]}"#
                .to_string()
        });
        let client = MasterClient::with_base_url(test_config(), &server.base_url).unwrap();

        let records = client.find_by_session_variable("IsHost", "1").unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_host());

        let requests = server.requests();
        assert!(requests[0].starts_with("/findBySessionVariable?"));
        assert!(requests[0].contains("key=IsHost"));
        assert!(requests[0].contains("value=1"));
    }

    #[test]
    fn test_set_session_variable_requires_session() {
        let client =
            MasterClient::with_base_url(test_config(), "http://127.0.0.1:9").unwrap();
        assert!(matches!(
            client.set_session_variable("Port", "4499"),
            Err(DirectoryError::Denied(_))
        ));
    }

    #[test]
    fn test_get_latest_version() {
        let server = TinyDirectory::start(1, |_| r#"{"version":"1.4.2"}"#.to_string());
        let client = MasterClient::with_base_url(test_config(), &server.base_url).unwrap();
        assert_eq!(client.get_latest_version().unwrap(), "1.4.2");
    }
}
