//! Peer discovery and role bootstrap
//!
//! Decides whether this process runs as the authoritative host or as a
//! client, then wires the transport accordingly: the host binds a
//! listener and publishes its endpoint on the directory session, a
//! client looks the host up by published variables and connects.
//!
//! Discovery failures are reported to the user; a manually supplied
//! address always bypasses discovery.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use entity_sync::directory::DirectoryError;

use crate::master::MasterClient;
use crate::transport::{TcpPeerTransport, DEFAULT_PEER_PORT};

// ============================================================================
// Role Decision
// ============================================================================

/// Which side of the session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Authoritative: accepts connections, mirrors traffic between clients
    Host,
    /// Connects to the host and follows its state
    Client,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Host => write!(f, "host"),
            PeerRole::Client => write!(f, "client"),
        }
    }
}

/// A peer hosts when it owns the session; a standalone run (no shared
/// session) is its own host too.
pub fn decide_role(is_network_session: bool, is_session_owner: bool) -> PeerRole {
    if !is_network_session || is_session_owner {
        PeerRole::Host
    } else {
        PeerRole::Client
    }
}

// ============================================================================
// Bootstrap Errors
// ============================================================================

#[derive(Debug)]
pub enum BootstrapError {
    /// Listener or outbound connect failed
    Io(std::io::Error),
    /// The directory lookup failed
    Directory(DirectoryError),
    /// Discovery ran but found no usable host
    HostNotFound { searched: String },
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Io(e) => write!(f, "peer socket error: {}", e),
            BootstrapError::Directory(e) => write!(f, "host discovery failed: {}", e),
            BootstrapError::HostNotFound { searched } => {
                write!(f, "no host found for session '{}'", searched)
            }
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<std::io::Error> for BootstrapError {
    fn from(e: std::io::Error) -> Self {
        BootstrapError::Io(e)
    }
}

impl From<DirectoryError> for BootstrapError {
    fn from(e: DirectoryError) -> Self {
        BootstrapError::Directory(e)
    }
}

// ============================================================================
// Host Bootstrap
// ============================================================================

/// Bind the host listener and publish the endpoint on our directory
/// session. Publishing is best effort: a directory hiccup leaves the
/// listener up and manual connects possible.
pub fn start_host(
    bind_addr: SocketAddr,
    master: Option<&Arc<MasterClient>>,
) -> Result<TcpPeerTransport, BootstrapError> {
    let transport = TcpPeerTransport::listen(bind_addr)?;
    let local = transport.local_addr();
    log::info!("hosting on {:?}", local);

    if let (Some(master), Some(local)) = (master, local) {
        master.set_session_variable_async("IsHost", "1");
        master.set_session_variable_async("Port", &local.port().to_string());
        master.set_session_variable_async("IP", &master.public_address());
    }

    Ok(transport)
}

// ============================================================================
// Client Bootstrap
// ============================================================================

/// Connect directly to a known host address, bypassing discovery.
pub fn connect_to(host_addr: SocketAddr) -> Result<TcpPeerTransport, BootstrapError> {
    log::info!("connecting to host at {}", host_addr);
    Ok(TcpPeerTransport::connect(host_addr)?)
}

/// Discover the session host through the directory and connect to it.
///
/// `host_name` narrows the search to a specific published session; when
/// empty, the first host found wins.
pub fn discover_and_connect(
    master: &MasterClient,
    host_name: &str,
) -> Result<TcpPeerTransport, BootstrapError> {
    let records = master.find_by_session_variable("IsHost", "1")?;

    let host = records
        .iter()
        .filter(|r| r.is_host())
        .find(|r| host_name.is_empty() || r.name == host_name);

    let record = match host {
        Some(r) => r,
        None => {
            return Err(BootstrapError::HostNotFound {
                searched: if host_name.is_empty() {
                    "any".to_string()
                } else {
                    host_name.to_string()
                },
            })
        }
    };

    let addr = match record.endpoint(DEFAULT_PEER_PORT) {
        Some(a) => a,
        None => {
            log::warn!("host '{}' published no usable address", record.name);
            return Err(BootstrapError::HostNotFound {
                searched: record.name.clone(),
            });
        }
    };

    log::info!("discovered host '{}' at {}", record.name, addr);
    connect_to(addr)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_run_hosts() {
        assert_eq!(decide_role(false, false), PeerRole::Host);
        assert_eq!(decide_role(false, true), PeerRole::Host);
    }

    #[test]
    fn test_session_owner_hosts_others_follow() {
        assert_eq!(decide_role(true, true), PeerRole::Host);
        assert_eq!(decide_role(true, false), PeerRole::Client);
    }

    #[test]
    fn test_start_host_binds_ephemeral_port() {
        let transport = start_host("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let local = transport.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_connect_to_running_host() {
        let host = start_host("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = host.local_addr().unwrap();
        // Connection completes asynchronously; starting it must succeed
        let client = connect_to(addr).unwrap();
        assert_eq!(client.connected_peers(), 0);
    }

    #[test]
    fn test_host_not_found_message_names_session() {
        let err = BootstrapError::HostNotFound {
            searched: "alice".to_string(),
        };
        assert_eq!(format!("{}", err), "no host found for session 'alice'");
    }
}
