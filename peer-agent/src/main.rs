//! Peer state-synchronization agent
//!
//! A host/client process that:
//! - Leases a session from the directory service and keeps it renewed
//! - Hosts or discovers the session peer endpoint
//! - Exchanges category + code addressed messages with connected peers
//! - Defers attribute messages for entities that do not exist yet and
//!   replays them from the cache until they resolve or time out

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peer_agent::bootstrap::{self, PeerRole};
use peer_agent::handlers;
use peer_agent::master::{MasterClient, MasterConfig};
use peer_agent::metrics::Metrics;
use peer_agent::transport::{TcpPeerTransport, DEFAULT_PEER_PORT};
use peer_agent::world::LocalWorld;

use entity_sync::directory::QueueItemRegistry;
use entity_sync::dispatch::{MessageDispatcher, PeerEvent};
use entity_sync::session::SessionState;

// ============================================================================
// Constants
// ============================================================================

/// Transport pump timeout per tick
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How often the metrics snapshot is logged
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --apikey <key>        Directory service API key (omit for offline mode)
    // --name <name>         Session name to search for when discovering a host
    // --host                Run as the session host
    // --connect <addr:port> Connect directly to a host, bypassing discovery
    // --port <port>         Host listen port
    // --config-url <url>    Endpoint-configuration document URL
    // --deployment <name>   Which configuration entry to use
    // --probe-url <url>     Internet reachability probe URL
    // --echo-url <url>      Public address echo URL

    let api_key = parse_arg(&args, "--apikey");
    let session_name = parse_arg(&args, "--name").unwrap_or_default();
    let run_as_host = args.iter().any(|a| a == "--host");
    let connect_addr = parse_arg(&args, "--connect");
    let listen_port: u16 = match parse_arg(&args, "--port") {
        Some(p) => p.parse().map_err(|_| "Invalid port")?,
        None => DEFAULT_PEER_PORT,
    };

    let config_url = parse_arg(&args, "--config-url")
        .unwrap_or_else(|| "https://config.example.net/endpoints.json".to_string());
    let deployment = parse_arg(&args, "--deployment").unwrap_or_else(|| "production".to_string());
    let probe_url =
        parse_arg(&args, "--probe-url").unwrap_or_else(|| "https://example.net/".to_string());
    let echo_url =
        parse_arg(&args, "--echo-url").unwrap_or_else(|| "https://echo.example.net/ip".to_string());

    let connect_addr: Option<SocketAddr> = match connect_addr {
        Some(a) => Some(a.parse().map_err(|_| "Invalid connect address")?),
        None => None,
    };

    log::info!("Peer agent starting...");
    log::info!("  Directory: {}", if api_key.is_some() { "enabled" } else { "offline" });
    log::info!("  Deployment: {}", deployment);

    // Lease the directory session, unless running offline
    let master = match api_key {
        Some(api_key) => {
            let config = MasterConfig {
                probe_url,
                address_echo_url: echo_url,
                endpoint_config_url: config_url,
                deployment,
                api_key,
                app_name: env!("CARGO_PKG_NAME").to_string(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                hardware_id: hardware_id(),
            };
            let client = Arc::new(MasterClient::new(config)?);

            let mut registry = QueueItemRegistry::new();
            registry.register(
                "message",
                Box::new(|item| {
                    log::info!("directory message: {}", item.data);
                }),
            );

            match client.initialize_connection(Arc::new(registry)) {
                SessionState::Connected => log::info!("directory session active"),
                state => log::warn!("continuing without directory session ({})", state),
            }
            Some(client)
        }
        None => None,
    };

    // Decide the role and wire the transport
    let is_network_session = connect_addr.is_some() || !session_name.is_empty();
    let role = if connect_addr.is_some() {
        PeerRole::Client
    } else {
        bootstrap::decide_role(is_network_session, run_as_host)
    };
    log::info!("  Role: {}", role);

    let transport = match role {
        PeerRole::Host => {
            let bind: SocketAddr = format!("0.0.0.0:{}", listen_port).parse()?;
            bootstrap::start_host(bind, master.as_ref())?
        }
        PeerRole::Client => match connect_addr {
            Some(addr) => bootstrap::connect_to(addr)?,
            None => {
                let master = master
                    .as_ref()
                    .ok_or("host discovery requires a directory session (--apikey)")?;
                bootstrap::discover_and_connect(master, &session_name)?
            }
        },
    };

    let metrics = Arc::new(Metrics::new());
    let mut dispatcher = MessageDispatcher::new(role == PeerRole::Host);
    handlers::register_entity_handlers(&mut dispatcher, Arc::clone(&metrics));

    let world = LocalWorld::new();
    run_tick_loop(transport, dispatcher, world, master, metrics)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Stable per-machine identifier sent with directory calls. Falls back
/// to the hostname environment when nothing better is available.
fn hardware_id() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// ============================================================================
// Tick Loop
// ============================================================================

fn run_tick_loop(
    mut transport: TcpPeerTransport,
    mut dispatcher: MessageDispatcher,
    mut world: LocalWorld,
    master: Option<Arc<MasterClient>>,
    metrics: Arc<Metrics>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut last_metrics_log = Instant::now();

    loop {
        transport.pump(TICK_INTERVAL)?;
        dispatcher.process_queue(&mut transport, &mut world);

        for event in dispatcher.take_events() {
            match event {
                PeerEvent::ConnectionEstablished { peer } => {
                    metrics.peer_connections_total.fetch_add(1, Ordering::Relaxed);
                    log::info!("{} connected", peer);
                }
                PeerEvent::ConnectionLost { peer, reason } => {
                    metrics.peer_losses_total.fetch_add(1, Ordering::Relaxed);
                    match peer {
                        Some(peer) => log::warn!("{} disconnected: {}", peer, reason),
                        None => log::warn!("connection attempt failed: {}", reason),
                    }
                }
            }
        }

        if let Some(master) = &master {
            for event in master.take_session_events() {
                log::info!("session event: {:?}", event);
            }
        }

        if last_metrics_log.elapsed() >= METRICS_LOG_INTERVAL {
            last_metrics_log = Instant::now();
            log::debug!("metrics:\n{}", metrics.render());
        }
    }
}
