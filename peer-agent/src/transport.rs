//! TCP peer transport
//!
//! Implements the core's [`PeerTransport`] abstraction over non-blocking
//! TCP with a mio event loop. The host role listens and accepts; the
//! client role connects to the discovered host. Application frames are
//! carried with a 4-byte big-endian length prefix.
//!
//! Per-connection state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnected (lost | closed)
//! ```
//!
//! Reaching `Connected` emits `ConnectionEstablished`; an involuntary
//! drop emits `ConnectionLost` with the last known peer identity, or
//! `None` when the handshake never completed, so callers can tell
//! "never connected" from "dropped".

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use entity_sync::{PeerEvent, PeerId, PeerTransport, TransportError};

// ============================================================================
// Constants
// ============================================================================

/// Default port the host listens on (and clients fall back to when the
/// directory record omits one)
pub const DEFAULT_PEER_PORT: u16 = 4499;

/// Length of the frame header (4 bytes big-endian frame length)
const FRAME_HEADER_LEN: usize = 4;

/// Maximum accepted frame size; larger frames drop the connection
const MAX_FRAME_SIZE: usize = 65536;

/// How long an outbound connect may stay in `Connecting`
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

// ============================================================================
// Connection State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Connecting,
    Connected,
}

struct PeerConn {
    stream: TcpStream,
    phase: ConnPhase,
    id: PeerId,
    addr: SocketAddr,
    /// Accumulates partial frames between reads
    read_buf: Vec<u8>,
    /// Bytes accepted by `send` but not yet written to the socket
    write_buf: Vec<u8>,
    /// Only set for outbound connects
    connect_deadline: Option<Instant>,
}

impl PeerConn {
    fn new(stream: TcpStream, id: PeerId, addr: SocketAddr, phase: ConnPhase) -> Self {
        PeerConn {
            stream,
            phase,
            id,
            addr,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            connect_deadline: None,
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// mio-driven TCP transport for one peer session.
pub struct TcpPeerTransport {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    conns: HashMap<Token, PeerConn>,
    next_token: usize,
    next_peer_id: u64,
    inbound: VecDeque<(PeerId, Vec<u8>)>,
    pending_events: VecDeque<PeerEvent>,
    /// The host connection, on a client
    active: Option<PeerId>,
}

impl TcpPeerTransport {
    fn new(listener: Option<TcpListener>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut transport = TcpPeerTransport {
            poll,
            events: Events::with_capacity(256),
            listener,
            conns: HashMap::new(),
            next_token: 1,
            next_peer_id: 1,
            inbound: VecDeque::new(),
            pending_events: VecDeque::new(),
            active: None,
        };

        if let Some(ref mut listener) = transport.listener {
            transport
                .poll
                .registry()
                .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        }

        Ok(transport)
    }

    /// Host role: listen for client connections.
    pub fn listen(bind_addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        log::info!("listening for peers on {}", listener.local_addr()?);
        Self::new(Some(listener))
    }

    /// Client role: connect to the host.
    pub fn connect(host_addr: SocketAddr) -> io::Result<Self> {
        let mut transport = Self::new(None)?;
        transport.start_connect(host_addr)?;
        Ok(transport)
    }

    /// Begin a (re)connect attempt to a host.
    pub fn start_connect(&mut self, host_addr: SocketAddr) -> io::Result<()> {
        let mut stream = TcpStream::connect(host_addr)?;
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let mut conn = PeerConn::new(stream, id, host_addr, ConnPhase::Connecting);
        conn.connect_deadline = Some(Instant::now() + CONNECT_TIMEOUT);
        self.conns.insert(token, conn);

        log::info!("connecting to host at {}", host_addr);
        Ok(())
    }

    /// The bound listener address (host role).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of fully established connections.
    pub fn connected_peers(&self) -> usize {
        self.conns
            .values()
            .filter(|c| c.phase == ConnPhase::Connected)
            .count()
    }

    /// Poll the sockets and service readable/writable connections.
    /// Call once per tick before draining `recv`.
    pub fn pump(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_pending()?;
                continue;
            }

            if writable {
                self.handle_writable(token);
            }
            if readable {
                self.handle_readable(token);
            }
        }

        self.check_connect_deadlines();
        self.flush_all();

        Ok(())
    }

    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            let listener = match self.listener.as_ref() {
                Some(l) => l,
                None => return Ok(()),
            };

            let (mut stream, addr) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            let token = Token(self.next_token);
            self.next_token += 1;

            self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;

            let id = PeerId(self.next_peer_id);
            self.next_peer_id += 1;

            log::info!("accepted {} from {}", id, addr);
            self.conns
                .insert(token, PeerConn::new(stream, id, addr, ConnPhase::Connected));
            self.pending_events
                .push_back(PeerEvent::ConnectionEstablished { peer: id });
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return,
        };

        if conn.phase == ConnPhase::Connecting {
            // A writable event on a connecting socket resolves the attempt
            match conn.stream.peer_addr() {
                Ok(_) => {
                    conn.phase = ConnPhase::Connected;
                    conn.connect_deadline = None;
                    let id = conn.id;
                    log::info!("connection to {} established as {}", conn.addr, id);
                    self.active = Some(id);
                    self.pending_events
                        .push_back(PeerEvent::ConnectionEstablished { peer: id });
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    // Handshake still in flight
                    return;
                }
                Err(e) => {
                    self.drop_conn(token, &format!("connect failed: {}", e));
                    return;
                }
            }
        }

        self.flush_conn(token);
    }

    fn handle_readable(&mut self, token: Token) {
        let mut buf = [0u8; 65535];
        let mut closed: Option<String> = None;

        if let Some(conn) = self.conns.get_mut(&token) {
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        closed = Some("connection closed by peer".to_string());
                        break;
                    }
                    Ok(n) => {
                        conn.read_buf.extend_from_slice(&buf[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        closed = Some(format!("read error: {}", e));
                        break;
                    }
                }
            }
        } else {
            return;
        }

        if closed.is_none() {
            closed = self.extract_frames(token);
        }

        if let Some(reason) = closed {
            self.drop_conn(token, &reason);
        }
    }

    /// Split accumulated bytes into complete frames. Returns a drop
    /// reason when the peer violates the framing.
    fn extract_frames(&mut self, token: Token) -> Option<String> {
        let conn = self.conns.get_mut(&token)?;

        loop {
            if conn.read_buf.len() < FRAME_HEADER_LEN {
                return None;
            }

            let len = u32::from_be_bytes([
                conn.read_buf[0],
                conn.read_buf[1],
                conn.read_buf[2],
                conn.read_buf[3],
            ]) as usize;

            if len > MAX_FRAME_SIZE {
                return Some(format!("oversized frame: {} bytes", len));
            }

            let total = FRAME_HEADER_LEN + len;
            if conn.read_buf.len() < total {
                return None;
            }

            let frame = conn.read_buf[FRAME_HEADER_LEN..total].to_vec();
            conn.read_buf.drain(..total);
            self.inbound.push_back((conn.id, frame));
        }
    }

    fn flush_conn(&mut self, token: Token) {
        let mut failed: Option<String> = None;

        if let Some(conn) = self.conns.get_mut(&token) {
            while !conn.write_buf.is_empty() {
                match conn.stream.write(&conn.write_buf) {
                    Ok(0) => {
                        failed = Some("write returned zero".to_string());
                        break;
                    }
                    Ok(n) => {
                        conn.write_buf.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failed = Some(format!("write error: {}", e));
                        break;
                    }
                }
            }
        }

        if let Some(reason) = failed {
            self.drop_conn(token, &reason);
        }
    }

    fn flush_all(&mut self) {
        let tokens: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| !c.write_buf.is_empty() && c.phase == ConnPhase::Connected)
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            self.flush_conn(token);
        }
    }

    fn check_connect_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| {
                c.phase == ConnPhase::Connecting
                    && c.connect_deadline.map(|d| now >= d).unwrap_or(false)
            })
            .map(|(t, _)| *t)
            .collect();

        for token in expired {
            self.drop_conn(token, "connect timed out");
        }
    }

    fn drop_conn(&mut self, token: Token, reason: &str) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);

            // Only a completed handshake yields a known peer identity
            let peer = match conn.phase {
                ConnPhase::Connected => Some(conn.id),
                ConnPhase::Connecting => None,
            };

            if self.active == Some(conn.id) {
                self.active = None;
            }

            log::warn!("lost connection to {} ({}): {}", conn.addr, conn.id, reason);
            self.pending_events.push_back(PeerEvent::ConnectionLost {
                peer,
                reason: reason.to_string(),
            });
        }
    }

    fn queue_frame(conn: &mut PeerConn, frame: &[u8]) {
        conn.write_buf
            .extend_from_slice(&(frame.len() as u32).to_be_bytes());
        conn.write_buf.extend_from_slice(frame);
    }

    fn token_of(&self, peer: PeerId) -> Option<Token> {
        self.conns
            .iter()
            .find(|(_, c)| c.id == peer)
            .map(|(t, _)| *t)
    }
}

impl PeerTransport for TcpPeerTransport {
    fn send(&mut self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        let token = self.token_of(peer).ok_or(TransportError::NotConnected)?;

        {
            let conn = self.conns.get_mut(&token).ok_or(TransportError::NotConnected)?;
            if conn.phase != ConnPhase::Connected {
                return Err(TransportError::NotConnected);
            }
            Self::queue_frame(conn, frame);
        }

        self.flush_conn(token);
        Ok(())
    }

    fn send_to_all_except(
        &mut self,
        frame: &[u8],
        excluded: Option<PeerId>,
    ) -> Result<(), TransportError> {
        let targets: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.phase == ConnPhase::Connected && Some(c.id) != excluded)
            .map(|(t, _)| *t)
            .collect();

        for token in targets {
            if let Some(conn) = self.conns.get_mut(&token) {
                Self::queue_frame(conn, frame);
            }
            self.flush_conn(token);
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)> {
        self.inbound.pop_front()
    }

    fn poll_event(&mut self) -> Option<PeerEvent> {
        self.pending_events.pop_front()
    }

    fn active_peer(&self) -> Option<PeerId> {
        self.active
    }
}

// ============================================================================
// Tests
// ============================================================================
