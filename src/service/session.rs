//! # Session Controller
//!
//! Owns everything the proxy knows about the login exchange in flight: which
//! client address to answer, whether the server has accepted a session, when
//! the client last spoke, and the sequence state.
//!
//! ## Lifecycle
//! ```text
//! Idle --(server SessionResponse)--> Active
//! Active --(SessionDisconnect either way)--> Idle
//! Active --(client silent longer than the session timeout)--> reset on next datagram
//! ```
//!
//! Resets are lazy: nothing happens until the next client datagram arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::core::codec::{self, hex_dump, CombinedRanges};
use crate::core::opcode::Opcode;
use crate::protocol::listing::ServerListFilter;
use crate::protocol::login::{is_login_request, LoginCipher, LoginRequest};
use crate::protocol::sequence::{SequenceState, ServerDispatch};
use crate::utils::metrics::ProxyMetrics;

/// What to do with a client datagram.
#[derive(Debug)]
pub enum ClientAction {
    /// Send these bytes to the login server.
    Forward(Vec<u8>),
    /// A decrypted login waiting for a resolution decision.
    Login(LoginRequest),
}

/// Session store the event loop drives.
///
/// The proxy ships a single session that follows whichever client spoke last;
/// a per-address map of sessions can implement the same trait.
pub trait SessionController: Send {
    fn on_client_datagram(&mut self, buf: Vec<u8>, from: SocketAddr, now: Instant) -> ClientAction;

    fn on_server_datagram(&mut self, buf: &[u8]) -> ServerDispatch;

    /// Where server output should go.
    fn client_addr(&self) -> Option<SocketAddr>;

    /// Forget everything, as after a socket failure.
    fn restart(&mut self);
}

/// The single following session.
#[derive(Debug)]
pub struct FollowingSession {
    client_addr: Option<SocketAddr>,
    in_session: bool,
    last_activity: Option<Instant>,
    sequence: SequenceState,
    filter: ServerListFilter,
    cipher: LoginCipher,
    session_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl FollowingSession {
    pub fn new(
        filter: ServerListFilter,
        cipher: LoginCipher,
        session_timeout: Duration,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            client_addr: None,
            in_session: false,
            last_activity: None,
            sequence: SequenceState::new(),
            filter,
            cipher,
            session_timeout,
            metrics,
        }
    }

    pub fn in_session(&self) -> bool {
        self.in_session
    }

    pub fn sequence(&self) -> &SequenceState {
        &self.sequence
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.last_activity {
            Some(last) => now.saturating_duration_since(last) > self.session_timeout,
            None => true,
        }
    }

    /// Point embedded client Acks at the last server sequence the client has seen.
    fn rewrite_combined_acks(&self, buf: &mut [u8]) {
        let ack = self.sequence.ack_sequence();
        for range in CombinedRanges::new(buf) {
            let sub = &mut buf[range];
            if matches!(codec::opcode(sub), Ok(Opcode::Ack)) && codec::set_sequence(sub, ack).is_ok() {
                trace!(ack, "Rewrote embedded client ack");
            }
        }
    }

    fn detect_login(&self, buf: Vec<u8>) -> ClientAction {
        if !is_login_request(&buf) {
            return ClientAction::Forward(buf);
        }
        self.metrics.login_seen();
        match LoginRequest::intercept(buf, &self.cipher) {
            Ok(request) => {
                debug!(username = %request.credentials().account_name(), "Login request detected");
                ClientAction::Login(request)
            }
            Err(buf) => ClientAction::Forward(buf),
        }
    }
}

impl SessionController for FollowingSession {
    fn on_client_datagram(&mut self, mut buf: Vec<u8>, from: SocketAddr, now: Instant) -> ClientAction {
        self.metrics.client_datagram();
        if self.client_addr != Some(from) {
            debug!(client = %from, "Following client address");
        }
        self.client_addr = Some(from);

        if !self.in_session || self.is_stale(now) {
            self.sequence.reset();
            if !self.in_session {
                debug!(client = %from, "New connection");
                self.metrics.connection_started();
            } else {
                debug!(client = %from, "Session idle past timeout, sequence state reset");
            }
        }

        let opcode = codec::opcode(&buf);
        trace!(client = %from, opcode = ?opcode, bytes = buf.len(), "Client datagram\n{}", hex_dump(&buf));

        let action = match opcode {
            Ok(Opcode::Combined) => {
                self.rewrite_combined_acks(&mut buf);
                self.detect_login(buf)
            }
            Ok(Opcode::SessionDisconnect) => {
                debug!(client = %from, "Client disconnected");
                self.in_session = false;
                self.sequence.reset();
                self.metrics.connection_completed();
                ClientAction::Forward(buf)
            }
            Ok(Opcode::Ack) => {
                let ack = self.sequence.ack_sequence();
                if codec::set_sequence(&mut buf, ack).is_ok() {
                    trace!(ack, "Rewrote client ack");
                }
                ClientAction::Forward(buf)
            }
            _ => ClientAction::Forward(buf),
        };

        self.last_activity = Some(now);
        action
    }

    fn on_server_datagram(&mut self, buf: &[u8]) -> ServerDispatch {
        self.metrics.server_datagram();
        trace!(bytes = buf.len(), "Server datagram\n{}", hex_dump(buf));

        let dispatch = self.sequence.handle_server_datagram(buf, &self.filter);
        if dispatch.session_accepted {
            debug!("Session established");
            self.in_session = true;
        }
        if dispatch.session_closed {
            debug!("Server closed the session");
            self.in_session = false;
        }
        for listing in &dispatch.listings {
            debug!(seen = listing.seen, retained = listing.retained, "Server listing filtered");
            self.metrics.listing_filtered();
        }
        self.metrics.dropped(dispatch.dropped as u64);
        dispatch
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    fn restart(&mut self) {
        self.in_session = false;
        self.last_activity = None;
        self.sequence.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::login::tests::{cipher, login_datagram};

    fn session() -> FollowingSession {
        FollowingSession::new(
            ServerListFilter::default(),
            cipher(),
            Duration::from_secs(60),
            Arc::new(ProxyMetrics::new()),
        )
    }

    fn client() -> SocketAddr {
        "192.168.1.10:50000".parse().unwrap()
    }

    fn forwarded(action: ClientAction) -> Vec<u8> {
        match action {
            ClientAction::Forward(buf) => buf,
            ClientAction::Login(_) => panic!("expected a plain forward"),
        }
    }

    fn establish(session: &mut FollowingSession, now: Instant) {
        session.on_client_datagram(vec![0x00, 0x01, 0, 0, 0, 0], client(), now);
        session.on_server_datagram(&[0x00, 0x02, 0, 0]);
        assert!(session.in_session());
    }

    fn server_packet(seq: u16) -> Vec<u8> {
        let mut out = vec![0x00, 0x09];
        out.extend_from_slice(&seq.to_be_bytes());
        out.push(0xAA);
        out
    }

    #[test]
    fn test_client_address_is_followed() {
        let mut s = session();
        let now = Instant::now();
        s.on_client_datagram(vec![0x00, 0x06], client(), now);
        assert_eq!(s.client_addr(), Some(client()));
        let other: SocketAddr = "192.168.1.11:50001".parse().unwrap();
        s.on_client_datagram(vec![0x00, 0x06], other, now);
        assert_eq!(s.client_addr(), Some(other));
    }

    #[test]
    fn test_ack_is_remapped() {
        let mut s = session();
        let now = Instant::now();
        establish(&mut s, now);
        for seq in 0..5 {
            s.on_server_datagram(&server_packet(seq));
        }
        let out = forwarded(s.on_client_datagram(vec![0x00, 0x15, 0x12, 0x34], client(), now));
        assert_eq!(out, vec![0x00, 0x15, 0x00, 0x04]);
    }

    #[test]
    fn test_ack_before_any_server_packet_floors_at_zero() {
        let mut s = session();
        let out = forwarded(s.on_client_datagram(vec![0x00, 0x15, 0xFF, 0xFF], client(), Instant::now()));
        assert_eq!(out, vec![0x00, 0x15, 0x00, 0x00]);
    }

    #[test]
    fn test_combined_only_rewrites_embedded_acks() {
        let mut s = session();
        let now = Instant::now();
        establish(&mut s, now);
        for seq in 0..3 {
            s.on_server_datagram(&server_packet(seq));
        }
        let buf = vec![
            0x00, 0x03, 4, 0x00, 0x15, 0x00, 0x09, 5, 0x00, 0x09, 0x00, 0x07, 0xEE,
        ];
        let out = forwarded(s.on_client_datagram(buf, client(), now));
        assert_eq!(
            out,
            vec![0x00, 0x03, 4, 0x00, 0x15, 0x00, 0x02, 5, 0x00, 0x09, 0x00, 0x07, 0xEE]
        );
    }

    #[test]
    fn test_login_is_detected_inside_combined() {
        let mut s = session();
        let buf = login_datagram(&cipher(), "alice", "secret");
        match s.on_client_datagram(buf, client(), Instant::now()) {
            ClientAction::Login(request) => assert_eq!(request.credentials().username(), b"alice"),
            ClientAction::Forward(_) => panic!("login not detected"),
        }
        assert_eq!(s.metrics.snapshot().logins_seen, 1);
    }

    #[test]
    fn test_stale_session_resets_on_next_client_datagram() {
        let mut s = session();
        let start = Instant::now();
        establish(&mut s, start);
        s.on_server_datagram(&server_packet(0));
        assert!(!s.sequence().is_pristine());

        s.on_client_datagram(vec![0x00, 0x06], client(), start + Duration::from_secs(30));
        assert!(!s.sequence().is_pristine());

        s.on_client_datagram(vec![0x00, 0x06], client(), start + Duration::from_secs(91));
        assert!(s.sequence().is_pristine());
        assert!(s.in_session());
    }

    #[test]
    fn test_disconnect_completes_connection() {
        let mut s = session();
        let now = Instant::now();
        establish(&mut s, now);
        s.on_client_datagram(vec![0x00, 0x05, 0, 0], client(), now);
        assert!(!s.in_session());
        let snap = s.metrics.snapshot();
        assert_eq!(snap.connections_total, 1);
        assert_eq!(snap.connections_active, 0);
        assert_eq!(snap.connections_completed, 1);
    }

    #[test]
    fn test_restart_returns_to_idle() {
        let mut s = session();
        let now = Instant::now();
        establish(&mut s, now);
        s.on_server_datagram(&server_packet(0));
        s.restart();
        assert!(!s.in_session());
        assert!(s.sequence().is_pristine());
        assert_eq!(s.client_addr(), Some(client()));
    }
}
