#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests of the proxy event loop, driven through the in-memory
//! transport and, once, through real UDP sockets.

mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use login_proxy::config::ProxyConfig;
use login_proxy::core::codec;
use login_proxy::error::{ProxyError, Result};
use login_proxy::protocol::login::{Credentials, LOGIN_CIPHERTEXT_OFFSET};
use login_proxy::service::{CredentialResolver, LoginProxy, NoSubstitution, StaticAccounts};
use login_proxy::transport::{MemoryPeer, MemoryTransport};
use login_proxy::utils::ProxyMetrics;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const SESSION_REQUEST: [u8; 6] = [0x00, 0x01, 0x00, 0x00, 0x12, 0x34];
const SESSION_RESPONSE: [u8; 6] = [0x00, 0x02, 0x00, 0x00, 0x56, 0x78];
const WAIT: Duration = Duration::from_secs(5);

fn upstream() -> SocketAddr {
    "10.0.0.1:5998".parse().unwrap()
}

fn client() -> SocketAddr {
    "192.168.1.20:51000".parse().unwrap()
}

fn config() -> ProxyConfig {
    ProxyConfig::default_with_overrides(|c| {
        c.encryption.key = KEY;
        c.encryption.iv = IV;
        c.proxy.restart_backoff = Duration::from_millis(10);
    })
}

struct Harness {
    peer: MemoryPeer,
    metrics: Arc<ProxyMetrics>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(config: ProxyConfig, resolver: Arc<dyn CredentialResolver>) -> Self {
        let (transport, peer) = MemoryTransport::pair("0.0.0.0:5998".parse().unwrap());
        let metrics = Arc::new(ProxyMetrics::new());
        let proxy = LoginProxy::new(&config, transport, upstream(), resolver, Arc::clone(&metrics));
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(proxy.run(async move {
            let _ = rx.await;
        }));
        Self {
            peer,
            metrics,
            shutdown: Some(tx),
            handle,
        }
    }

    fn from_client(&self, data: impl Into<Vec<u8>>) {
        self.peer.inject(client(), data);
    }

    fn from_server(&self, data: impl Into<Vec<u8>>) {
        self.peer.inject(upstream(), data);
    }

    async fn sent(&mut self) -> (SocketAddr, Vec<u8>) {
        timeout(WAIT, self.peer.next_sent())
            .await
            .expect("proxy sent nothing")
            .expect("transport closed")
    }

    async fn to_server(&mut self) -> Vec<u8> {
        let (dest, buf) = self.sent().await;
        assert_eq!(dest, upstream());
        buf
    }

    async fn to_client(&mut self) -> Vec<u8> {
        let (dest, buf) = self.sent().await;
        assert_eq!(dest, client());
        buf
    }

    /// Client SessionRequest out, server SessionResponse back.
    async fn establish(&mut self) {
        self.from_client(SESSION_REQUEST);
        assert_eq!(self.to_server().await, SESSION_REQUEST);
        self.from_server(SESSION_RESPONSE);
        assert_eq!(self.to_client().await, SESSION_RESPONSE);
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.handle).await.expect("proxy did not stop").unwrap()
    }
}

/// Holds every resolution until released.
struct Gated {
    gate: Arc<Notify>,
    replacement: Credentials,
}

#[async_trait]
impl CredentialResolver for Gated {
    async fn resolve(&self, _credentials: &Credentials) -> Result<Option<Credentials>> {
        self.gate.notified().await;
        Ok(Some(self.replacement.clone()))
    }
}

struct Stalled;

#[async_trait]
impl CredentialResolver for Stalled {
    async fn resolve(&self, _credentials: &Credentials) -> Result<Option<Credentials>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_traffic_flows_both_ways() {
    let mut h = Harness::start(config(), Arc::new(NoSubstitution));
    h.establish().await;

    h.from_server(packet(0, b"hello"));
    assert_eq!(h.to_client().await, packet(0, b"hello"));

    h.from_server(packet(2, b"late"));
    h.from_server(packet(1, b"early"));
    assert_eq!(h.to_client().await, packet(1, b"late"));
    assert_eq!(h.to_client().await, packet(2, b"early"));

    h.from_client(ack(900));
    assert_eq!(h.to_server().await, ack(2));

    let stats = h.metrics.snapshot();
    assert_eq!(stats.connections_total, 1);
    assert_eq!(stats.datagrams_from_client, 2);
    assert_eq!(stats.datagrams_from_server, 4);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_login_is_rewritten_for_local_account() {
    let mut accounts = StaticAccounts::new();
    accounts.insert("alt", Credentials::new("main", "hunter2").unwrap());
    let mut h = Harness::start(config(), Arc::new(accounts));
    h.establish().await;

    let original = login_datagram(&cipher(), "Alt", "typed");
    h.from_client(original.clone());
    let sent = h.to_server().await;

    assert_ne!(sent, original);
    let creds = cipher().decrypt_credentials(&sent[LOGIN_CIPHERTEXT_OFFSET..]).unwrap();
    assert_eq!(creds.username(), b"main");
    assert_eq!(creds.password(), b"hunter2");

    let stats = h.metrics.snapshot();
    assert_eq!(stats.logins_seen, 1);
    assert_eq!(stats.logins_rewritten, 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_account_is_forwarded_untouched() {
    let mut h = Harness::start(config(), Arc::new(StaticAccounts::new()));
    h.establish().await;

    let original = login_datagram(&cipher(), "nobody", "pw");
    h.from_client(original.clone());
    assert_eq!(h.to_server().await, original);
    assert_eq!(h.metrics.snapshot().logins_rewritten, 0);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_datagrams_wait_behind_pending_login() {
    let gate = Arc::new(Notify::new());
    let resolver = Gated {
        gate: Arc::clone(&gate),
        replacement: Credentials::new("main", "hunter2").unwrap(),
    };
    let mut h = Harness::start(config(), Arc::new(resolver));
    h.establish().await;

    h.from_client(login_datagram(&cipher(), "alt", "pw"));
    h.from_client(ack(77));
    // Server traffic is not held back; its arrival also shows the client datagrams were consumed.
    h.from_server(packet(0, b"motd"));
    assert_eq!(h.to_client().await, packet(0, b"motd"));
    assert!(h.peer.try_sent().is_none());

    gate.notify_one();
    let login = h.to_server().await;
    let creds = cipher().decrypt_credentials(&login[LOGIN_CIPHERTEXT_OFFSET..]).unwrap();
    assert_eq!(creds.username(), b"main");
    assert_eq!(h.to_server().await, ack(0));
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_resolver_times_out_and_fails_open() {
    let mut config = config();
    config.proxy.resolve_timeout = Duration::from_millis(200);
    let mut h = Harness::start(config, Arc::new(Stalled));
    h.establish().await;

    let original = login_datagram(&cipher(), "alt", "pw");
    h.from_client(original.clone());
    assert_eq!(h.to_server().await, original);
    assert_eq!(h.metrics.snapshot().logins_rewritten, 0);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_listing_is_filtered_end_to_end() {
    let mut h = Harness::start(config(), Arc::new(NoSubstitution));
    h.establish().await;

    let blob = pad_for_fragments(
        listing(&[
            entry("10.1.1.1", "Project 1999 Blue", 900),
            entry("10.1.1.2", "Some Other Server", 12),
            entry("10.1.1.3", "An Interesting Place", 40),
            entry("10.1.1.4", "Test Realm", 1),
        ]),
        3,
    );
    h.from_server(packet(0, b"before"));
    for frag in fragments(1, &blob) {
        h.from_server(frag);
    }
    h.from_server(packet(4, b"after"));

    assert_eq!(h.to_client().await, packet(0, b"before"));
    let listing = h.to_client().await;
    assert!(is_listing(&listing));
    assert_eq!(codec::sequence(&listing).unwrap(), 1);
    assert_eq!(&listing[22..26], &2u32.to_le_bytes());
    assert_eq!(h.to_client().await, packet(2, b"after"));

    h.from_client(ack(4));
    assert_eq!(h.to_server().await, ack(1));
    assert_eq!(h.metrics.snapshot().listings_filtered, 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_receive_error_restarts_session() {
    let mut h = Harness::start(config(), Arc::new(NoSubstitution));
    h.establish().await;
    for seq in 0..3 {
        h.from_server(packet(seq, b"x"));
        h.to_client().await;
    }

    h.peer.inject_error(io::ErrorKind::ConnectionReset);
    h.from_client(ack(2));
    assert_eq!(h.to_server().await, ack(0));
    assert_eq!(h.metrics.snapshot().connections_total, 2);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_receive_errors_rebind_and_keep_serving() {
    let mut config = config();
    config.proxy.max_bind_attempts = 2;
    let mut h = Harness::start(config, Arc::new(NoSubstitution));

    for _ in 0..5 {
        h.peer.inject_error(io::ErrorKind::ConnectionReset);
    }
    h.from_client(SESSION_REQUEST);
    assert_eq!(h.to_server().await, SESSION_REQUEST);
    assert_eq!(h.peer.rebinds(), 2);
    assert!(!h.handle.is_finished());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_rebind_ends_the_loop() {
    let mut config = config();
    config.proxy.max_bind_attempts = 2;
    let h = Harness::start(config, Arc::new(NoSubstitution));

    h.peer.fail_rebind();
    h.peer.inject_error(io::ErrorKind::ConnectionReset);
    h.peer.inject_error(io::ErrorKind::ConnectionReset);
    let outcome = timeout(WAIT, h.handle).await.expect("loop kept running").unwrap();
    assert!(matches!(outcome, Err(ProxyError::Bind { .. })));
}

#[tokio::test]
async fn test_pending_login_survives_receive_error() {
    let gate = Arc::new(Notify::new());
    let resolver = Gated {
        gate: Arc::clone(&gate),
        replacement: Credentials::new("main", "hunter2").unwrap(),
    };
    let mut h = Harness::start(config(), Arc::new(resolver));
    h.establish().await;

    h.from_client(login_datagram(&cipher(), "alt", "pw"));
    h.from_client(ack(5));
    h.peer.inject_error(io::ErrorKind::ConnectionReset);
    // The server datagram is handled after the failure, so the error has been seen.
    h.from_server(packet(0, b"motd"));
    h.to_client().await;

    gate.notify_one();
    let login = h.to_server().await;
    let creds = cipher().decrypt_credentials(&login[LOGIN_CIPHERTEXT_OFFSET..]).unwrap();
    assert_eq!(creds.username(), b"main");
    assert_eq!(h.to_server().await, ack(0));
    assert_eq!(h.metrics.snapshot().logins_rewritten, 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_runts_and_early_server_output_are_discarded() {
    let mut h = Harness::start(config(), Arc::new(NoSubstitution));

    h.from_client(vec![0x00]);
    h.from_server(packet(0, b"nobody listening"));
    h.from_client(SESSION_REQUEST);
    assert_eq!(h.to_server().await, SESSION_REQUEST);
    assert!(h.peer.try_sent().is_none());

    let stats = h.metrics.snapshot();
    assert_eq!(stats.datagrams_dropped, 1);
    assert_eq!(stats.datagrams_from_server, 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_over_udp_sockets() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = ProxyConfig::default_with_overrides(|c| {
        c.proxy.listen = "127.0.0.1:0".into();
        c.proxy.upstream = server.local_addr().unwrap().to_string();
    });

    let proxy = LoginProxy::bind(&config, Arc::new(NoSubstitution), Arc::new(ProxyMetrics::new()))
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    assert_eq!(proxy.upstream(), server.local_addr().unwrap());
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(proxy.run(async move {
        let _ = rx.await;
    }));

    let mut buf = [0u8; 600];
    client.send_to(&SESSION_REQUEST, proxy_addr).await.unwrap();
    let (len, from) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], &SESSION_REQUEST);
    assert_eq!(from, proxy_addr);

    server.send_to(&SESSION_RESPONSE, proxy_addr).await.unwrap();
    let (len, _) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], &SESSION_RESPONSE);

    server.send_to(&packet(0, b"over udp"), proxy_addr).await.unwrap();
    let (len, _) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], packet(0, b"over udp").as_slice());

    tx.send(()).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}
