//! # Proxy Event Loop
//!
//! One task owns the socket, the session and at most one in-flight credential
//! resolution. Everything else is synchronous per datagram.
//!
//! ## Ordering
//! While a login is being resolved, further client datagrams are queued and
//! replayed in arrival order once the (possibly rewritten) login has been sent.
//! Server datagrams keep flowing to the client in the meantime.
//!
//! ## Failure Handling
//! A receive failure restarts the session and backs off before listening
//! again. A login already being resolved is still forwarded once its
//! resolution completes. After `max_bind_attempts` consecutive failures the
//! socket is rebound; only a failed rebind ends [`LoginProxy::run`].

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::protocol::login::{Credentials, LoginCipher, LoginRequest};
use crate::service::resolver::CredentialResolver;
use crate::service::session::{ClientAction, FollowingSession, SessionController};
use crate::transport::udp::{DatagramTransport, UdpTransport};
use crate::utils::metrics::{ProxyMetrics, Timer};
use crate::utils::timeout::{with_timeout_error, METRICS_INTERVAL};

/// Receive buffer; comfortably above the protocol's 512-byte datagrams.
const RECV_BUFFER_SIZE: usize = 2048;

type Resolution = BoxFuture<'static, (LoginRequest, Result<Option<Credentials>>)>;

/// The login proxy.
pub struct LoginProxy<T, S = FollowingSession> {
    transport: T,
    upstream: SocketAddr,
    session: S,
    cipher: LoginCipher,
    resolver: Arc<dyn CredentialResolver>,
    metrics: Arc<ProxyMetrics>,
    restart_backoff: Duration,
    rebind_after: u32,
    resolve_timeout: Duration,
    queued: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl LoginProxy<UdpTransport> {
    /// Resolve the upstream, bind the listen socket and build the proxy.
    pub async fn bind(
        config: &ProxyConfig,
        resolver: Arc<dyn CredentialResolver>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        let upstream = config.proxy.resolve_upstream().await?;
        let listen = config.proxy.listen_addr()?;
        let transport = UdpTransport::bind_with_retry(
            listen,
            config.proxy.max_bind_attempts,
            config.proxy.restart_backoff,
        )
        .await?;
        Ok(Self::new(config, transport, upstream, resolver, metrics))
    }
}

impl<T: DatagramTransport> LoginProxy<T> {
    pub fn new(
        config: &ProxyConfig,
        transport: T,
        upstream: SocketAddr,
        resolver: Arc<dyn CredentialResolver>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let session = FollowingSession::new(
            config.listing.filter(),
            config.encryption.cipher(),
            config.proxy.session_timeout,
            Arc::clone(&metrics),
        );
        Self::with_session(config, transport, upstream, session, resolver, metrics)
    }
}

impl<T: DatagramTransport, S: SessionController> LoginProxy<T, S> {
    /// Build the proxy around a custom session store.
    pub fn with_session(
        config: &ProxyConfig,
        transport: T,
        upstream: SocketAddr,
        session: S,
        resolver: Arc<dyn CredentialResolver>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            transport,
            upstream,
            session,
            cipher: config.encryption.cipher(),
            resolver,
            metrics,
            restart_backoff: config.proxy.restart_backoff,
            rebind_after: config.proxy.max_bind_attempts.max(1),
            resolve_timeout: config.proxy.resolve_timeout,
            queued: VecDeque::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` completes or the socket cannot be rebound.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut pending: Option<Resolution> = None;
        let mut failures = 0u32;
        let mut metrics_tick = interval_at(tokio::time::Instant::now() + METRICS_INTERVAL, METRICS_INTERVAL);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            listen = ?self.transport.local_addr().ok(),
            upstream = %self.upstream,
            "Login proxy running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                (request, outcome) = next_resolution(&mut pending), if pending.is_some() => {
                    pending = None;
                    self.finish_login(request, outcome).await;
                    pending = self.drain_queue().await;
                }
                received = self.transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        failures = 0;
                        if let Some(resolution) = self.on_datagram(&buf[..len], from, pending.is_some()).await {
                            pending = Some(resolution);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, backoff_ms = self.restart_backoff.as_millis() as u64, "Receive failed, restarting session");
                        self.session.restart();
                        tokio::time::sleep(self.restart_backoff).await;
                        if failures >= self.rebind_after {
                            warn!(failures, "Receive keeps failing, rebinding socket");
                            if let Err(e) = self.transport.rebind(self.rebind_after, self.restart_backoff).await {
                                error!(error = %e, "Rebind failed, giving up");
                                return Err(e);
                            }
                            failures = 0;
                        }
                    }
                },
                _ = metrics_tick.tick() => self.metrics.log_metrics(),
            }
        }

        self.metrics.log_metrics();
        Ok(())
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr, resolving: bool) -> Option<Resolution> {
        if data.len() < 2 {
            debug!(from = %from, bytes = data.len(), "Dropping runt datagram");
            self.metrics.dropped(1);
            return None;
        }
        if from == self.upstream {
            self.forward_from_server(data).await;
            return None;
        }
        if resolving {
            trace!(client = %from, "Login resolution pending, queueing client datagram");
            self.queued.push_back((data.to_vec(), from));
            return None;
        }
        self.handle_client(data.to_vec(), from).await
    }

    async fn handle_client(&mut self, buf: Vec<u8>, from: SocketAddr) -> Option<Resolution> {
        match self.session.on_client_datagram(buf, from, Instant::now()) {
            ClientAction::Forward(buf) => {
                self.send_to_server(&buf).await;
                None
            }
            ClientAction::Login(request) => Some(self.resolve(request)),
        }
    }

    fn resolve(&self, request: LoginRequest) -> Resolution {
        let resolver = Arc::clone(&self.resolver);
        let deadline = self.resolve_timeout;
        async move {
            let _timer = Timer::start("credential_resolution");
            let outcome = with_timeout_error(resolver.resolve(request.credentials()), deadline).await;
            (request, outcome)
        }
        .boxed()
    }

    #[instrument(level = "debug", skip_all)]
    async fn finish_login(&mut self, request: LoginRequest, outcome: Result<Option<Credentials>>) {
        let (buf, rewritten) = request.settle(outcome, &self.cipher);
        if rewritten {
            self.metrics.login_rewritten();
        }
        self.send_to_server(&buf).await;
    }

    /// Replay queued client datagrams until the queue empties or another login starts.
    async fn drain_queue(&mut self) -> Option<Resolution> {
        while let Some((buf, from)) = self.queued.pop_front() {
            if let Some(resolution) = self.handle_client(buf, from).await {
                return Some(resolution);
            }
        }
        None
    }

    async fn forward_from_server(&mut self, data: &[u8]) {
        let dispatch = self.session.on_server_datagram(data);
        let Some(client) = self.session.client_addr() else {
            debug!(bytes = data.len(), "No client yet, discarding server output");
            return;
        };
        for out in dispatch.outbound {
            match self.transport.send_to(&out, client).await {
                Ok(sent) => self.metrics.sent_to_client(sent as u64),
                Err(e) => warn!(client = %client, error = %e, "Failed to send to client"),
            }
        }
    }

    async fn send_to_server(&self, buf: &[u8]) {
        match self.transport.send_to(buf, self.upstream).await {
            Ok(sent) => self.metrics.sent_to_server(sent as u64),
            Err(e) => warn!(upstream = %self.upstream, error = %e, "Failed to send to login server"),
        }
    }
}

async fn next_resolution(pending: &mut Option<Resolution>) -> (LoginRequest, Result<Option<Credentials>>) {
    match pending.as_mut() {
        Some(resolution) => resolution.await,
        None => std::future::pending().await,
    }
}
