//! In-process datagram transport.
//!
//! [`MemoryTransport`] stands in for the UDP socket when driving the proxy from
//! tests. The paired [`MemoryPeer`] injects datagrams as if they
//! came from any address and collects everything the proxy sends.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{ProxyError, Result};
use crate::transport::udp::DatagramTransport;

type Inbound = io::Result<(Vec<u8>, SocketAddr)>;

/// Proxy-side end of an in-memory link.
#[derive(Debug)]
pub struct MemoryTransport {
    local_addr: SocketAddr,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    outbound: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    rebind: Arc<RebindControl>,
}

#[derive(Debug, Default)]
struct RebindControl {
    fail: AtomicBool,
    count: AtomicUsize,
}

/// Test-side end of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    inject: mpsc::UnboundedSender<Inbound>,
    sent: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    rebind: Arc<RebindControl>,
}

impl MemoryTransport {
    pub fn pair(local_addr: SocketAddr) -> (Self, MemoryPeer) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, sent) = mpsc::unbounded_channel();
        let rebind = Arc::new(RebindControl::default());
        (
            Self {
                local_addr,
                inbound: Mutex::new(inbound),
                outbound,
                rebind: Arc::clone(&rebind),
            },
            MemoryPeer { inject, sent, rebind },
        )
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let next = self.inbound.lock().await.recv().await;
        match next {
            Some(Ok((data, from))) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            Some(Err(e)) => Err(ProxyError::Io(e)),
            None => Err(ProxyError::Transport("memory transport closed".to_string())),
        }
    }

    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        self.outbound
            .send((dest, buf.to_vec()))
            .map_err(|_| ProxyError::Transport("memory peer dropped".to_string()))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn rebind(&mut self, _attempts: u32, _backoff: Duration) -> Result<()> {
        self.rebind.count.fetch_add(1, Ordering::Relaxed);
        if self.rebind.fail.load(Ordering::Relaxed) {
            return Err(ProxyError::Bind {
                addr: self.local_addr,
                source: io::Error::new(io::ErrorKind::AddrInUse, "injected rebind failure"),
            });
        }
        Ok(())
    }
}

impl MemoryPeer {
    /// Deliver `data` to the proxy as if sent from `from`.
    pub fn inject(&self, from: SocketAddr, data: impl Into<Vec<u8>>) {
        let _ = self.inject.send(Ok((data.into(), from)));
    }

    /// Make the proxy's next receive fail.
    pub fn inject_error(&self, kind: io::ErrorKind) {
        let _ = self.inject.send(Err(io::Error::new(kind, "injected failure")));
    }

    /// Make every later rebind fail.
    pub fn fail_rebind(&self) {
        self.rebind.fail.store(true, Ordering::Relaxed);
    }

    /// How many times the proxy rebound its endpoint.
    pub fn rebinds(&self) -> usize {
        self.rebind.count.load(Ordering::Relaxed)
    }

    /// Next datagram the proxy sent, waiting for it.
    pub async fn next_sent(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.sent.recv().await
    }

    /// Next datagram the proxy sent, if one is already queued.
    pub fn try_sent(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.sent.try_recv().ok()
    }
}
