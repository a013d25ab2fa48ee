//! # UDP Transport
//!
//! The proxy listens on one UDP socket and talks to both the client and the
//! login server through it. [`DatagramTransport`] is the seam the event loop is
//! written against; [`UdpTransport`] is the tokio implementation.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use crate::error::{ProxyError, Result};

/// Connectionless datagram endpoint.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and source.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send `buf` to `dest` as one datagram.
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Recreate the underlying endpoint on the same local address.
    async fn rebind(&mut self, _attempts: u32, _backoff: Duration) -> Result<()> {
        Ok(())
    }
}

/// Tokio UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "UDP transport bound");
        Ok(Self { socket, local_addr })
    }

    /// Bind, retrying up to `attempts` times with `backoff` between tries.
    pub async fn bind_with_retry(addr: SocketAddr, attempts: u32, backoff: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::bind(addr).await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < attempts => {
                    warn!(%addr, attempt, attempts, error = %e, "Bind failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        trace!(bytes = len, from = %addr, "Datagram received");
        Ok((len, addr))
    }

    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize> {
        let len = self
            .socket
            .send_to(buf, dest)
            .await
            .map_err(|e| ProxyError::Transport(format!("send to {dest} failed: {e}")))?;
        trace!(bytes = len, to = %dest, "Datagram sent");
        Ok(len)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn rebind(&mut self, attempts: u32, backoff: Duration) -> Result<()> {
        let addr = self.local_addr;
        // The old socket must be closed before its port can be taken again.
        let placeholder = UdpSocket::bind(SocketAddr::new(addr.ip(), 0))
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        drop(std::mem::replace(&mut self.socket, placeholder));
        *self = Self::bind_with_retry(addr, attempts, backoff).await?;
        info!(%addr, "UDP transport rebound");
        Ok(())
    }
}
