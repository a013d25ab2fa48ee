//! # Transport Layer
//!
//! Datagram endpoints the proxy can run on.
//!
//! - **udp**: the [`DatagramTransport`] trait and the tokio UDP socket behind it
//! - **memory**: an in-process channel pair for driving the proxy in tests

pub mod memory;
pub mod udp;

pub use memory::{MemoryPeer, MemoryTransport};
pub use udp::{DatagramTransport, UdpTransport};
