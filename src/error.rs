//! # Error Types
//!
//! Error handling for the login proxy.
//!
//! Every fallible operation in the crate returns [`Result`]. Most of these errors
//! never leave a single datagram's processing: the session layer turns them into
//! "drop this datagram" and the credential rewriter turns them into "forward the
//! original bytes". Only transport and configuration errors reach the caller of
//! [`LoginProxy::run`](crate::service::proxy::LoginProxy::run).
//!
//! ## Error Categories
//! - **Framing**: truncated headers, sub-packets that overrun their container
//! - **Sequencing**: sequence numbers behind the reassembly baseline
//! - **Cryptographic**: DES-CBC failures while rewriting a login
//! - **Resolution**: the external credential lookup failed
//! - **Transport / Config**: socket and startup failures
//!
//! ## Example Usage
//! ```rust
//! use login_proxy::error::{ProxyError, Result};
//!
//! fn opcode_of(buf: &[u8]) -> Result<u16> {
//!     match buf {
//!         [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
//!         _ => Err(ProxyError::Truncated { needed: 2, got: buf.len() }),
//!     }
//! }
//!
//! assert_eq!(opcode_of(&[0x00, 0x09]).unwrap(), 0x09);
//! assert!(opcode_of(&[0x00]).is_err());
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error message constants shared by log lines and error payloads.
pub mod constants {
    pub const ERR_COMBINED_OVERRUN: &str = "Combined sub-packet overruns its container";
    pub const ERR_SHORT_FIRST_FRAGMENT: &str = "First fragment shorter than its header";
    pub const ERR_SHORT_FRAGMENT: &str = "Continuation fragment shorter than its header";
    pub const ERR_LISTING_TRUNCATED: &str = "Server listing entry runs past the reassembled blob";
    pub const ERR_LISTING_HEADER: &str = "Server listing shorter than its header";
    pub const ERR_MISSING_FRAGMENT: &str = "Fragment slot empty during reassembly";
    pub const ERR_CIPHERTEXT_ALIGNMENT: &str = "Login ciphertext is not a whole number of DES blocks";
    pub const ERR_EMPTY_USERNAME: &str = "Login plaintext has an empty username";
    pub const ERR_OUTSIDE_WINDOW: &str = "Sequence outside reorder window";
}

/// Primary error type for all proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Truncated datagram: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Sequence {seq} is behind the reassembly baseline {offset}")]
    StaleSequence { seq: u16, offset: u16 },

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: {0}")]
    Decryption(&'static str),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Rewritten login too large for its length byte: {0} bytes")]
    LengthOverflow(usize),

    #[error("Credential resolution failed: {0}")]
    Resolver(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Type alias for Results using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
