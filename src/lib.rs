//! # Login Proxy
//!
//! A transparent UDP proxy for a legacy game login protocol. It sits between a
//! client and the real login server and:
//!
//! - filters the server listing down to servers whose names start with an
//!   allowed prefix, renumbering the session's sequence space to hide the change
//! - optionally swaps the credentials in the client's login request for a
//!   different account, re-encrypting them with the protocol's DES-CBC scheme
//!
//! ## Layers
//! - [`core`]: opcodes and wire accessors
//! - [`protocol`]: sequence engine, listing filter, credential rewriter
//! - [`service`]: session controller, resolvers, async event loop
//! - [`transport`]: UDP socket and an in-memory stand-in
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use login_proxy::config::ProxyConfig;
//! use login_proxy::service::{resolver, LoginProxy};
//! use login_proxy::utils::ProxyMetrics;
//!
//! # async fn run() -> login_proxy::error::Result<()> {
//! let config = ProxyConfig::from_env()?;
//! let resolver = resolver::from_config(&config.accounts)?;
//! let proxy = LoginProxy::bind(&config, resolver, Arc::new(ProxyMetrics::new())).await?;
//! proxy.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use service::LoginProxy;
