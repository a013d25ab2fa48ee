//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, and timing.
//!
//! ## Components
//! - **Logging**: tracing subscriber setup
//! - **Metrics**: thread-safe proxy counters
//! - **Timeout**: default durations and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{MetricsSnapshot, ProxyMetrics};
