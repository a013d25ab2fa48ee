//! # Core Protocol Components
//!
//! Low-level pieces of the login session protocol.
//!
//! ## Components
//! - **Opcode**: closed set of transport opcodes with an `Unknown` fallback
//! - **Codec**: sequence accessors, Combined sub-packet walking, fragment headers
//!
//! ## Wire Format
//! ```text
//! [Opcode(2, BE)] [Sequence(2, BE) - sequenced opcodes only] [Payload(N)]
//! ```
//!
//! Datagrams are at most 512 bytes; larger application messages are split into
//! fragments and reassembled by [`crate::protocol::sequence`].

pub mod codec;
pub mod opcode;

pub use opcode::Opcode;
