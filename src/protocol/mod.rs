//! # Protocol Layer
//!
//! The parts of the proxy that understand the login exchange.
//!
//! ## Components
//! - **Sequence**: renumbers server packets and reassembles the fragmented server listing
//! - **Listing**: filters the reassembled server listing by name prefix
//! - **Login**: decrypts, substitutes and re-encrypts login credentials
//!
//! Nothing in here touches a socket; every operation works on one datagram.

pub mod listing;
pub mod login;
pub mod sequence;


pub use listing::{FilteredListing, ServerListFilter};
pub use login::{Credentials, LoginCipher, LoginRequest};
pub use sequence::{SequenceState, ServerDispatch};
