//! # Service Layer
//!
//! Session tracking, credential resolution and the async loop that ties them to
//! a socket.

pub mod proxy;
pub mod resolver;
pub mod session;

pub use proxy::LoginProxy;
pub use resolver::{
    CredentialResolver, FnResolver, NoSubstitution, ResolverChain, SkipList, StaticAccounts,
};
pub use session::{ClientAction, FollowingSession, SessionController};
