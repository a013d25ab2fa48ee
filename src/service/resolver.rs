//! # Credential Resolution
//!
//! Decides which credentials a login should carry to the upstream server.
//! Returning `Ok(None)` forwards the client's login untouched; an error is
//! treated the same way by the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::AccountsConfig;
use crate::error::Result;
use crate::protocol::login::Credentials;

/// Maps client-supplied credentials to a substitute pair.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>>;
}

#[async_trait]
impl<R: CredentialResolver + ?Sized> CredentialResolver for Arc<R> {
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>> {
        (**self).resolve(credentials).await
    }
}

/// Never substitutes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSubstitution;

#[async_trait]
impl CredentialResolver for NoSubstitution {
    async fn resolve(&self, _credentials: &Credentials) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

/// In-memory account table keyed by lowercased alias.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    accounts: HashMap<String, Credentials>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: &str, credentials: Credentials) {
        self.accounts.insert(alias.to_lowercase(), credentials);
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn lookup(&self, username: &str) -> Option<&Credentials> {
        self.accounts.get(&username.to_lowercase())
    }
}

#[async_trait]
impl CredentialResolver for StaticAccounts {
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>> {
        Ok(self.lookup(&credentials.account_name()).cloned())
    }
}

/// Declines substitution for listed usernames, delegating the rest.
#[derive(Debug, Clone)]
pub struct SkipList<R> {
    skipped: HashSet<String>,
    inner: R,
}

impl<R> SkipList<R> {
    pub fn new<I, S>(names: I, inner: R) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            skipped: names.into_iter().map(|n| n.as_ref().to_lowercase()).collect(),
            inner,
        }
    }

    pub fn is_skipped(&self, username: &str) -> bool {
        self.skipped.contains(&username.to_lowercase())
    }
}

#[async_trait]
impl<R: CredentialResolver> CredentialResolver for SkipList<R> {
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>> {
        let name = credentials.account_name();
        if self.skipped.contains(&name) {
            debug!(username = %name, "Account on skip list, not substituting");
            return Ok(None);
        }
        self.inner.resolve(credentials).await
    }
}

/// Tries resolvers in order; the first `Some` wins.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn CredentialResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<R: CredentialResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl CredentialResolver for ResolverChain {
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>> {
        for resolver in &self.resolvers {
            if let Some(found) = resolver.resolve(credentials).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// Adapts a synchronous closure.
pub struct FnResolver<F> {
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&Credentials) -> Option<Credentials> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> CredentialResolver for FnResolver<F>
where
    F: Fn(&Credentials) -> Option<Credentials> + Send + Sync,
{
    async fn resolve(&self, credentials: &Credentials) -> Result<Option<Credentials>> {
        Ok((self.f)(credentials))
    }
}

/// Build the resolver described by the `[accounts]` section.
pub fn from_config(accounts: &AccountsConfig) -> Result<Arc<dyn CredentialResolver>> {
    if accounts.proxy_only {
        debug!("Proxy-only mode, credentials are never substituted");
        return Ok(Arc::new(NoSubstitution));
    }
    let mut table = StaticAccounts::new();
    for (alias, entry) in &accounts.local {
        table.insert(alias, Credentials::new(entry.username.as_str(), entry.password.as_str())?);
    }
    debug!(accounts = table.len(), skipped = accounts.skip.len(), "Credential resolver configured");
    Ok(Arc::new(SkipList::new(&accounts.skip, table)))
}
