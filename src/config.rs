//! # Configuration Management
//!
//! Centralized configuration for the login proxy.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` / `apply_env()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The DES key and IV are written as hex; the all-zero default only works
//!   against servers that use the same placeholder
//! - Local account passwords live in the config file in clear text, keep it
//!   readable by the proxy user only

use crate::error::{ProxyError, Result};
use crate::protocol::listing::{ServerListFilter, DEFAULT_ALLOWED_PREFIXES};
use crate::protocol::login::LoginCipher;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Port the login server listens on.
pub const DEFAULT_LOGIN_PORT: u16 = 5998;

/// Default upstream login server.
pub const DEFAULT_UPSTREAM: &str = "login.eqemulator.net:5998";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxyConfig {
    /// Listener and upstream settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Login cipher parameters
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Server listing filter
    #[serde(default)]
    pub listing: ListingConfig,

    /// Credential substitution
    #[serde(default)]
    pub accounts: AccountsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `LOGIN_PROXY_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = var("LOGIN_PROXY_LISTEN") {
            self.proxy.listen = listen;
        }

        if let Some(upstream) = var("LOGIN_PROXY_UPSTREAM") {
            self.proxy.upstream = upstream;
        }

        if let Some(timeout) = var("LOGIN_PROXY_SESSION_TIMEOUT_MS") {
            let millis = timeout.parse::<u64>().map_err(|e| {
                ProxyError::Config(format!("LOGIN_PROXY_SESSION_TIMEOUT_MS: {e}"))
            })?;
            self.proxy.session_timeout = Duration::from_millis(millis);
        }

        if let Some(key) = var("LOGIN_PROXY_DES_KEY") {
            self.encryption.key = hex_bytes::parse(&key)
                .map_err(|e| ProxyError::Config(format!("LOGIN_PROXY_DES_KEY: {e}")))?;
        }

        if let Some(iv) = var("LOGIN_PROXY_DES_IV") {
            self.encryption.iv = hex_bytes::parse(&iv)
                .map_err(|e| ProxyError::Config(format!("LOGIN_PROXY_DES_IV: {e}")))?;
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)
            .map_err(|e| ProxyError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.proxy.validate());
        errors.extend(self.listing.validate());
        errors.extend(self.accounts.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener, upstream and timing settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    /// Local address the client connects to (e.g., "0.0.0.0:5998")
    pub listen: String,

    /// Upstream login server as host:port, resolved once at startup
    pub upstream: String,

    /// Idle time after which a client datagram restarts the session
    #[serde(with = "duration_serde")]
    pub session_timeout: Duration,

    /// Delay between bind attempts and after a receive failure
    #[serde(with = "duration_serde")]
    pub restart_backoff: Duration,

    /// Bind attempts before giving up, and consecutive receive failures
    /// before the socket is rebound
    pub max_bind_attempts: u32,

    /// Upper bound on a single credential resolution
    #[serde(with = "duration_serde")]
    pub resolve_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_LOGIN_PORT}"),
            upstream: String::from(DEFAULT_UPSTREAM),
            session_timeout: timeout::SESSION_TIMEOUT,
            restart_backoff: timeout::RESTART_BACKOFF,
            max_bind_attempts: 5,
            resolve_timeout: timeout::RESOLVE_TIMEOUT,
        }
    }
}

impl ProxySettings {
    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid listen address '{}': {e}", self.listen)))
    }

    /// Resolve the upstream host to a socket address.
    pub async fn resolve_upstream(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(self.upstream.as_str())
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to resolve upstream '{}': {e}", self.upstream)))?
            .next()
            .ok_or_else(|| ProxyError::Config(format!("Upstream '{}' resolved to no addresses", self.upstream)))
    }

    /// Validate proxy settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if self.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected format: '0.0.0.0:5998')",
                self.listen
            ));
        }

        match self.upstream.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!(
                "Invalid upstream address: '{}' (expected format: 'login.example.com:5998')",
                self.upstream
            )),
        }

        if self.session_timeout.as_millis() < 1000 {
            errors.push("Session timeout too short (minimum: 1s)".to_string());
        } else if self.session_timeout.as_secs() > 3600 {
            errors.push("Session timeout too long (maximum: 1 hour)".to_string());
        }

        if self.restart_backoff.is_zero() {
            errors.push("Restart backoff must be greater than 0".to_string());
        } else if self.restart_backoff.as_secs() > 60 {
            errors.push("Restart backoff too long (maximum: 60s)".to_string());
        }

        if self.max_bind_attempts == 0 {
            errors.push("Max bind attempts must be greater than 0".to_string());
        }

        if self.resolve_timeout.as_millis() < 100 {
            errors.push("Resolve timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// DES-CBC parameters of the login request
#[derive(Clone, Deserialize, Serialize, Default)]
pub struct EncryptionConfig {
    /// 8-byte key as hex
    #[serde(with = "hex_bytes")]
    pub key: [u8; 8],

    /// 8-byte IV as hex
    #[serde(with = "hex_bytes")]
    pub iv: [u8; 8],
}

impl EncryptionConfig {
    pub fn cipher(&self) -> LoginCipher {
        LoginCipher::new(self.key, self.iv)
    }

    /// Whether the key is the all-zero placeholder
    pub fn is_placeholder(&self) -> bool {
        self.key == [0u8; 8]
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Server listing filter
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListingConfig {
    /// When false the listing is still repacked but every entry is kept
    pub enabled: bool,

    /// Case-insensitive name prefixes that survive the filter
    pub allowed_prefixes: Vec<String>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_prefixes: DEFAULT_ALLOWED_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ListingConfig {
    pub fn filter(&self) -> ServerListFilter {
        if self.enabled {
            ServerListFilter::new(&self.allowed_prefixes)
        } else {
            ServerListFilter::retain_all()
        }
    }

    /// Validate listing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.enabled {
            return errors;
        }

        if self.allowed_prefixes.is_empty() {
            errors.push(
                "Allowed prefixes cannot be empty when the listing filter is enabled".to_string(),
            );
        }

        if self.allowed_prefixes.iter().any(|p| p.trim().is_empty()) {
            errors.push("Allowed prefixes cannot contain blank entries".to_string());
        }

        errors
    }
}

/// A substitute account
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LocalAccount {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LocalAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credential substitution
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AccountsConfig {
    /// Forward every login untouched
    #[serde(default)]
    pub proxy_only: bool,

    /// Account names never substituted
    #[serde(default)]
    pub skip: Vec<String>,

    /// Alias the client types -> account sent upstream
    #[serde(default)]
    pub local: BTreeMap<String, LocalAccount>,
}

impl AccountsConfig {
    /// Validate account configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for name in &self.skip {
            if name.trim().is_empty() {
                errors.push("Skip list cannot contain blank names".to_string());
            } else if !seen.insert(name.to_lowercase()) {
                errors.push(format!("Duplicate skip list entry: '{name}'"));
            }
        }

        let mut aliases = HashSet::new();
        for (alias, account) in &self.local {
            if !aliases.insert(alias.to_lowercase()) {
                errors.push(format!("Duplicate local account alias (case-insensitive): '{alias}'"));
            }
            if account.username.is_empty() {
                errors.push(format!("Local account '{alias}' has an empty username"));
            }
            if account.username.contains('\0') || account.password.contains('\0') {
                errors.push(format!("Local account '{alias}' contains a NUL byte"));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("login-proxy"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

/// Helper module for 8-byte keys written as hex.
///
/// Accepts `"0001020304050607"`, `"00 01 02 03 04 05 06 07"`, `"00:01:..."` and
/// the escaped form `"\x00\x01\x02\x03\x04\x05\x06\x07"`.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt::Write as _;

    pub fn parse(input: &str) -> Result<[u8; 8], String> {
        let digits: String = if input.contains("\\x") {
            input.split("\\x").collect()
        } else {
            input
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ':')
                .collect()
        };
        if digits.len() != 16 {
            return Err(format!(
                "expected 8 bytes of hex, got {} hex digits",
                digits.len()
            ));
        }
        let mut out = [0u8; 8];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = digits
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| "non-ASCII character in hex value".to_string())?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| format!("invalid hex byte '{pair}'"))?;
        }
        Ok(out)
    }

    pub fn format(bytes: &[u8; 8]) -> String {
        bytes.iter().fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    pub fn serialize<S>(bytes: &[u8; 8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 8], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_hex_forms_agree() {
        let expected = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        assert_eq!(hex_bytes::parse("0001020304050607").unwrap(), expected);
        assert_eq!(hex_bytes::parse("00 01 02 03 04 05 06 07").unwrap(), expected);
        assert_eq!(hex_bytes::parse("00:01:02:03:04:05:06:07").unwrap(), expected);
        assert_eq!(
            hex_bytes::parse(r"\x00\x01\x02\x03\x04\x05\x06\x07").unwrap(),
            expected
        );
        assert_eq!(hex_bytes::format(&expected), "0001020304050607");
    }

    #[test]
    fn test_hex_rejects_wrong_length_and_garbage() {
        assert!(hex_bytes::parse("0001").is_err());
        assert!(hex_bytes::parse("zz01020304050607").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOGIN_PROXY_LISTEN", "127.0.0.1:6000"),
            ("LOGIN_PROXY_UPSTREAM", "localhost:5999"),
            ("LOGIN_PROXY_SESSION_TIMEOUT_MS", "30000"),
            ("LOGIN_PROXY_DES_KEY", "0102030405060708"),
        ]
        .into_iter()
        .collect();
        let mut config = ProxyConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:6000");
        assert_eq!(config.proxy.upstream, "localhost:5999");
        assert_eq!(config.proxy.session_timeout, Duration::from_secs(30));
        assert_eq!(config.encryption.key, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(config.encryption.iv, [0u8; 8]);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = ProxyConfig::default();
        let result = config.apply_vars(|name| {
            (name == "LOGIN_PROXY_SESSION_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_encryption_debug_is_redacted() {
        let config = EncryptionConfig {
            key: [0xAB; 8],
            iv: [0xCD; 8],
        };
        let shown = format!("{config:?}");
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains("171"));
    }

    #[test]
    fn test_disabled_listing_retains_everything() {
        let listing = ListingConfig {
            enabled: false,
            allowed_prefixes: Vec::new(),
        };
        assert!(listing.validate().is_empty());
        assert!(listing.filter().is_allowed(b"Anything at all"));
    }
}
