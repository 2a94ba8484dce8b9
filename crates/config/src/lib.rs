//! Lecat configuration
//!
//! A single immutable [`ProxyConfig`] is built once at startup and handed to
//! every component by reference. Nothing in the proxy reads ambient state.
//!
//! # State directory layout
//!
//! ```text
//! state/
//! ├── server.key     # RSA server key (PEM, owner-only, never overwritten)
//! ├── server.crt     # CA-issued chain, leaf first (PEM, owner-only)
//! └── account.json   # ACME account credentials
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validate;

pub use validate::ConfigError;

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default TLS listen address (all interfaces)
pub const DEFAULT_LISTEN_ADDR: &str = ":443";

/// Name of the server key inside the state directory
pub const SERVER_KEY_NAME: &str = "server";

/// File name of the persisted certificate chain
pub const SERVER_CERT_FILE: &str = "server.crt";

/// File name of the persisted ACME account credentials
pub const ACCOUNT_FILE: &str = "account.json";

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Hostname the certificate is issued for
    pub host: String,

    /// Plaintext backend every connection is forwarded to, e.g. `localhost:8080`
    pub target: String,

    /// TLS listen address; a bare `:port` means all interfaces
    pub listen_addr: String,

    /// Directory holding keys, certificates and account credentials
    pub state_dir: PathBuf,

    /// Optional plaintext listener that redirects to HTTPS and sets HSTS
    pub redirect_addr: Option<String>,

    /// HSTS max-age sent by the redirect listener
    pub hsts_max_age: Duration,

    /// ACME directory URL
    pub directory_url: String,

    /// Terms of service were accepted up front
    pub accept_tos: bool,

    /// Contact email registered with the CA
    pub email: Option<String>,

    /// Advertise HTTP/2 in the TLS handshake
    pub http2: bool,

    /// TCP keepalive probe period for accepted connections
    pub keepalive: Duration,

    /// How long the slower copy direction may run after the first one ends
    pub drain_timeout: Duration,

    /// Upper bound on waiting for the CA to confirm a challenge
    pub validation_timeout: Duration,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

/// Default state directory: `$HOME/.lecat`, or `./.lecat` without a home
pub fn default_state_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".lecat"))
        .unwrap_or_else(|| PathBuf::from(".lecat"))
}

fn default_hsts_max_age() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_directory_url() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

fn default_keepalive() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_validation_timeout() -> Duration {
    Duration::from_secs(120)
}

impl ProxyConfig {
    /// Create a configuration with defaults for everything but host and target
    pub fn new(host: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            listen_addr: default_listen_addr(),
            state_dir: default_state_dir(),
            redirect_addr: None,
            hsts_max_age: default_hsts_max_age(),
            directory_url: default_directory_url(),
            accept_tos: false,
            email: None,
            http2: false,
            keepalive: default_keepalive(),
            drain_timeout: default_drain_timeout(),
            validation_timeout: default_validation_timeout(),
        }
    }

    /// Path of the persisted ACME account credentials
    pub fn account_path(&self) -> PathBuf {
        self.state_dir.join(ACCOUNT_FILE)
    }

    /// Resolved TLS listen address
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_listen_addr(&self.listen_addr)
    }

    /// Resolved redirect listen address, if one is configured
    pub fn redirect_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.redirect_addr
            .as_deref()
            .map(resolve_listen_addr)
            .transpose()
    }

    /// Base directory of the state files
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

/// Resolve a listen address, accepting the `:port` shorthand
pub fn resolve_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let expanded = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    if let Ok(parsed) = expanded.parse::<SocketAddr>() {
        return Ok(parsed);
    }

    expanded
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress {
            field: "listen address",
            value: addr.to_string(),
        })
}
