//! Configuration validation
//!
//! Missing or malformed inputs are detected once at startup and are fatal.

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{resolve_listen_addr, ProxyConfig};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--host argument required")]
    MissingHost,

    #[error("--target argument required")]
    MissingTarget,

    #[error("Invalid {field}: {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Invalid ACME directory URL {url:?}: {reason}")]
    InvalidDirectory { url: String, reason: String },
}

impl ProxyConfig {
    /// Validate the configuration
    ///
    /// Checks that the required values are present and that every address
    /// and URL can be used before any key material is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }

        if self.target.trim().is_empty() {
            return Err(ConfigError::MissingTarget);
        }

        validate_target(&self.target)?;
        resolve_listen_addr(&self.listen_addr)?;

        if let Some(ref redirect) = self.redirect_addr {
            resolve_listen_addr(redirect).map_err(|_| ConfigError::InvalidAddress {
                field: "redirect address",
                value: redirect.clone(),
            })?;
        }

        validate_directory_url(&self.directory_url)?;

        debug!(
            host = %self.host,
            target = %self.target,
            listen = %self.listen_addr,
            state_dir = %self.state_dir.display(),
            "Configuration validated"
        );

        Ok(())
    }
}

/// The backend is dialed per connection, so only its shape is checked here
fn validate_target(target: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        field: "target address",
        value: target.to_string(),
    };

    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

fn validate_directory_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidDirectory {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "https" => Ok(()),
        // Local test CAs (pebble and friends) are reached over plain HTTP
        "http" if is_loopback_host(&url) => Ok(()),
        other => Err(ConfigError::InvalidDirectory {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn valid_config() -> ProxyConfig {
        ProxyConfig::new("example.test", "localhost:8080")
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.host = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingHost)));
    }

    #[test]
    fn test_missing_target() {
        let mut config = valid_config();
        config.target = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingTarget)));
    }

    #[test]
    fn test_target_without_port() {
        let mut config = valid_config();
        config.target = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { field: "target address", .. })
        ));
    }

    #[test]
    fn test_bad_redirect_address() {
        let mut config = valid_config();
        config.redirect_addr = Some("::nope::".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { field: "redirect address", .. })
        ));
    }

    #[test]
    fn test_plain_http_directory_only_for_loopback() {
        let mut config = valid_config();

        config.directory_url = "http://127.0.0.1:14000/dir".to_string();
        assert!(config.validate().is_ok());

        config.directory_url = "http://acme.example.com/directory".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDirectory { .. })
        ));
    }

    #[test]
    fn test_unparsable_directory() {
        let mut config = valid_config();
        config.directory_url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDirectory { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_port_shorthand_resolves(port in any::<u16>()) {
            let addr = resolve_listen_addr(&format!(":{port}")).unwrap();
            prop_assert_eq!(addr.port(), port);
            prop_assert!(addr.ip().is_unspecified());
        }
    }
}
