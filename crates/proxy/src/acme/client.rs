//! ACME protocol client
//!
//! [`CertificateAuthority`] is the seam between the acquisition flow and the
//! CA. [`AcmeClient`] implements it on top of `instant-acme`; tests drive the
//! flow with scripted implementations instead.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use lecat_config::ProxyConfig;

use super::challenge::{Authorization, Challenge, ChallengeKind};
use super::error::{AcmeError, StorageError};
use super::storage::{CertificateChain, CertificateStore};

/// First pause between order status polls
const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Longest pause between order status polls
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Operations the acquisition flow needs from a certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Make sure an account exists and is usable
    async fn register(&mut self) -> Result<(), AcmeError>;

    /// Ask for authorization to issue for `hostname`
    async fn authorize(&mut self, hostname: &str) -> Result<Authorization, AcmeError>;

    /// The key authorization string answering `challenge`
    fn key_authorization(&self, challenge: &Challenge) -> Result<String, AcmeError>;

    /// Tell the CA the challenge can be validated and wait for the verdict
    async fn challenge_ready(&mut self, challenge: &Challenge) -> Result<(), AcmeError>;

    /// Submit a DER-encoded CSR and return the issued chain, leaf first
    async fn new_certificate(&mut self, csr_der: &[u8]) -> Result<CertificateChain, AcmeError>;
}

/// `instant-acme` backed certificate authority
pub struct AcmeClient {
    directory_url: String,
    email: Option<String>,
    terms_accepted: bool,
    timeout: Duration,
    storage: Arc<CertificateStore>,
    account: Option<Account>,
    order: Option<Order>,
    challenges: Vec<instant_acme::Challenge>,
}

impl AcmeClient {
    /// Create a client for the configured directory
    pub fn new(config: &ProxyConfig, storage: Arc<CertificateStore>) -> Self {
        Self {
            directory_url: config.directory_url.clone(),
            email: config.email.clone(),
            terms_accepted: config.accept_tos,
            timeout: config.validation_timeout,
            storage,
            account: None,
            order: None,
            challenges: Vec::new(),
        }
    }

    async fn create_account(&self) -> Result<Account, AcmeError> {
        if !self.terms_accepted {
            return Err(AcmeError::TermsNotAccepted);
        }

        let contact = self.email.as_ref().map(|email| format!("mailto:{email}"));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!(directory = %self.directory_url, "Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let json = serde_json::to_string_pretty(&credentials).map_err(StorageError::from)?;
        self.storage.save_credentials_json(&json)?;

        Ok(account)
    }

    fn order_mut(&mut self) -> Result<&mut Order, AcmeError> {
        self.order
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no order in progress".to_string()))
    }

    /// Poll the order until it leaves the pending and processing states
    async fn wait_for_order(&mut self) -> Result<OrderStatus, AcmeError> {
        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        let order = self.order_mut()?;
        let mut interval = INITIAL_POLL_INTERVAL;

        loop {
            order.refresh().await?;
            let state = order.state();
            trace!(status = ?state.status, "Polled order");

            match state.status {
                OrderStatus::Pending | OrderStatus::Processing => {}
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|problem| format!("{problem:?}"))
                        .unwrap_or_else(|| "order is invalid".to_string());
                    return Err(AcmeError::ValidationFailed(reason));
                }
                status => return Ok(status),
            }

            if Instant::now() + interval > deadline {
                return Err(AcmeError::Timeout(timeout));
            }
            sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("registered", &self.account.is_some())
            .field("order_in_progress", &self.order.is_some())
            .finish()
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn register(&mut self) -> Result<(), AcmeError> {
        let account = match self.storage.load_credentials_json()? {
            Some(json) => {
                let credentials: AccountCredentials =
                    serde_json::from_str(&json).map_err(StorageError::from)?;
                let account = Account::from_credentials(credentials).await?;
                info!("Loaded existing ACME account");
                account
            }
            None => self.create_account().await?,
        };

        self.account = Some(account);
        Ok(())
    }

    async fn authorize(&mut self, hostname: &str) -> Result<Authorization, AcmeError> {
        let account = self
            .account
            .as_ref()
            .ok_or_else(|| AcmeError::Protocol("account not registered".to_string()))?;

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(hostname = %hostname, "Created order");

        let mut authorizations = order.authorizations().await?;
        if authorizations.len() != 1 {
            return Err(AcmeError::Protocol(format!(
                "expected one authorization for {hostname}, got {}",
                authorizations.len()
            )));
        }
        let authz = authorizations.remove(0);
        let Identifier::Dns(identifier) = &authz.identifier;

        // Every offered challenge is an alternative on its own
        let combinations = authz
            .challenges
            .iter()
            .map(|challenge| {
                vec![Challenge {
                    kind: challenge_kind(&challenge.r#type),
                    token: challenge.token.clone(),
                    url: challenge.url.clone(),
                }]
            })
            .collect();

        let authorization = Authorization {
            identifier: identifier.clone(),
            already_valid: authz.status == AuthorizationStatus::Valid,
            combinations,
        };

        self.challenges = authz.challenges;
        self.order = Some(order);
        Ok(authorization)
    }

    fn key_authorization(&self, challenge: &Challenge) -> Result<String, AcmeError> {
        let order = self
            .order
            .as_ref()
            .ok_or_else(|| AcmeError::Protocol("no order in progress".to_string()))?;
        let offered = self
            .challenges
            .iter()
            .find(|offered| offered.url == challenge.url)
            .ok_or_else(|| {
                AcmeError::Protocol(format!("challenge {} was not offered", challenge.url))
            })?;

        Ok(order.key_authorization(offered).as_str().to_string())
    }

    async fn challenge_ready(&mut self, challenge: &Challenge) -> Result<(), AcmeError> {
        self.order_mut()?.set_challenge_ready(&challenge.url).await?;
        info!(kind = %challenge.kind, "Challenge accepted, waiting for validation");

        match self.wait_for_order().await? {
            OrderStatus::Ready | OrderStatus::Valid => Ok(()),
            status => Err(AcmeError::Protocol(format!(
                "unexpected order status {status:?}"
            ))),
        }
    }

    async fn new_certificate(&mut self, csr_der: &[u8]) -> Result<CertificateChain, AcmeError> {
        self.order_mut()?.finalize(csr_der).await?;

        let deadline = Instant::now() + self.timeout;
        let mut interval = INITIAL_POLL_INTERVAL;
        let pem = loop {
            if let Some(pem) = self.order_mut()?.certificate().await? {
                break pem;
            }
            if Instant::now() + interval > deadline {
                return Err(AcmeError::Timeout(self.timeout));
            }
            trace!("Certificate not issued yet");
            sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        };

        self.order = None;
        self.challenges.clear();
        parse_chain(&pem)
    }
}

fn challenge_kind(kind: &ChallengeType) -> ChallengeKind {
    match kind {
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        #[allow(unreachable_patterns)]
        other => ChallengeKind::Other(format!("{other:?}")),
    }
}

/// Decode the PEM chain returned by the CA, keeping every certificate in order
fn parse_chain(pem_chain: &str) -> Result<CertificateChain, AcmeError> {
    let chain = CertificateChain::from_pem(Path::new("CA response"), pem_chain.as_bytes())?;
    debug!(chain_len = chain.certs().len(), "Received certificate chain");
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::keys::PrivateKey;
    use crate::acme::self_signed::self_signed;
    use tempfile::TempDir;

    #[test]
    fn test_challenge_kind_mapping() {
        assert_eq!(challenge_kind(&ChallengeType::TlsAlpn01), ChallengeKind::TlsAlpn01);
        assert_eq!(challenge_kind(&ChallengeType::Http01), ChallengeKind::Http01);
        assert_eq!(challenge_kind(&ChallengeType::Dns01), ChallengeKind::Dns01);
    }

    #[test]
    fn test_parse_chain_keeps_order() {
        let key = PrivateKey::generate().unwrap();
        let leaf = self_signed(&key, "leaf.example.test").unwrap();
        let issuer = self_signed(&key, "issuer.example.test").unwrap();
        let pem = format!("{}{}", leaf.to_pem(), issuer.to_pem());

        let chain = parse_chain(&pem).unwrap();
        assert_eq!(chain.certs().len(), 2);
        assert_eq!(chain.leaf(), leaf.leaf());
        assert_eq!(&chain.certs()[1], issuer.leaf());
    }

    #[test]
    fn test_parse_chain_rejects_empty() {
        assert!(matches!(
            parse_chain(""),
            Err(AcmeError::Storage(StorageError::MissingBlock { .. }))
        ));
    }

    #[tokio::test]
    async fn test_terms_must_be_accepted_for_new_account() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStore::new(temp_dir.path()).unwrap());

        let mut config = ProxyConfig::new("example.test", "localhost:8080");
        config.directory_url = "https://127.0.0.1:1/directory".to_string();
        let mut client = AcmeClient::new(&config, storage);

        let err = client.register().await.unwrap_err();
        assert!(matches!(err, AcmeError::TermsNotAccepted));
        assert!(!temp_dir.path().join(lecat_config::ACCOUNT_FILE).exists());
    }

    #[tokio::test]
    async fn test_authorize_requires_registration() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStore::new(temp_dir.path()).unwrap());
        let config = ProxyConfig::new("example.test", "localhost:8080");
        let mut client = AcmeClient::new(&config, storage);

        let err = client.authorize("example.test").await.unwrap_err();
        assert!(matches!(err, AcmeError::Protocol(_)));
    }
}
