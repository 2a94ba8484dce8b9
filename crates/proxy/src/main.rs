//! Lecat - Main entry point
//!
//! Drop-in HTTPS for a plaintext TCP service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use lecat_config::{
    ProxyConfig, DEFAULT_LISTEN_ADDR, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING,
    SERVER_KEY_NAME,
};
use lecat_proxy::acme::{AcmeClient, Acquirer, CertificateStore, KeyStore};
use lecat_proxy::{tls, DuplexProxy, RedirectServer};

/// Where Let's Encrypt publishes its subscriber agreement
const LETSENCRYPT_REPOSITORY: &str = "https://letsencrypt.org/repository/";

/// Lecat - a TLS-terminating proxy that gets its own certificate
#[derive(Parser, Debug)]
#[command(name = "lecat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The hostname to get a certificate for, e.g. 'yourservice.yourdomain.tld'
    #[arg(long = "host", env = "LECAT_HOST")]
    host: Option<String>,

    /// The address to forward unencrypted connections to, e.g. 'localhost:8080'
    #[arg(long = "target", env = "LECAT_TARGET")]
    target: Option<String>,

    /// The address to listen on; this almost certainly should be ':443'
    #[arg(long = "addr", env = "LECAT_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Folder to keep state in (defaults to $HOME/.lecat)
    #[arg(long = "path", env = "LECAT_PATH")]
    path: Option<PathBuf>,

    /// If set, listen here and redirect plaintext HTTP to HTTPS with HSTS (usually ':80')
    #[arg(long = "redirect-addr", env = "LECAT_REDIRECT_ADDR")]
    redirect_addr: Option<String>,

    /// HSTS max-age in seconds sent by the redirect listener
    #[arg(long = "hsts-max-age", env = "LECAT_HSTS_MAX_AGE", default_value_t = 24 * 3600)]
    hsts_max_age: u64,

    /// Accept the CA terms of service without prompting
    #[arg(long = "accept-tos", env = "LECAT_ACCEPT_TOS")]
    accept_tos: bool,

    /// Advertise HTTP/2 support in the TLS handshake
    #[arg(long = "support-http2", env = "LECAT_SUPPORT_HTTP2")]
    support_http2: bool,

    /// Contact email registered with the CA
    #[arg(long = "email", env = "LECAT_EMAIL")]
    email: Option<String>,

    /// ACME directory URL
    #[arg(long = "directory", env = "LECAT_DIRECTORY", default_value = LETSENCRYPT_PRODUCTION)]
    directory: String,

    /// Use the Let's Encrypt staging directory
    #[arg(long = "staging", conflicts_with = "directory")]
    staging: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::new(
            self.host.unwrap_or_default(),
            self.target.unwrap_or_default(),
        );
        config.listen_addr = self.addr;
        if let Some(path) = self.path {
            config.state_dir = path;
        }
        config.redirect_addr = self.redirect_addr;
        config.hsts_max_age = Duration::from_secs(self.hsts_max_age);
        config.accept_tos = self.accept_tos;
        config.http2 = self.support_http2;
        config.email = self.email.filter(|email| !email.is_empty());
        config.directory_url = if self.staging {
            LETSENCRYPT_STAGING.to_string()
        } else {
            self.directory
        };
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = cli.into_config();
    config.validate().context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run(config))
}

async fn run(mut config: ProxyConfig) -> Result<()> {
    info!("Loading configuration");

    let store = Arc::new(
        CertificateStore::new(config.state_dir()).context("Failed to make state path")?,
    );
    let server_key = KeyStore::new(config.state_dir())
        .load_or_create_key(SERVER_KEY_NAME)
        .context("Failed to load server key")?;

    let needs_account =
        !config.account_path().exists() && store.load_certificate(&server_key)?.is_none();
    if !config.accept_tos && needs_account {
        config.accept_tos = prompt_terms_of_service(&config.directory_url).await?;
    }

    let client = AcmeClient::new(&config, Arc::clone(&store));
    let mut acquirer = Acquirer::new(client, &config)?;
    let (chain, released) = store
        .load_or_acquire_certificate(&server_key, &mut acquirer)
        .await
        .context("Failed to obtain certificate")?;

    let tls_config = tls::server_config(&chain, server_key.to_rustls()?, config.http2)
        .context("Failed to build TLS configuration")?;

    let redirect = match config.redirect_socket_addr()? {
        Some(addr) => {
            let server = RedirectServer::bind(addr, &config.host, config.hsts_max_age).await?;
            Some(tokio::spawn(server.run()))
        }
        None => None,
    };

    let proxy = DuplexProxy::bind(&config, tls_config, released).await?;
    let proxy = tokio::spawn(proxy.run());

    tokio::select! {
        result = proxy => {
            result.context("Proxy task panicked")??;
            bail!("Proxy listener stopped");
        }
        result = wait_redirect(redirect) => {
            result?;
            bail!("Redirect listener stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

async fn wait_redirect(
    redirect: Option<tokio::task::JoinHandle<Result<(), lecat_proxy::ProxyError>>>,
) -> Result<()> {
    match redirect {
        Some(handle) => {
            let result = handle.await.context("Redirect task panicked")?;
            if let Err(e) = &result {
                error!(error = %e, "Redirect listener failed");
            }
            Ok(result?)
        }
        None => std::future::pending().await,
    }
}

/// Ask the operator to accept the CA terms; EOF on stdin rejects
async fn prompt_terms_of_service(directory_url: &str) -> Result<bool> {
    println!("Do you accept the terms of service of the certificate authority?");
    println!("{}", terms_url(directory_url));
    println!("Press enter to accept, control-c to reject");

    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(read > 0)
}

fn terms_url(directory_url: &str) -> &str {
    if directory_url == LETSENCRYPT_PRODUCTION || directory_url == LETSENCRYPT_STAGING {
        LETSENCRYPT_REPOSITORY
    } else {
        directory_url
    }
}
