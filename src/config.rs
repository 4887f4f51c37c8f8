//! Command-line configuration: everything this front-end needs comes in as
//! a flag, there is no on-disk config file to layer underneath.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

pub mod defaults {
    pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:28015";
    pub const DEFAULT_WORKER_COUNT: usize = 4;
}

/// Client connection front-end for a distributed document database.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// address to accept client connections on
    #[arg(long, default_value = defaults::DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// number of round-robin worker slots connections are pinned to
    #[arg(long, default_value_t = defaults::DEFAULT_WORKER_COUNT)]
    pub workers: usize,

    /// PEM-encoded TLS private key; requires --tls-cert
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// PEM-encoded TLS certificate chain; requires --tls-key
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// override the per-connection in-flight query cap normally negotiated
    /// during handshake; mainly useful for load testing
    #[arg(long)]
    pub max_in_flight_override: Option<usize>,

    /// address to expose a Prometheus scrape endpoint on; requires the
    /// `prometheus` feature
    #[cfg(feature = "prometheus")]
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,
}

impl CliArgs {
    /// `Some((key, cert))` when both TLS paths were given, `None` when
    /// neither was; `clap`'s `requires` above rules out exactly one.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_key, &self.tls_cert) {
            (Some(key), Some(cert)) => Some((key, cert)),
            _ => None,
        }
    }
}

/// Build a server-side TLS config from a PEM key and certificate chain,
/// terminated before the handshake runs.
pub fn configure_tls(
    key_path: &std::path::Path,
    cert_path: &std::path::Path,
) -> anyhow::Result<std::sync::Arc<tokio_rustls::rustls::ServerConfig>> {
    use anyhow::Context;
    use std::fs::File;
    use std::io::BufReader;

    let cert_chain = {
        let file = File::open(cert_path)
            .with_context(|| format!("opening TLS certificate at {}", cert_path.display()))?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .context("parsing TLS certificate chain")?
            .into_iter()
            .map(tokio_rustls::rustls::Certificate)
            .collect::<Vec<_>>()
    };

    let private_key = {
        let file = File::open(key_path)
            .with_context(|| format!("opening TLS key at {}", key_path.display()))?;
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
            .context("parsing TLS private key")?;
        let key = keys
            .pop()
            .context("no PKCS8 private key found in the given key file")?;
        tokio_rustls::rustls::PrivateKey(key)
    };

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .context("building TLS server config")?;

    Ok(std::sync::Arc::new(config))
}
