//! Binary entry point. Wires the listener to a minimal, in-memory set of
//! collaborators so the front-end is runnable standalone; a real
//! deployment substitutes its own `AuthWatchable`, `QueryCacheFactory`,
//! and `QueryHandler`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use docdb_connfront::auth::{AuthWatchable, StoredCredential};
use docdb_connfront::config::CliArgs;
use docdb_connfront::error::ConnError;
use docdb_connfront::listener::{Listener, TlsContext};
use docdb_connfront::query::{QueryCache, QueryCacheFactory, QueryHandler, QueryParams};
use docdb_connfront::session::{ConnectionSession, Response};

/// Default, no-credentials watchable: an empty legacy key and no SCRAM
/// users, so the server accepts any connection out of the box. Real
/// deployments own their own credential backend.
struct DefaultWatchable {
    legacy_key: Vec<u8>,
    scram_users: HashMap<String, StoredCredential>,
}

#[async_trait]
impl AuthWatchable for DefaultWatchable {
    async fn lookup(&self, user: &str) -> Option<StoredCredential> {
        self.scram_users.get(user).cloned()
    }

    async fn check_legacy_key(&self, presented: &[u8]) -> bool {
        presented == self.legacy_key.as_slice()
    }
}

struct NullCache;
impl QueryCache for NullCache {}

struct NullCacheFactory;
impl QueryCacheFactory for NullCacheFactory {
    fn build(&self, _session: &ConnectionSession) -> Box<dyn QueryCache> {
        Box::new(NullCache)
    }
}

/// Stand-in for the real query execution engine: answers every query with
/// a runtime error rather than silently pretending to execute it.
struct UnimplementedHandler;

#[async_trait]
impl QueryHandler for UnimplementedHandler {
    async fn run_query(
        &self,
        _cache: &dyn QueryCache,
        _params: &QueryParams,
        response: &mut Response,
        _interruptor: CancellationToken,
    ) -> Result<(), ConnError> {
        *response = Response::synthesize_error(
            "no query execution engine is wired into this connection front-end",
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = CliArgs::parse();

    #[cfg(feature = "prometheus")]
    if let Some(metrics_addr) = args.metrics_listen {
        docdb_connfront::metrics::install_prometheus_recorder(metrics_addr)
            .context("installing the Prometheus metrics recorder")?;
    }

    let tls = match args.tls_paths() {
        Some((key, cert)) => {
            let config = docdb_connfront::config::configure_tls(key, cert)
                .context("configuring TLS")?;
            Some(TlsContext(config))
        }
        None => None,
    };

    let watchable: Arc<dyn AuthWatchable> = Arc::new(DefaultWatchable {
        legacy_key: Vec::new(),
        scram_users: HashMap::new(),
    });
    let cache_factory: Arc<dyn QueryCacheFactory> = Arc::new(NullCacheFactory);
    let handler: Arc<dyn QueryHandler> = Arc::new(UnimplementedHandler);

    let listener = Listener::bind_with_max_in_flight_override(
        args.listen,
        args.workers,
        tls,
        watchable,
        cache_factory,
        handler,
        args.max_in_flight_override,
    )
    .await
    .with_context(|| format!("binding to {}", args.listen))?;

    info!(addr = %args.listen, workers = args.workers, "listening");

    let drain = CancellationToken::new();
    let drain_on_signal = drain.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
        drain_on_signal.cancel();
    });

    listener.run(drain).await;
    Ok(())
}
