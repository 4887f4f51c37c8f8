//! Listener and dispatcher. Accepts TCP connections, optionally terminates
//! TLS, pins each connection to a worker via a private round-robin
//! counter, and runs the handshake followed by the connection loop. On any
//! connection-level error it writes exactly one final error frame in the
//! negotiated protocol's shape before half-closing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use crate::auth::AuthWatchable;
use crate::connection;
use crate::error::{ClientErrorCode, ConnError, ErrorKind, ReportableError, UserFacingError};
use crate::handshake;
use crate::metrics;
use crate::query::{QueryCacheFactory, QueryHandler};

/// Distinct error kind so an operator can recognize "someone else already
/// owns this port" at a glance.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("could not bind to {addr}: port already in use")]
    AddressInUse { addr: SocketAddr },
    #[error("could not bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Optional server-side TLS. Left as a thin wrapper over
/// `tokio_rustls::TlsAcceptor` rather than re-deriving certificate
/// provisioning, which stays an external collaborator.
#[derive(Clone)]
pub struct TlsContext(pub Arc<tokio_rustls::rustls::ServerConfig>);

impl TlsContext {
    fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.0.clone())
    }
}

/// One round-robin worker slot: its own connection queue and its own
/// `TaskTracker` so the dispatcher's drainer can wait for every worker's
/// in-flight connections independently.
struct Worker {
    tasks: TaskTracker,
}

pub struct Listener {
    listener: TcpListener,
    tls: Option<TlsContext>,
    workers: Vec<Arc<Worker>>,
    next_worker: AtomicUsize,
    watchable: Arc<dyn AuthWatchable>,
    cache_factory: Arc<dyn QueryCacheFactory>,
    handler: Arc<dyn QueryHandler>,
    max_in_flight_override: Option<usize>,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        worker_count: usize,
        tls: Option<TlsContext>,
        watchable: Arc<dyn AuthWatchable>,
        cache_factory: Arc<dyn QueryCacheFactory>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<Self, ListenError> {
        Self::bind_with_max_in_flight_override(
            addr,
            worker_count,
            tls,
            watchable,
            cache_factory,
            handler,
            None,
        )
        .await
    }

    /// Same as [`Self::bind`], but overrides the negotiated `max_in_flight`
    /// for every connection, mainly useful for load testing.
    pub async fn bind_with_max_in_flight_override(
        addr: SocketAddr,
        worker_count: usize,
        tls: Option<TlsContext>,
        watchable: Arc<dyn AuthWatchable>,
        cache_factory: Arc<dyn QueryCacheFactory>,
        handler: Arc<dyn QueryHandler>,
        max_in_flight_override: Option<usize>,
    ) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::AddrInUse {
                ListenError::AddressInUse { addr }
            } else {
                ListenError::Bind { addr, source }
            }
        })?;

        let workers = (0..worker_count.max(1))
            .map(|_| {
                Arc::new(Worker {
                    tasks: TaskTracker::new(),
                })
            })
            .collect();

        Ok(Self {
            listener,
            tls,
            workers,
            next_worker: AtomicUsize::new(0),
            watchable,
            cache_factory,
            handler,
            max_in_flight_override,
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept connections until `drain` is cancelled, then wait for every
    /// worker's in-flight connections to unwind.
    pub async fn run(self, drain: CancellationToken) {
        let workers = self.workers.clone();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let worker_idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            let worker = Arc::clone(&self.workers[worker_idx]);
            let tls = self.tls.clone();
            let watchable = Arc::clone(&self.watchable);
            let cache_factory = Arc::clone(&self.cache_factory);
            let handler = Arc::clone(&self.handler);
            let conn_drain = drain.clone();
            let max_in_flight_override = self.max_in_flight_override;

            worker.tasks.spawn(
                async move {
                    handle_connection(
                        socket,
                        peer_addr,
                        tls,
                        watchable,
                        cache_factory,
                        handler,
                        conn_drain,
                        max_in_flight_override,
                    )
                    .await;
                }
                .instrument(info_span!("connection", peer = %peer_addr)),
            );
        }

        for worker in &workers {
            worker.tasks.close();
        }
        for worker in &workers {
            worker.tasks.wait().await;
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsContext>,
    watchable: Arc<dyn AuthWatchable>,
    cache_factory: Arc<dyn QueryCacheFactory>,
    handler: Arc<dyn QueryHandler>,
    drain: CancellationToken,
    max_in_flight_override: Option<usize>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }
    if let Ok(sock_ref) = socket2::SockRef::try_from(&socket) {
        if let Err(e) = sock_ref.set_keepalive(true) {
            warn!(error = %e, "failed to enable TCP keepalive");
        }
    }

    metrics::connection_opened();

    match tls {
        Some(tls_ctx) => match tls_ctx.acceptor().accept(socket).await {
            Ok(tls_stream) => {
                run_session(
                    tls_stream,
                    peer_addr,
                    watchable,
                    cache_factory,
                    handler,
                    drain,
                    max_in_flight_override,
                )
                .await;
            }
            Err(e) => {
                // TLS handshake failure: log a warning and close silently,
                // no protocol bytes have been exchanged yet.
                warn!(error = %e, "TLS handshake failed");
            }
        },
        None => {
            run_session(
                socket,
                peer_addr,
                watchable,
                cache_factory,
                handler,
                drain,
                max_in_flight_override,
            )
            .await;
        }
    }

    metrics::connection_closed();
}

async fn run_session<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    watchable: Arc<dyn AuthWatchable>,
    cache_factory: Arc<dyn QueryCacheFactory>,
    handler: Arc<dyn QueryHandler>,
    drain: CancellationToken,
    max_in_flight_override: Option<usize>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let mut session = match handshake::run_handshake(&mut stream, peer_addr, watchable).await {
        Ok(session) => session,
        Err((version, err)) => {
            report_connection_error(&mut stream, version, &err).await;
            return;
        }
    };
    if let Some(max_in_flight) = max_in_flight_override {
        session.max_in_flight = max_in_flight;
    }

    info!(user = %session.authenticated_user, version = session.protocol_version.0, "authenticated");
    let version = session.protocol_version.0;

    let cache = Arc::from(cache_factory.build(&session));
    let (read_half, write_half) = tokio::io::split(stream);
    let (mut write_half, result) =
        connection::run_connection_loop(read_half, write_half, &session, cache, handler, drain).await;

    if let Err(err) = result {
        report_connection_error(&mut write_half, Some(version), &err).await;
    } else {
        connection::shutdown_write_half(&mut write_half).await;
    }
}

/// Write exactly one final error frame in the shape matching
/// `protocol_version` (or the legacy shape if negotiation never advanced),
/// then shut down the write half. Interrupt and peer-close failures while
/// writing this are swallowed.
async fn report_connection_error<S>(stream: &mut S, version: Option<u8>, err: &ConnError)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    if matches!(err, ConnError::Interrupted | ConnError::PeerClosed) {
        let _ = connection::shutdown_write_half(stream).await;
        return;
    }

    if err.get_error_kind() == ErrorKind::Auth {
        metrics::auth_failure(err.get_error_kind().to_metric_label());
    }

    let code = ClientErrorCode::client_code(err).unwrap_or(-1);
    let message = err.to_string_client();
    let _ = handshake::write_final_error(stream, version, code, &message).await;
    connection::shutdown_write_half(stream).await;
}
