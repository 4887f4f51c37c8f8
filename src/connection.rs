//! Per-connection scheduler. Bounds concurrent in-flight queries, spawns a
//! task per query, serializes response writes, and aggregates the first
//! failure seen across all of them.
//!
//! Built on `tokio_util::sync::CancellationToken` for draining and
//! `tokio_util::task::TaskTracker` for joining per-query tasks: failures
//! crossing task boundaries become a first-writer-wins error slot plus a
//! latch, rather than being rethrown across task seams.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info_span, Instrument};

use crate::error::ConnError;
use crate::framing::wire;
use crate::metrics;
use crate::query::{QueryCache, QueryHandler, QueryParams};
use crate::session::{ConnectionSession, Response};

/// First-writer-wins slot for the error that triggered an abort: holds
/// both the message (substituted into
/// synthesized error responses) and a flag so a second failure is dropped.
#[derive(Default)]
struct ErrorSlot(StdMutex<Option<String>>);

impl ErrorSlot {
    fn set_first(&self, message: String) -> bool {
        let mut slot = self.0.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(message);
        true
    }

    fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Everything the per-query tasks need to share with the main loop: the
/// concurrency semaphore, the send mutex, the abort latch, and the
/// aggregated error slot.
struct Shared<S> {
    write_half: AsyncMutex<S>,
    error_slot: ErrorSlot,
    abort: CancellationToken,
    drain: CancellationToken,
}

/// Run the connection loop to completion: parse queries until the composite
/// signal fires or the codec hits a terminal error, then await every
/// spawned per-query task before returning.
///
/// `stream` must support split read/write halves since the main loop reads
/// while per-query tasks may concurrently write.
pub async fn run_connection_loop<S>(
    mut read_half: tokio::io::ReadHalf<S>,
    write_half: tokio::io::WriteHalf<S>,
    session: &ConnectionSession,
    cache: Arc<dyn QueryCache>,
    handler: Arc<dyn QueryHandler>,
    drain: CancellationToken,
) -> (tokio::io::WriteHalf<S>, Result<(), ConnError>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let abort = CancellationToken::new();
    let shared = Arc::new(Shared {
        write_half: AsyncMutex::new(write_half),
        error_slot: ErrorSlot::default(),
        abort: abort.clone(),
        drain: drain.clone(),
    });

    let semaphore = Arc::new(Semaphore::new(session.max_in_flight));
    let tasks = TaskTracker::new();

    let composite = {
        let abort = abort.clone();
        let drain = drain.clone();
        async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = drain.cancelled() => {}
            }
        }
    };
    tokio::pin!(composite);

    let loop_result = loop {
        let frame = tokio::select! {
            biased;
            _ = &mut composite => break Ok(()),
            frame = wire::read_query_frame(&mut read_half) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(ConnError::Io(e)),
        };

        let permit = tokio::select! {
            biased;
            _ = &mut composite => break Ok(()),
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            },
        };

        let noreply = frame.noreply();
        let params = QueryParams {
            token: frame.token,
            noreply,
            payload: frame.payload,
            permit,
        };

        spawn_query_task(&tasks, Arc::clone(&shared), Arc::clone(&cache), Arc::clone(&handler), params);

        // Fairness: yield so a fast client can't monopolize the worker
        // between parses.
        tokio::task::yield_now().await;
    };

    tasks.close();
    tasks.wait().await;

    // Every per-query task has finished and dropped its clone of `shared`
    // by now, so this is the sole remaining reference.
    let shared = Arc::try_unwrap(shared)
        .unwrap_or_else(|_| unreachable!("all per-query tasks joined above"));
    let write_half = shared.write_half.into_inner();

    let result = loop_result.and_then(|()| {
        if let Some(message) = shared.error_slot.get() {
            Err(ConnError::Handler(message))
        } else {
            Ok(())
        }
    });
    (write_half, result)
}

fn spawn_query_task<S>(
    tasks: &TaskTracker,
    shared: Arc<Shared<S>>,
    cache: Arc<dyn QueryCache>,
    handler: Arc<dyn QueryHandler>,
    params: QueryParams,
) where
    S: AsyncWrite + Send + Unpin + 'static,
{
    let abort_for_task = shared.abort.clone();
    let drain_for_task = shared.drain.clone();
    let token = params.token;
    metrics::query_started();
    tasks.spawn(
        async move {
            let composite = {
                let abort = abort_for_task.clone();
                let drain = drain_for_task.clone();
                async move {
                    tokio::select! {
                        _ = abort.cancelled() => {}
                        _ = drain.cancelled() => {}
                    }
                }
            };

            let noreply = params.noreply;
            let mut response = Response::synthesize_error("unset");
            let ran = tokio::select! {
                biased;
                _ = composite => None,
                result = handler.run_query(cache.as_ref(), &params, &mut response, abort_for_task.clone()) => Some(result),
            };

            let outcome = match ran {
                Some(Ok(())) => {
                    if noreply {
                        Ok(())
                    } else {
                        let mut guard = shared.write_half.lock().await;
                        wire::write_response_frame(&mut *guard, token, &response.to_wire())
                            .await
                            .map_err(ConnError::Io)
                    }
                }
                Some(Err(e)) => Err(e),
                None => Err(ConnError::Interrupted),
            };

            match &outcome {
                Ok(()) => metrics::query_finished("success"),
                Err(_) => metrics::query_finished("error"),
            }

            if let Err(e) = outcome {
                let message = e.to_string();
                if shared.error_slot.set_first(message.clone()) {
                    shared.abort.cancel();
                }
                let _ = error_reply(&shared, token, noreply, &message).await;
            }
        }
        .instrument(info_span!("query", token)),
    );
}

/// Error-reply branch: synthesize and send at most one error
/// frame, using the *drain* signal (not the composite one) so a best-effort
/// reply can still reach the client while the abort latch is set. Any
/// failure here is swallowed.
async fn error_reply<S>(
    shared: &Shared<S>,
    token: i64,
    noreply: bool,
    first_error_message: &str,
) -> Result<(), ()>
where
    S: AsyncWrite + Unpin,
{
    if noreply {
        return Ok(());
    }
    let message = if shared.drain.is_cancelled() {
        "Server is shutting down.".to_string()
    } else {
        format!("Fatal error on another query: {first_error_message}")
    };
    let response = Response::synthesize_error(message);

    let write = async {
        let mut guard = shared.write_half.lock().await;
        wire::write_response_frame(&mut *guard, token, &response.to_wire()).await
    };

    tokio::select! {
        _ = shared.drain.cancelled() => Err(()),
        result = write => result.map_err(|_| ()),
    }
}

/// Half-close the write side after the connection loop (and, for
/// connection-level errors, the final error frame) has finished. Peer-closed
/// and interrupted failures here are swallowed.
pub async fn shutdown_write_half<S>(write_half: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatedUser;
    use crate::session::{EmptyBatchPolicy, ProtocolVersion, WireProtocol};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, split};

    struct EchoCache;
    impl QueryCache for EchoCache {}

    struct EchoHandler {
        concurrent: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryHandler for EchoHandler {
        async fn run_query(
            &self,
            _cache: &dyn QueryCache,
            params: &QueryParams,
            response: &mut Response,
            _interruptor: tokio_util::sync::CancellationToken,
        ) -> Result<(), ConnError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            *response = Response::Success(serde_json::json!({"token": params.token}));
            Ok(())
        }
    }

    fn session(max_in_flight: usize) -> ConnectionSession {
        ConnectionSession {
            peer_address: "127.0.0.1:1".parse().unwrap(),
            protocol_version: ProtocolVersion(10),
            wire_protocol: WireProtocol::Json,
            authenticated_user: AuthenticatedUser("alice".to_string()),
            max_in_flight,
            empty_batch_policy: EmptyBatchPolicy::SuppressEmpty,
        }
    }

    #[tokio::test]
    async fn answers_a_single_query_with_its_token() {
        let (mut client, server) = duplex(64 * 1024);
        let (read_half, write_half) = split(server);
        let sess = session(1024);
        let cache: Arc<dyn QueryCache> = Arc::new(EchoCache);
        let handler: Arc<dyn QueryHandler> = Arc::new(EchoHandler {
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::new(AtomicUsize::new(0)),
        });
        let drain = CancellationToken::new();

        wire::write_response_frame(&mut client, 42, &serde_json::json!([1, [], {}]))
            .await
            .unwrap();

        let drain2 = drain.clone();
        let handle = tokio::spawn(async move {
            run_connection_loop(read_half, write_half, &sess, cache, handler, drain2).await
        });

        let reply = wire::read_query_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.token, 42);

        drain.cancel();
        let (_write_half, result) = handle.await.unwrap();
        result.unwrap();
    }

    #[tokio::test]
    async fn never_exceeds_max_in_flight() {
        let (mut client, server) = duplex(1024 * 1024);
        let (read_half, write_half) = split(server);
        let sess = session(4);
        let cache: Arc<dyn QueryCache> = Arc::new(EchoCache);
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn QueryHandler> = Arc::new(EchoHandler {
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_seen: max_seen.clone(),
        });
        let drain = CancellationToken::new();

        for token in 0..50 {
            wire::write_response_frame(&mut client, token, &serde_json::json!([1, [], {}]))
                .await
                .unwrap();
        }

        let drain2 = drain.clone();
        let handle = tokio::spawn(async move {
            run_connection_loop(read_half, write_half, &sess, cache, handler, drain2).await
        });

        for _ in 0..50 {
            wire::read_query_frame(&mut client).await.unwrap().unwrap();
        }

        drain.cancel();
        let (_write_half, result) = handle.await.unwrap();
        result.unwrap();
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
    }
}
