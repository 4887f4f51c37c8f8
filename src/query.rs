//! External collaborators this front-end dispatches to, expressed as
//! traits. The query execution engine, storage subsystems, and admin
//! surfaces live behind these seams and are never implemented here.

use async_trait::async_trait;

use crate::error::ConnError;
use crate::session::{ConnectionSession, Response};

/// One parsed inbound query plus everything a handler needs to run it.
/// `permit` holds the throttler slot for the query's full lifetime and is
/// dropped (returning the permit) when the per-query task ends,
/// regardless of outcome.
pub struct QueryParams {
    pub token: i64,
    pub noreply: bool,
    pub payload: serde_json::Value,
    pub permit: tokio::sync::OwnedSemaphorePermit,
}

/// A query cache instance, created once per session after authentication
/// succeeds and dropped when the connection closes. Left fully opaque:
/// this front-end only needs to hand it to the handler.
pub trait QueryCache: Send + Sync {}

/// Builds a [`QueryCache`] keyed by `(peer, empty_batch_policy,
/// authenticated_user)`.
pub trait QueryCacheFactory: Send + Sync {
    fn build(&self, session: &ConnectionSession) -> Box<dyn QueryCache>;
}

/// Runs one query, filling `response` in place. May suspend cooperatively,
/// may fail. `interruptor` is the composite cancellation signal, set when
/// the server drains, the connection aborts, or the peer disappears.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn run_query(
        &self,
        cache: &dyn QueryCache,
        params: &QueryParams,
        response: &mut Response,
        interruptor: tokio_util::sync::CancellationToken,
    ) -> Result<(), ConnError>;
}
