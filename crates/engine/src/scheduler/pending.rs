use futures::FutureExt;
use sluice_error::{ErrorCode, SluiceError};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

use super::request::QueryId;
use crate::executor::ResultSet;

/// Outcome delivered to every caller waiting on one execution.
pub type QueryResult = Result<Arc<ResultSet>, SluiceError>;

pub type CompletionCallback = Box<dyn FnOnce(&QueryResult) + Send + 'static>;

/// Sending half of a pending result. Consumed on resolution, so a result
/// can be delivered at most once.
pub(crate) struct Completion {
    id: QueryId,
    sender: oneshot::Sender<QueryResult>,
    callback: Option<CompletionCallback>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Completion {
    pub(crate) fn channel(
        id: QueryId,
        callback: Option<CompletionCallback>,
        deduplicated: bool,
    ) -> (Self, PendingResult) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                id,
                sender,
                callback,
            },
            PendingResult {
                id,
                deduplicated,
                receiver,
            },
        )
    }

    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    pub(crate) fn resolve(self, result: &QueryResult) {
        // The caller may have abandoned the handle; the callback still runs.
        let _ = self.sender.send(result.clone());

        if let Some(callback) = self.callback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                warn!(target: "scheduler", query_id = %self.id, "Completion callback panicked");
            }
        }
    }
}

/// Caller-held handle that resolves once the query (or the identical query
/// it was coalesced with) finishes.
#[must_use = "a PendingResult does nothing unless awaited"]
#[derive(Debug)]
pub struct PendingResult {
    id: QueryId,
    deduplicated: bool,
    receiver: oneshot::Receiver<QueryResult>,
}

impl PendingResult {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Whether this handle piggybacks on an identical in-flight request.
    pub fn is_deduplicated(&self) -> bool {
        self.deduplicated
    }

    /// Wait at most `timeout`. Abandons only the wait; the query itself
    /// keeps running once dispatched.
    pub async fn wait_timeout(self, timeout: Duration) -> QueryResult {
        let id = self.id;
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or_else(|_| Err(SluiceError::query_timeout(id, timeout)))
    }
}

impl Future for PendingResult {
    type Output = QueryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(SluiceError::new(
                    ErrorCode::SchedulerStopped,
                    "Scheduler shut down before the query completed",
                ))
            })
        })
    }
}
