//! Pending request bookkeeping.
//!
//! Every request that expects a response gets an entry keyed by its
//! [`RequestId`] holding a completion and an armed timeout. An entry leaves
//! the tracker exactly once, through [`resolve`](RequestTracker::resolve),
//! [`error`](RequestTracker::error), [`expire`](RequestTracker::expire) or
//! [`flush`](RequestTracker::flush); each returns the completion by value so
//! a second settlement has nothing left to call.
//!
//! Timers run as spawned sleeps that report the expired id back through a
//! channel; the owner feeds those ids into `expire`.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Types
// ============================================================================

/// A completion taken out of the tracker together with its outcome.
#[derive(Debug)]
pub(crate) struct Settled<C> {
    pub(crate) callback: C,
    pub(crate) outcome: Result<Value>,
}

/// One pending request.
struct Pending<C> {
    callback: C,
    timeout: Duration,
    /// `None` once cleared; an entry without a timer cannot expire.
    timer: Option<AbortHandle>,
}

// ============================================================================
// RequestTracker
// ============================================================================

/// Tracks in-flight requests and their timeouts.
pub(crate) struct RequestTracker<C> {
    pending: FxHashMap<RequestId, Pending<C>>,
    expired_tx: mpsc::UnboundedSender<RequestId>,
}

impl<C> RequestTracker<C> {
    /// Creates a tracker reporting expired ids into `expired_tx`.
    pub(crate) fn new(expired_tx: mpsc::UnboundedSender<RequestId>) -> Self {
        Self {
            pending: FxHashMap::default(),
            expired_tx,
        }
    }

    /// Registers `request_id` and arms its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] if the id is already pending.
    pub(crate) fn create(
        &mut self,
        request_id: RequestId,
        callback: C,
        timeout: Duration,
    ) -> Result<()> {
        if self.pending.contains_key(&request_id) {
            return Err(Error::duplicate_request(request_id));
        }

        let expired_tx = self.expired_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expired_tx.send(request_id);
        })
        .abort_handle();

        self.pending.insert(
            request_id,
            Pending {
                callback,
                timeout,
                timer: Some(timer),
            },
        );
        trace!(%request_id, ?timeout, "Request registered");
        Ok(())
    }

    /// Disarms the timeout of `request_id`, keeping the entry.
    pub(crate) fn clear_timeout(&mut self, request_id: RequestId) {
        if let Some(timer) = self
            .pending
            .get_mut(&request_id)
            .and_then(|pending| pending.timer.take())
        {
            timer.abort();
        }
    }

    /// Settles `request_id` successfully.
    pub(crate) fn resolve(&mut self, request_id: RequestId, value: Value) -> Option<Settled<C>> {
        self.take(request_id, Ok(value))
    }

    /// Settles `request_id` with `error`.
    pub(crate) fn error(&mut self, request_id: RequestId, error: Error) -> Option<Settled<C>> {
        self.take(request_id, Err(error))
    }

    /// Settles `request_id` with a timeout error if its timer is still armed.
    ///
    /// A timer that fired after the entry was cleared or settled is ignored.
    pub(crate) fn expire(&mut self, request_id: RequestId) -> Option<Settled<C>> {
        let timeout = match self.pending.get(&request_id) {
            Some(pending) if pending.timer.is_some() => pending.timeout,
            _ => return None,
        };

        debug!(%request_id, ?timeout, "Request timed out");
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.take(
            request_id,
            Err(Error::request_timeout(request_id, timeout_ms)),
        )
    }

    /// Settles every pending request with [`Error::Disconnected`].
    pub(crate) fn flush(&mut self) -> Vec<Settled<C>> {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(request_id, _)| *request_id);

        if !drained.is_empty() {
            debug!(count = drained.len(), "Flushing pending requests");
        }

        drained
            .into_iter()
            .map(|(_, pending)| {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                Settled {
                    callback: pending.callback,
                    outcome: Err(Error::Disconnected),
                }
            })
            .collect()
    }

    /// Returns `true` if `request_id` is awaiting a response.
    #[inline]
    pub(crate) fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Number of requests awaiting a response.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    fn take(&mut self, request_id: RequestId, outcome: Result<Value>) -> Option<Settled<C>> {
        let pending = self.pending.remove(&request_id)?;
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        Some(Settled {
            callback: pending.callback,
            outcome,
        })
    }
}

impl<C> Drop for RequestTracker<C> {
    fn drop(&mut self) {
        for pending in self.pending.values_mut() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
