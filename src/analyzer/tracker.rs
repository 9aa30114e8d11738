/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Correlates outgoing requests with their eventual responses.
//!
//! Each tracked request holds a oneshot result handle and a deadline. An
//! entry leaves the map exactly once: on completion, cancellation, explicit
//! failure, or the periodic sweep. The sweep is a safety net for deadlines
//! the awaiting side failed to enforce.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::Response;
use crate::error::{Error, Result};

/// Receiving half of a tracked request's result handle.
pub type ResponseHandle = oneshot::Receiver<Result<Response>>;

struct PendingRequest {
    tx: oneshot::Sender<Result<Response>>,
    command: String,
    deadline: Instant,
}

/// Pending-request table with a hard upper bound.
pub struct RequestTracker {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    max_pending: usize,
    default_timeout: Duration,
}

impl RequestTracker {
    /// Create a tracker allowing at most `max_pending` in-flight requests.
    #[must_use]
    pub fn new(max_pending: usize, default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_pending,
            default_timeout,
        }
    }

    /// Deadline applied when the call site does not supply one.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a request and hand back its result handle.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`Error::Communication`] when the pending bound
    /// is reached; requests are never queued beyond it.
    pub async fn track(
        &self,
        seq: u64,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            return Err(Error::Communication(format!(
                "too many pending requests (limit {})",
                self.max_pending
            )));
        }
        pending.insert(
            seq,
            PendingRequest {
                tx,
                command: command.to_string(),
                deadline: Instant::now() + timeout,
            },
        );
        Ok(rx)
    }

    /// Resolve the matching pending request with this response.
    ///
    /// Returns whether a match was found. Unmatched responses are logged and
    /// otherwise ignored; they are not fatal.
    pub async fn complete(&self, response: Response) -> bool {
        let entry = self.pending.lock().await.remove(&response.request_seq);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Ok(response));
                true
            }
            None => {
                warn!(
                    "response for unknown request_seq {} ({})",
                    response.request_seq, response.command
                );
                false
            }
        }
    }

    /// Resolve one pending request with a failure. Returns whether the entry
    /// was still present.
    pub async fn fail(&self, seq: u64, error: Error) -> bool {
        let entry = self.pending.lock().await.remove(&seq);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Explicitly cancel one pending request.
    pub async fn cancel(&self, seq: u64) -> bool {
        self.fail(seq, Error::Cancelled(format!("request {seq} cancelled")))
            .await
    }

    /// Resolve every pending request with the given failure. Used on shutdown
    /// and on structural channel loss. Returns how many were cancelled.
    pub async fn cancel_all(&self, error: &Error) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("cancelled {count} pending requests");
        }
        count
    }

    /// Reclaim entries whose deadline has passed, resolving each with a
    /// timeout failure. Returns how many were reclaimed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(u64, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let seqs: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| pending.remove(&seq).map(|p| (seq, p)))
                .collect()
        };

        let count = overdue.len();
        for (seq, pending) in overdue {
            warn!("sweeping overdue request {seq} ({})", pending.command);
            let _ = pending.tx.send(Err(Error::Timeout {
                command: pending.command,
                timeout: self.default_timeout,
            }));
        }
        count
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Start the periodic sweep task. Aborted by dropping the handle's owner.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use serde_json::json;

    fn response_for(request_seq: u64) -> Response {
        Response {
            seq: request_seq + 100,
            command: "ping".to_string(),
            request_seq,
            running: true,
            success: true,
            message: None,
            body: Some(json!({"message": "pong"})),
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_handle_once() -> Result<()> {
        let tracker = RequestTracker::new(16, Duration::from_secs(5));
        let rx = tracker.track(1, "ping", None).await?;

        assert!(tracker.complete(response_for(1)).await);
        assert_eq!(tracker.pending_count().await, 0);

        // Second completion for the same sequence finds nothing.
        assert!(!tracker.complete(response_for(1)).await);

        match rx.await {
            Ok(Ok(response)) => assert!(response.success),
            other => bail!("expected response, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unmatched_response_is_not_fatal() {
        let tracker = RequestTracker::new(16, Duration::from_secs(5));
        assert!(!tracker.complete(response_for(42)).await);
    }

    #[tokio::test]
    async fn test_pending_bound_fails_fast() -> Result<()> {
        let tracker = RequestTracker::new(2, Duration::from_secs(5));
        let _a = tracker.track(1, "a", None).await?;
        let _b = tracker.track(2, "b", None).await?;
        let c = tracker.track(3, "c", None).await;
        assert!(matches!(c, Err(Error::Communication(_))));
        assert_eq!(tracker.pending_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_everything() -> Result<()> {
        let tracker = RequestTracker::new(16, Duration::from_secs(5));
        let mut handles = Vec::new();
        for seq in 0..5 {
            handles.push(tracker.track(seq, "open", None).await?);
        }
        let cancelled = tracker
            .cancel_all(&Error::Cancelled("shutdown".to_string()))
            .await;
        assert_eq!(cancelled, 5);
        assert_eq!(tracker.pending_count().await, 0);

        for rx in handles {
            match rx.await {
                Ok(Err(Error::Cancelled(_))) => {}
                other => bail!("expected cancellation, got {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_reclaims_overdue_entries() -> Result<()> {
        let tracker = RequestTracker::new(16, Duration::from_millis(10));
        let rx = tracker.track(1, "slow", None).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(tracker.sweep().await, 1);
        assert_eq!(tracker.pending_count().await, 0);
        match rx.await {
            Ok(Err(Error::Timeout { command, .. })) => assert_eq!(command, "slow"),
            other => bail!("expected timeout, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_single_request() -> Result<()> {
        let tracker = RequestTracker::new(16, Duration::from_secs(5));
        let rx = tracker.track(4, "open", None).await?;

        assert!(tracker.cancel(4).await);
        assert!(!tracker.cancel(4).await);
        assert_eq!(tracker.pending_count().await, 0);

        match rx.await {
            Ok(Err(Error::Cancelled(_))) => {}
            other => bail!("expected cancellation, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_entries() -> Result<()> {
        let tracker = RequestTracker::new(16, Duration::from_secs(30));
        let _rx = tracker.track(1, "fresh", None).await?;
        assert_eq!(tracker.sweep().await, 0);
        assert_eq!(tracker.pending_count().await, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tracking_yields_distinct_entries() -> Result<()> {
        use std::sync::atomic::{AtomicU64, Ordering};

        let tracker = Arc::new(RequestTracker::new(20_000, Duration::from_secs(30)));
        let seq = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10_000 {
            let tracker = Arc::clone(&tracker);
            let seq = Arc::clone(&seq);
            tasks.push(tokio::spawn(async move {
                let seq = seq.fetch_add(1, Ordering::SeqCst);
                tracker.track(seq, "bulk", None).await.map(|rx| (seq, rx))
            }));
        }

        let mut seqs = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for task in tasks {
            let (seq, rx) = task.await??;
            assert!(seqs.insert(seq), "duplicate sequence {seq}");
            handles.push(rx);
        }

        assert_eq!(seqs.len(), 10_000);
        assert_eq!(tracker.pending_count().await, 10_000);

        tracker
            .cancel_all(&Error::Cancelled("test over".to_string()))
            .await;
        assert_eq!(tracker.pending_count().await, 0);
        Ok(())
    }
}
