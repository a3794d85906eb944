//! Fire-and-forget delivery to the external analytics platform.
//!
//! Delivery runs on a spawned task after the business transaction has
//! already committed: it is retried with backoff and a final failure is
//! logged, never surfaced to the caller.

use crate::retry::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// A committed business fact forwarded to analytics.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    /// Event kind, e.g. `order.placed`.
    pub kind: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// When the fact was committed.
    pub occurred_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Delivery failure reported by a sink.
#[derive(Error, Debug)]
#[error("analytics delivery failed: {0}")]
pub struct SinkError(pub String);

/// Transport to the analytics platform.
pub trait AnalyticsSink: Send + Sync {
    /// Deliver one event.
    fn deliver<'a>(
        &'a self,
        event: &'a AnalyticsEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Publisher wrapping a sink with retry and failure containment.
#[derive(Clone)]
pub struct AnalyticsPublisher {
    sink: Arc<dyn AnalyticsSink>,
    policy: RetryPolicy,
}

impl AnalyticsPublisher {
    /// Wrap `sink` with the default policy (3 retries, doubling backoff).
    #[must_use]
    pub fn new(sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            sink,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Hand `event` off for asynchronous delivery and return immediately.
    ///
    /// The returned handle is only for tests that need to await delivery;
    /// production callers drop it.
    pub fn notify(&self, event: AnalyticsEvent) -> tokio::task::JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let policy = self.policy;
        tokio::spawn(async move {
            let kind = event.kind.clone();
            let outcome = retry_with_backoff(policy, || sink.deliver(&event)).await;
            if let Err(err) = outcome {
                tracing::error!(kind = %kind, error = %err, "analytics event dropped");
            } else {
                tracing::debug!(kind = %kind, "analytics event delivered");
            }
        })
    }
}

impl std::fmt::Debug for AnalyticsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsPublisher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// In-memory sink for tests: records delivered events and can fail the
/// first `fail_times` attempts.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: std::sync::Mutex<Vec<AnalyticsEvent>>,
    fail_times: std::sync::atomic::AtomicUsize,
}

impl RecordingSink {
    /// A sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects the first `n` delivery attempts.
    #[must_use]
    pub fn failing(n: usize) -> Self {
        Self {
            delivered: std::sync::Mutex::new(Vec::new()),
            fail_times: std::sync::atomic::AtomicUsize::new(n),
        }
    }

    /// Events accepted so far.
    ///
    /// # Panics
    ///
    /// Never panics; a poisoned mutex is recovered.
    #[must_use]
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        match self.delivered.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AnalyticsSink for RecordingSink {
    fn deliver<'a>(
        &'a self,
        event: &'a AnalyticsEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let remaining = self
                .fail_times
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| n.checked_sub(1),
                )
                .is_ok();
            if remaining {
                return Err(SinkError("injected failure".to_owned()));
            }
            let mut delivered = match self.delivered.lock() {
                Ok(events) => events,
                Err(poisoned) => poisoned.into_inner(),
            };
            delivered.push(event.clone());
            Ok(())
        })
    }
}
