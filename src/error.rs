//! Error types for silt.
//!
//! All errors that can occur inside the materialization pipeline are
//! represented by [`SiltError`]. Errors are propagated via
//! `Result<T, SiltError>` throughout the codebase; the classifier catches
//! them per record so one bad event never blocks a batch.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine retry behavior:
//! - **User** — malformed statements, missing record tags. Never retried.
//! - **System** — store, catalog, engine, or queue failures. Retried with backoff.
//! - **Transient** — throttling and timeouts. Always retried; an async task
//!   simply stays `RUNNING` longer.
//! - **Internal** — bugs. Not retried.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`] encapsulates exponential backoff with jitter for system
//! and transient errors. The batch classifier drives it through
//! [`RetryState`] to redeliver events whose failure is retryable before
//! giving up on them.

use std::fmt;

/// Primary error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SiltError {
    // ── User errors — fail, don't retry ──────────────────────────────────
    /// A delete-intent statement could not be rewritten (missing alias or
    /// unsupported shape). Raised at trigger time, before any task exists.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// A change event carried a record without a `kind` tag.
    #[error("record is missing its kind tag: {0}")]
    MissingKind(String),

    /// A record, task, or relation was not found where one was required.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── System errors — retry with backoff ───────────────────────────────
    /// The key-value store failed.
    #[error("key-value store error: {0}")]
    Storage(String),

    /// The object store failed.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// The schema catalog failed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The query engine rejected a submission or status call.
    #[error("query engine error: {0}")]
    Engine(String),

    /// The work queue failed to enqueue or acknowledge.
    #[error("work queue error: {0}")]
    Queue(String),

    // ── Transient errors — always retry ──────────────────────────────────
    /// The backing service throttled or timed out; safe to redeliver.
    #[error("transient: {0}")]
    Throttled(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// A value failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SiltError {
    /// Whether this error is retryable by the feed runtime.
    ///
    /// System and transient errors are retryable. User errors and internal
    /// errors are not — redelivering an unparseable record cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiltError::Storage(_)
                | SiltError::ObjectStore(_)
                | SiltError::Catalog(_)
                | SiltError::Engine(_)
                | SiltError::Queue(_)
                | SiltError::Throttled(_)
        )
    }

    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> SiltErrorKind {
        match self {
            SiltError::InvalidStatement(_)
            | SiltError::MissingKind(_)
            | SiltError::NotFound(_)
            | SiltError::InvalidArgument(_) => SiltErrorKind::User,

            SiltError::Storage(_)
            | SiltError::ObjectStore(_)
            | SiltError::Catalog(_)
            | SiltError::Engine(_)
            | SiltError::Queue(_) => SiltErrorKind::System,

            SiltError::Throttled(_) => SiltErrorKind::Transient,

            SiltError::Serde(_) | SiltError::Internal(_) => SiltErrorKind::Internal,
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiltErrorKind {
    User,
    System,
    Transient,
    Internal,
}

impl fmt::Display for SiltErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiltErrorKind::User => write!(f, "USER"),
            SiltErrorKind::System => write!(f, "SYSTEM"),
            SiltErrorKind::Transient => write!(f, "TRANSIENT"),
            SiltErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for system and transient errors.
///
/// Used by feed consumers to decide whether a failed event should be
/// redelivered immediately, deferred, or given up on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000, // 1 second initial
            max_delay_ms: 60_000, // 1 minute cap
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
    /// Adds simple jitter by varying ±25%.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        // Simple deterministic jitter: vary by ±25% based on attempt parity
        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4 // -25%
        } else {
            capped.saturating_mul(5) / 4 // +25%
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ── Per-key Retry State ────────────────────────────────────────────────────

/// Tracks retry state for a single feed key.
///
/// Held in memory by the feed consumer (not persisted). Reset when an event
/// for the key is processed successfully.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of consecutive retryable failures.
    pub attempts: u32,
    /// Timestamp (epoch millis) when the next retry is allowed.
    pub next_retry_at_ms: u64,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retryable failure and compute the next retry time.
    ///
    /// Returns `true` if another retry is allowed, `false` if max attempts exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) -> bool {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            self.next_retry_at_ms = now_ms + policy.backoff_ms(self.attempts - 1);
            true
        } else {
            false
        }
    }

    /// Reset retry state after a successful delivery.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the key is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            SiltError::InvalidStatement("x".into()).kind(),
            SiltErrorKind::User
        );
        assert_eq!(SiltError::MissingKind("x".into()).kind(), SiltErrorKind::User);
        assert_eq!(SiltError::Storage("x".into()).kind(), SiltErrorKind::System);
        assert_eq!(
            SiltError::Throttled("x".into()).kind(),
            SiltErrorKind::Transient
        );
        assert_eq!(
            SiltError::Internal("x".into()).kind(),
            SiltErrorKind::Internal
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SiltError::Storage("x".into()).is_retryable());
        assert!(SiltError::ObjectStore("x".into()).is_retryable());
        assert!(SiltError::Engine("x".into()).is_retryable());
        assert!(SiltError::Throttled("x".into()).is_retryable());

        assert!(!SiltError::InvalidStatement("x".into()).is_retryable());
        assert!(!SiltError::MissingKind("x".into()).is_retryable());
        assert!(!SiltError::Internal("x".into()).is_retryable());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };

        // Attempt 0: 1000 * 2^0 = 1000, -25% = 750
        assert_eq!(policy.backoff_ms(0), 750);
        // Attempt 1: 1000 * 2^1 = 2000, +25% = 2500
        assert_eq!(policy.backoff_ms(1), 2500);
        // Attempt 2: 1000 * 2^2 = 4000, -25% = 3000
        assert_eq!(policy.backoff_ms(2), 3000);
        // Attempt 3: 1000 * 2^3 = 8000, +25% = 10000
        assert_eq!(policy.backoff_ms(3), 10_000);
        // Attempt 4: 1000 * 2^4 = 16000, capped at 10000, -25% = 7500
        assert_eq!(policy.backoff_ms(4), 7500);
    }

    #[test]
    fn test_retry_state_lifecycle() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        assert!(!state.is_in_backoff(1000));
        assert_eq!(state.attempts, 0);

        let now = 10_000;
        assert!(state.record_failure(&policy, now));
        assert_eq!(state.attempts, 1);
        assert!(state.is_in_backoff(now + 100));
        assert!(!state.is_in_backoff(now + 100_000));

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(!state.is_in_backoff(0));
    }

    #[test]
    fn test_retry_state_max_attempts_exhausted() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 2,
        };
        let mut state = RetryState::new();

        assert!(state.record_failure(&policy, 1000));
        assert_eq!(state.attempts, 1);
        assert!(!state.record_failure(&policy, 2000));
        assert_eq!(state.attempts, 2);
    }
}
