//! Retry wrapper for outbound provider calls.
//!
//! Every transcription or completion request goes through [`retry_call`],
//! which classifies the failure, applies bounded backoff, and on exhaustion
//! delivers the one user-facing failure notice itself. Enclosing layers see a
//! [`TerminalFailure`] that records whether the user was already told, so no
//! caller ever sends a second error message.

use std::fmt;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{info, warn};

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Timeout, connection failure, or a 5xx; worth retrying right away.
    Transient,
    /// Provider asked us to slow down (plain 429).
    RateLimited,
    /// Billing/quota exceeded (429 with the `insufficient_quota` code).
    /// Will not clear in seconds, so at most one confirmation retry.
    QuotaExhausted,
    /// Auth failure or malformed request; retrying cannot help.
    Permanent,
}

impl ApiErrorKind {
    fn max_attempts(self) -> u32 {
        match self {
            ApiErrorKind::Permanent => 1,
            ApiErrorKind::QuotaExhausted => 2,
            ApiErrorKind::Transient | ApiErrorKind::RateLimited => 3,
        }
    }
}

/// A classified provider error. The message is for logs only and is never
/// shown to the end user.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Classify an HTTP error response by status code and body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 if body.contains("insufficient_quota") => ApiErrorKind::QuotaExhausted,
            429 => ApiErrorKind::RateLimited,
            s if s >= 500 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Permanent,
        };
        let snippet: String = body.chars().take(200).collect();
        Self::new(kind, format!("status {status}: {snippet}"))
    }

    /// Classify a transport-level failure (never got a status code back).
    pub fn from_transport(err: reqwest::Error) -> Self {
        let detail = if err.is_timeout() { "timeout" } else { "connection" };
        Self::new(ApiErrorKind::Transient, format!("{detail}: {err}"))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

/// A failure for which no further retry will happen.
///
/// `user_notified` means the failure notice has already been sent; callers
/// holding one of these must not produce another user-visible message.
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    pub kind: ApiErrorKind,
    pub user_notified: bool,
}

/// Delivery seam for the single user-facing failure notice.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver the notice. Returns true when it actually reached the user.
    async fn notify_failure(&self, text: &str) -> bool;
}

/// Linear backoff: 0s before the first attempt, then 2s, 4s, plus jitter.
fn backoff_delay(failed_attempt: u32) -> Duration {
    let base = Duration::from_secs(2 * failed_attempt as u64);
    base + jitter()
}

/// Sub-250ms jitter derived from the wall clock, to avoid synchronized
/// retries across concurrent requests.
fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos) % 250)
}

/// Run `op` with classification-aware retries.
///
/// `op` receives the 1-based attempt number. On exhaustion, if `notify` is
/// present the notice text is sent through it (exactly once) before the
/// terminal failure is returned. Analysis-stage calls pass `None`: there the
/// "unavailable" marker in the reply is the user-visible signal and a chat
/// message would be noise.
pub async fn retry_call<T, F, Fut>(
    op_name: &str,
    notify: Option<(&dyn Notifier, &str)>,
    mut op: F,
) -> Result<T, TerminalFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{op_name}: succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(err) => {
                let max_attempts = err.kind.max_attempts();
                if attempt >= max_attempts {
                    warn!("{op_name}: giving up after {attempt} attempt(s): {err}");
                    let mut user_notified = false;
                    if let Some((notifier, text)) = notify {
                        user_notified = notifier.notify_failure(text).await;
                    }
                    return Err(TerminalFailure { kind: err.kind, user_notified });
                }
                let delay = backoff_delay(attempt);
                info!(
                    "{op_name}: attempt {attempt}/{max_attempts} failed ({err}), retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct RecordingNotifier {
        sent: AtomicUsize,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self { sent: AtomicUsize::new(0) }
        }
        fn count(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_failure(&self, _text: &str) -> bool {
            self.sent.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn err(kind: ApiErrorKind) -> ApiError {
        ApiError::new(kind, "test failure")
    }

    #[tokio::test]
    async fn test_permanent_makes_exactly_one_attempt() {
        let notifier = RecordingNotifier::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = retry_call("op", Some((&notifier, "failed")), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(err(ApiErrorKind::Permanent)) }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(failure.kind, ApiErrorKind::Permanent);
        assert!(failure.user_notified);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_three_times_with_increasing_delay() {
        let notifier = RecordingNotifier::new();
        let timestamps: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::default();
        let recorded = timestamps.clone();

        let result: Result<(), _> = retry_call("op", Some((&notifier, "failed")), |_| {
            recorded.lock().unwrap().push(Instant::now());
            async { Err(err(ApiErrorKind::Transient)) }
        })
        .await;

        assert!(result.is_err());
        let stamps = timestamps.lock().unwrap();
        assert_eq!(stamps.len(), 3, "transient errors get exactly 3 attempts");

        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_secs(2) && first_gap < Duration::from_millis(2250));
        assert!(second_gap >= Duration::from_secs(4) && second_gap < Duration::from_millis(4250));
        assert!(second_gap > first_gap, "delays must strictly increase");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_notifies_exactly_once() {
        // Scenario: three consecutive rate-limit responses.
        let notifier = RecordingNotifier::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = retry_call("op", Some((&notifier, "failed")), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(err(ApiErrorKind::RateLimited)) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.count(), 1, "the client sends the notice exactly once");
        assert!(result.unwrap_err().user_notified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhausted_makes_at_most_two_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = retry_call("op", None, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(err(ApiErrorKind::QuotaExhausted)) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ApiErrorKind::QuotaExhausted);
        assert!(!failure.user_notified, "no notifier supplied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_sends_no_notice() {
        let notifier = RecordingNotifier::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_call("op", Some((&notifier, "failed")), |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(err(ApiErrorKind::Transient))
                } else {
                    Ok("payload")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.count(), 0);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiError::from_status(500, "").kind, ApiErrorKind::Transient);
        assert_eq!(ApiError::from_status(503, "overloaded").kind, ApiErrorKind::Transient);
        assert_eq!(ApiError::from_status(429, "slow down").kind, ApiErrorKind::RateLimited);
        assert_eq!(
            ApiError::from_status(429, r#"{"error":{"code":"insufficient_quota"}}"#).kind,
            ApiErrorKind::QuotaExhausted,
        );
        assert_eq!(ApiError::from_status(401, "bad key").kind, ApiErrorKind::Permanent);
        assert_eq!(ApiError::from_status(400, "bad request").kind, ApiErrorKind::Permanent);
    }
}
