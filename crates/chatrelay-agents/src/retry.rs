use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatrelay_common::{Error, ErrorKind, Result};
use rand::Rng;
use tracing::{debug, warn};

type PersistencePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Exponential backoff with jitter, a per-attempt timeout and a predicate
/// that marks errors as not worth retrying.
#[derive(Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: f64,
    pub attempt_timeout: Duration,
    is_persistent: PersistencePredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            factor: 1.5,
            max_attempts: 5,
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(60),
            is_persistent: Arc::new(is_persistent_error),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_delay", &self.initial_delay)
            .field("factor", &self.factor)
            .field("max_attempts", &self.max_attempts)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(
        initial_delay: Duration,
        factor: f64,
        max_attempts: u32,
        jitter: f64,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            initial_delay,
            factor,
            max_attempts: max_attempts.max(1),
            jitter,
            attempt_timeout,
            ..Self::default()
        }
    }

    pub fn with_persistence(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_persistent = Arc::new(predicate);
        self
    }

    pub fn is_persistent(&self, error: &Error) -> bool {
        (self.is_persistent)(error)
    }

    /// Jitter fraction actually applied. Bounded so that the shortest possible
    /// next delay still exceeds the longest possible current one.
    fn effective_jitter(&self) -> f64 {
        let ceiling = ((self.factor - 1.0) / (self.factor + 1.0) * 0.9).max(0.0);
        self.jitter.clamp(0.0, ceiling)
    }

    /// Unjittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.factor.powi(exp))
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.effective_jitter();
        if jitter == 0.0 {
            return base;
        }
        let scale = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(scale)
    }
}

/// Runs a completion attempt under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct CompletionRetrier {
    policy: RetryPolicy,
}

impl CompletionRetrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `attempt` with the 1-based attempt number until it succeeds, fails
    /// with a persistent error, or the attempt cap is hit. The last error is
    /// returned in the latter two cases.
    pub async fn execute<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.policy;
        let mut n = 1;
        loop {
            let outcome = match tokio::time::timeout(policy.attempt_timeout, attempt(n)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(policy.attempt_timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    if n > 1 {
                        debug!("completion succeeded on attempt {n}");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if policy.is_persistent(&err) {
                debug!("attempt {n} failed with persistent error: {err}");
                return Err(err);
            }
            if n >= policy.max_attempts {
                warn!("giving up after {n} attempts: {err}");
                return Err(err);
            }

            let delay = policy.jittered_delay(n);
            warn!(
                "attempt {n}/{} failed ({err}); retrying in {delay:?}",
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
            n += 1;
        }
    }
}

/// Default persistence rule: anything that is not a transient failure, plus
/// API rejections that a retry cannot change (4xx other than 408 and 429).
/// A stalled stream ends the turn; the user decides whether to ask again.
pub fn is_persistent_error(error: &Error) -> bool {
    match error.kind() {
        ErrorKind::Transient => match error.root() {
            Error::Agent(message) => extract_status_code(&message.to_ascii_lowercase())
                .is_some_and(|status| (400..500).contains(&status) && status != 408 && status != 429),
            _ => false,
        },
        ErrorKind::Authorization
        | ErrorKind::Stall
        | ErrorKind::Persistent
        | ErrorKind::Data
        | ErrorKind::Shutdown => true,
    }
}

fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let after_marker = search_start + offset + marker.len();
            let digits: String = message[after_marker..]
                .trim_start()
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() == 3
                && let Ok(status) = digits.parse::<u16>()
            {
                return Some(status);
            }
            search_start = after_marker;
        }
    }
    None
}
