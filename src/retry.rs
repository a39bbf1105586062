use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, ErrorCode};

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

type BackoffFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// Delay before retry number `attempt` (1-based).
#[derive(Clone)]
pub enum Backoff {
    /// `attempt * base`
    Linear { base: Duration },
    /// `min(base * 2^(attempt - 1), cap)`
    Exponential { base: Duration, cap: Duration },
    Custom(BackoffFn),
}

impl Backoff {
    pub fn linear(base: Duration) -> Self {
        Self::Linear { base }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential {
            base,
            cap: cap.max(base),
        }
    }

    pub fn custom<F>(delay: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(delay))
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Linear { base } => base.saturating_mul(attempt.min(u32::MAX as usize) as u32),
            Self::Exponential { base, cap } => {
                let exponent = (attempt - 1).min(31) as u32;
                base.saturating_mul(1_u32 << exponent).min(*cap)
            }
            Self::Custom(delay) => delay(attempt),
        }
    }

    fn cap(&self) -> Option<Duration> {
        match self {
            Self::Exponential { cap, .. } => Some(*cap),
            _ => None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear { base } => formatter.debug_struct("Linear").field("base", base).finish(),
            Self::Exponential { base, cap } => formatter
                .debug_struct("Exponential")
                .field("base", base)
                .field("cap", cap)
                .finish(),
            Self::Custom(_) => formatter.write_str("Custom"),
        }
    }
}

/// Retry settings for [`RetryPolicy::Detailed`].
#[derive(Clone, Debug)]
pub struct RetrySettings {
    max_retries: usize,
    retryable_status_codes: BTreeSet<u16>,
    backoff: Backoff,
    retry_on_timeout: bool,
    jitter_ratio: f64,
}

impl RetrySettings {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            retryable_status_codes: BTreeSet::new(),
            backoff: Backoff::default(),
            retry_on_timeout: true,
            jitter_ratio: 0.0,
        }
    }

    /// Statuses eligible for retry. An empty set means every non-2xx status.
    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }
}

/// Generic retry policy for transient failures.
///
/// Network failures are always eligible. Canceled calls, validation failures
/// and caller errors are never retried.
#[derive(Clone, Debug, Default)]
pub enum RetryPolicy {
    #[default]
    None,
    /// Retry any non-2xx or network failure up to `n` times with exponential
    /// back-off (1s base, 30s cap).
    Count(usize),
    Detailed(RetrySettings),
}

impl From<usize> for RetryPolicy {
    fn from(count: usize) -> Self {
        Self::Count(count)
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self::Detailed(settings)
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Count(count) => *count,
            Self::Detailed(settings) => settings.max_retries,
        }
    }

    /// Whether `error` may be retried after `retries_used` retries.
    pub(crate) fn should_retry(&self, error: &Error, retries_used: usize) -> bool {
        if retries_used >= self.max_retries() {
            return false;
        }
        match error.code() {
            ErrorCode::Network => true,
            ErrorCode::TimedOut => match self {
                Self::Detailed(settings) => settings.retry_on_timeout,
                _ => true,
            },
            ErrorCode::BadResponse => {
                let Some(status) = error.status() else {
                    return false;
                };
                match self {
                    Self::Detailed(settings) => {
                        settings.retryable_status_codes.is_empty()
                            || settings.retryable_status_codes.contains(&status.as_u16())
                    }
                    _ => true,
                }
            }
            ErrorCode::Canceled
            | ErrorCode::ValidationFailed
            | ErrorCode::ValidationUnknown
            | ErrorCode::Unknown => false,
        }
    }

    /// Delay before retry number `retry_index` (1-based).
    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Count(_) => Backoff::default().delay(retry_index),
            Self::Detailed(settings) => apply_jitter(
                settings.backoff.delay(retry_index),
                settings.jitter_ratio,
                settings.backoff.cap(),
            ),
        }
    }
}

fn apply_jitter(backoff: Duration, jitter_ratio: f64, cap: Option<Duration>) -> Duration {
    if jitter_ratio <= f64::EPSILON {
        return backoff;
    }
    let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    let jitter_span = ((backoff_ms as f64) * jitter_ratio).round().max(1.0) as u64;
    let low = backoff_ms.saturating_sub(jitter_span);
    let high = backoff_ms.saturating_add(jitter_span).max(low);
    let mut sampled_ms = rand::rng().random_range(low..=high);
    if let Some(cap) = cap {
        sampled_ms = sampled_ms.min(cap.as_millis().min(u64::MAX as u128) as u64);
    }
    Duration::from_millis(sampled_ms)
}
