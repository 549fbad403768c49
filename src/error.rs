use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Error taxonomy for the trading core. Variants map one-to-one onto the
/// handling policies: validation and risk rejections are surfaced and never
/// retried, transient venue errors are retried with backoff, fatal venue
/// errors stop order placement, integrity errors are logged and event-emitted,
/// internal errors abort the current task.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("risk rejected: {0}")]
    RiskRejected(String),

    #[error("venue transient: {0}")]
    VenueTransient(String),

    #[error("venue fatal: {0}")]
    VenueFatal(String),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl TradingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::VenueTransient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradingError::Validation(_) => "validation",
            TradingError::RiskRejected(_) => "risk_rejected",
            TradingError::VenueTransient(_) => "venue_transient",
            TradingError::VenueFatal(_) => "venue_fatal",
            TradingError::Integrity(_) => "integrity",
            TradingError::Internal(_) => "internal",
        }
    }
}

pub type TradingResult<T> = Result<T, TradingError>;

/// Required-number guard applied at every external boundary.
pub fn finite_or_err(value: f64, name: &str) -> TradingResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TradingError::Validation(format!(
            "{} is not finite: {}",
            name, value
        )))
    }
}

/// Optional-number guard: non-finite values fall back to the default.
pub fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Retry policy for venue calls: exponential backoff `base × 2^(attempt−1)`,
/// capped per attempt. Exhausting the budget escalates the last transient
/// error to `VenueFatal`; non-transient errors pass through immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

pub async fn with_retry<T, F, Fut>(
    op_name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> TradingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TradingResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    op_name, attempt, policy.max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(TradingError::VenueTransient(msg)) => {
                return Err(TradingError::VenueFatal(format!(
                    "{}: retry budget exhausted after {} attempts: {}",
                    op_name, policy.max_attempts, msg
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
