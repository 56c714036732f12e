//! Step-bounded exponential backoff.
//!
//! A schedule makes at most `steps` attempts. Between attempts it sleeps `duration`,
//! stretched by up to `jitter * duration`, and multiplies `duration` by `factor`.
//! Delays saturate at [`MAX_DELAY`]. Every sleep is cancellable.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::crd::Backoff;
use crate::{Error, Result};

const DEFAULT_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_FACTOR: f64 = 1.0;
const DEFAULT_STEPS: u32 = 5;

/// Upper bound for a single sleep between attempts.
pub const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            factor: DEFAULT_FACTOR,
            jitter: 0.0,
            steps: DEFAULT_STEPS,
        }
    }
}

impl BackoffSchedule {
    pub fn new(duration: Duration, factor: f64, jitter: f64, steps: u32) -> Self {
        Self {
            duration,
            factor,
            jitter,
            steps,
        }
    }

    pub fn from_spec(spec: &Backoff) -> Result<Self> {
        let duration = match spec.duration.as_deref() {
            Some(d) => parse_duration(d)?,
            None => DEFAULT_DURATION,
        };
        let factor = spec.factor.unwrap_or(DEFAULT_FACTOR);
        if !factor.is_finite() || factor < 1.0 {
            return Err(Error::Validation(format!("backoff factor {} must be >= 1", factor)));
        }
        let jitter = spec.jitter.unwrap_or(0.0);
        if !jitter.is_finite() || jitter < 0.0 {
            return Err(Error::Validation(format!("backoff jitter {} must be >= 0", jitter)));
        }
        let steps = spec.steps.unwrap_or(DEFAULT_STEPS);
        if steps == 0 {
            return Err(Error::Validation("backoff steps must be at least 1".to_string()));
        }
        Ok(Self::new(duration, factor, jitter, steps))
    }

    /// Sleep durations between attempts, `steps - 1` of them, computed as they are
    /// consumed.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut current = self.duration.min(MAX_DELAY);
        (1..self.steps).map(move |_| {
            let mut delay = current;
            if self.jitter > 0.0 {
                let extra: f64 = rand::random_range(0.0..=self.jitter);
                delay = Duration::try_from_secs_f64(current.as_secs_f64() * extra)
                    .ok()
                    .and_then(|d| delay.checked_add(d))
                    .unwrap_or(MAX_DELAY)
                    .min(MAX_DELAY);
            }
            current = Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
                .ok()
                .unwrap_or(MAX_DELAY)
                .min(MAX_DELAY);
            delay
        })
    }
}

/// Parse "500ms", "1s", "1.5s", "2m", "1h", or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || Error::Validation(format!("invalid duration '{}'", value));

    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => value.split_at(i),
        None => (value, "s"),
    };
    let number: f64 = number.parse().map_err(|_| invalid())?;
    if number < 0.0 || !number.is_finite() {
        return Err(invalid());
    }
    let seconds = match unit {
        "ns" => number / 1e9,
        "us" | "µs" => number / 1e6,
        "ms" => number / 1e3,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Poll `condition` until it holds. Errors from the condition end polling at once;
/// running out of steps is [`Error::BackoffTimeout`].
pub async fn poll_until<F, Fut>(
    schedule: &BackoffSchedule,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut delays = schedule.delays();
    for attempt in 0..schedule.steps as usize {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if condition().await? {
            return Ok(());
        }
        if let Some(delay) = delays.next() {
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "condition not met, backing off");
            sleep_or_cancel(delay, cancel).await?;
        }
    }
    Err(Error::BackoffTimeout)
}

/// Run `operation` until it succeeds, retrying the errors `is_retryable` accepts.
/// The last error is returned once the steps are used up.
pub async fn retry<F, Fut, T>(
    schedule: &BackoffSchedule,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&Error) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = schedule.delays();
    let mut attempt = 0usize;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => e,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        let Some(delay) = delays.next() else {
            return Err(err);
        };
        attempt += 1;
        debug!(attempt, error = %err, "operation failed, retrying");
        sleep_or_cancel(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(steps: u32) -> BackoffSchedule {
        BackoffSchedule::new(Duration::from_millis(1), 2.0, 0.0, steps)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("1d").is_err());
    }

    #[test]
    fn test_delays_grow_by_factor() {
        let schedule = BackoffSchedule::new(Duration::from_millis(10), 2.0, 0.0, 4);
        assert_eq!(
            schedule.delays().collect::<Vec<_>>(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let schedule = BackoffSchedule::new(Duration::from_millis(100), 1.0, 0.5, 20);
        for delay in schedule.delays() {
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_long_schedules_saturate() {
        let spec = Backoff {
            duration: Some("1s".to_string()),
            factor: Some(2.0),
            jitter: Some(1.0),
            steps: Some(80),
        };
        let schedule = BackoffSchedule::from_spec(&spec).unwrap();
        let delays: Vec<Duration> = schedule.delays().collect();
        assert_eq!(delays.len(), 79);
        assert!(delays.iter().all(|d| *d <= MAX_DELAY));
        assert_eq!(delays.last(), Some(&MAX_DELAY));

        let huge = BackoffSchedule::new(Duration::from_secs(u64::MAX / 2), f64::MAX, 0.0, 4);
        assert!(huge.delays().all(|d| d == MAX_DELAY));
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert!(parse_duration("100000000000000000000000h").is_err());
    }

    #[test]
    fn test_from_spec_rejects_zero_steps() {
        let spec = Backoff {
            steps: Some(0),
            ..Default::default()
        };
        assert!(BackoffSchedule::from_spec(&spec).is_err());
    }

    #[tokio::test]
    async fn test_poll_until_times_out_after_steps() {
        let calls = AtomicU32::new(0);
        let result = poll_until(&fast(2), &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;
        assert!(matches!(result, Err(Error::BackoffTimeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let calls = AtomicU32::new(0);
        let result = poll_until(&fast(5), &CancellationToken::new(), || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let schedule = BackoffSchedule::new(Duration::from_secs(60), 1.0, 0.0, 10);
        let result = poll_until(&schedule, &cancel, || async { Ok(false) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            &fast(5),
            &CancellationToken::new(),
            |e| matches!(e, Error::Conflict(_)),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad".to_string()))
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(
            &fast(5),
            &CancellationToken::new(),
            |e| matches!(e, Error::Conflict(_)),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Conflict("stale".to_string()))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
