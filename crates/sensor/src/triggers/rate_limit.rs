//! Per-trigger execution rate limits.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cancellable;
use crate::crd::{RateLimit, RateLimitUnit};
use crate::{Error, Result};

/// One limiter per trigger name, rebuilt when the trigger's limit changes.
#[derive(Default)]
pub struct RateLimits {
    limiters: Mutex<HashMap<String, (RateLimit, Arc<DefaultDirectRateLimiter>)>>,
}

fn quota(limit: &RateLimit) -> Result<Quota> {
    let requests = NonZeroU32::new(limit.requests_per_unit).ok_or_else(|| {
        Error::Validation("rate limit needs at least one request per unit".to_string())
    })?;
    Ok(match limit.unit {
        RateLimitUnit::Second => Quota::per_second(requests),
        RateLimitUnit::Minute => Quota::per_minute(requests),
        RateLimitUnit::Hour => Quota::per_hour(requests),
    })
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    async fn limiter(
        &self,
        trigger: &str,
        limit: &RateLimit,
    ) -> Result<Arc<DefaultDirectRateLimiter>> {
        let mut limiters = self.limiters.lock().await;
        if let Some((current, limiter)) = limiters.get(trigger) {
            if current == limit {
                return Ok(limiter.clone());
            }
        }
        let limiter = Arc::new(RateLimiter::direct(quota(limit)?));
        limiters.insert(trigger.to_string(), (limit.clone(), limiter.clone()));
        Ok(limiter)
    }

    /// Wait until `trigger` may execute again, or fail with [`Error::Cancelled`].
    pub async fn acquire(
        &self,
        trigger: &str,
        limit: &RateLimit,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let limiter = self.limiter(trigger, limit).await?;
        if limiter.check().is_ok() {
            return Ok(());
        }
        debug!(
            trigger = %trigger,
            unit = ?limit.unit,
            requests = limit.requests_per_unit,
            "trigger rate limited, waiting"
        );
        cancellable(cancel, async {
            limiter.until_ready().await;
            Ok(())
        })
        .await
    }
}
