//! Token-bucket admission gate shared by every remote call.
//!
//! One [`RateLimiter`] is shared (behind an [`Arc`](std::sync::Arc)) by all
//! tasks talking to the same API. The internal mutex is only held while
//! doing bookkeeping; every wait happens with the lock released.

use crate::error::{ErrorKind, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Throttles closer together than this count as consecutive.
const THROTTLE_WINDOW: Duration = Duration::from_secs(30);
/// Upper bound on any single retry-after floor.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Quiet period after the last throttle before backoff is forgotten.
const RECOVERY_PERIOD: Duration = Duration::from_secs(10);
/// Highest power of two applied to a throttle delay (8x).
const MAX_BACKOFF_SHIFT: u32 = 3;
/// Floor on refill waits so rounding never produces a zero-length sleep loop.
const MIN_WAIT: Duration = Duration::from_millis(1);
const EPSILON: f64 = 1e-9;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Steady-state rate and burst allowance.
///
/// The defaults (3 requests/second, burst of 10) let a handful of parallel
/// workers start immediately without tripping the upstream limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 3.0,
            burst: 10,
        }
    }
}

impl RateLimiterConfig {
    /// Replace nonsensical values: a non-positive or non-finite rate falls back
    /// to the default rate, and the burst is at least one.
    fn sanitized(self) -> Self {
        let default = Self::default();
        Self {
            requests_per_second: if self.requests_per_second.is_finite() && self.requests_per_second > 0.0 {
                self.requests_per_second
            } else {
                default.requests_per_second
            },
            burst: self.burst.max(1),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    retry_after: Option<Instant>,
    consecutive_throttles: u32,
    last_throttle: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant, config: &RateLimiterConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second).min(f64::from(config.burst));
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimiterConfig) -> Self {
        let config = config.sanitized();
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
                retry_after: None,
                consecutive_throttles: 0,
                last_throttle: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Tokens currently in the bucket, as of the last refill.
    pub fn available_tokens(&self) -> f64 {
        self.bucket.lock().tokens
    }

    /// Wait until a token is available and any retry-after floor has passed,
    /// then consume exactly one token.
    ///
    /// Returns [`ErrorKind::Cancelled`] promptly if `cancel` fires while
    /// waiting (or had already fired).
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                match bucket.retry_after {
                    Some(floor) if now < floor => floor - now,
                    _ => {
                        bucket.refill(now, &self.config);
                        if bucket.tokens + EPSILON >= 1.0 {
                            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                            return Ok(());
                        }
                        let deficit = (1.0 - bucket.tokens) / self.config.requests_per_second;
                        Duration::from_secs_f64(deficit).max(MIN_WAIT)
                    },
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                _ = sleep(wait) => {},
            }
        }
    }

    /// Record an upstream throttle and raise the retry-after floor.
    ///
    /// Consecutive throttles (within 30 seconds of each other) double the
    /// delay each time, up to 8x, and the result never exceeds 30 seconds.
    /// The bucket is emptied so no burst follows the floor. Returns the
    /// delay that was actually applied.
    pub fn report_throttled(&self, suggested: Duration) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        bucket.consecutive_throttles = match bucket.last_throttle {
            Some(last) if now.saturating_duration_since(last) < THROTTLE_WINDOW => {
                bucket.consecutive_throttles.saturating_add(1)
            },
            _ => 1,
        };
        bucket.last_throttle = Some(now);

        let shift = bucket.consecutive_throttles.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let adjusted = suggested.saturating_mul(1 << shift).min(MAX_BACKOFF);
        let floor = now + adjusted;
        bucket.retry_after = Some(bucket.retry_after.map_or(floor, |existing| existing.max(floor)));
        bucket.tokens = 0.0;
        // Tokens only start accruing again once the floor has passed.
        bucket.last_refill = bucket.last_refill.max(floor);

        tracing::warn!(
            consecutive = bucket.consecutive_throttles,
            delay_ms = u64::try_from(adjusted.as_millis()).unwrap_or(u64::MAX),
            "Upstream throttled request; backing off"
        );
        adjusted
    }

    /// Forget the backoff history once throttling has stopped for more than
    /// ten seconds.
    pub fn report_success(&self) {
        let mut bucket = self.bucket.lock();
        if let Some(last) = bucket.last_throttle
            && Instant::now().saturating_duration_since(last) > RECOVERY_PERIOD
            && bucket.consecutive_throttles > 0
        {
            tracing::debug!("Throttling subsided; backoff reset");
            bucket.consecutive_throttles = 0;
        }
    }

    /// Run `op` behind the limiter: acquire a token, call it, and on a
    /// [`Throttled`](ErrorKind::Throttled) response report the throttle and
    /// try again. Any other error is returned as is.
    ///
    /// Retries continue until the call succeeds, fails with a different error,
    /// or `cancel` fires.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            self.acquire(cancel).await?;
            let err = match op().await {
                Ok(value) => {
                    self.report_success();
                    return Ok(value);
                },
                Err(err) => err,
            };
            if let ErrorKind::Throttled { retry_after } = &*err {
                let retry_after = *retry_after;
                self.report_throttled(retry_after);
                continue;
            }
            return Err(err);
        }
    }
}

/// Parse a `Retry-After` header value: either delta-seconds or an HTTP date.
///
/// Missing or unparseable values fall back to one second; dates in the past
/// mean "no wait".
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return DEFAULT_RETRY_AFTER;
    };
    if let Ok(seconds) = value.parse::<u64>() {
        return Duration::from_secs(seconds);
    }
    let http_date = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    match time::PrimitiveDateTime::parse(value, http_date) {
        Ok(at) => {
            let delta = at.assume_utc() - OffsetDateTime::now_utc();
            Duration::try_from(delta).unwrap_or(Duration::ZERO)
        },
        Err(_) => DEFAULT_RETRY_AFTER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::time::advance;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            requests_per_second: rate,
            burst,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_admission() {
        let limiter = limiter(2.0, 3);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire(&cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
        assert!(waited < Duration::from_millis(510), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stay_within_bounds() {
        let limiter = limiter(5.0, 4);
        let cancel = CancellationToken::new();
        for step in 0..20 {
            limiter.acquire(&cancel).await.unwrap();
            let tokens = limiter.available_tokens();
            assert!((0.0..=4.0).contains(&tokens), "tokens {tokens} out of bounds");
            if step % 5 == 0 {
                advance(Duration::from_secs(10)).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_backoff() {
        let limiter = limiter(3.0, 10);
        let base = Duration::from_secs(1);
        assert_eq!(limiter.report_throttled(base), base);
        advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.report_throttled(base), base * 2);
        advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.report_throttled(base), base * 4);
        advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.report_throttled(base), base * 8);
        advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.report_throttled(base), base * 8);
    }

    #[rstest]
    #[case(Duration::from_secs(10), [10, 20, 30, 30])]
    #[case(Duration::from_secs(5), [5, 10, 20, 30])]
    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped(#[case] base: Duration, #[case] expected: [u64; 4]) {
        let limiter = limiter(3.0, 10);
        for secs in expected {
            assert_eq!(limiter.report_throttled(base), Duration::from_secs(secs));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_window() {
        let limiter = limiter(3.0, 10);
        let base = Duration::from_secs(2);
        limiter.report_throttled(base);
        limiter.report_throttled(base);
        advance(Duration::from_secs(31)).await;
        assert_eq!(limiter.report_throttled(base), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_backoff_after_quiet_period() {
        let limiter = limiter(3.0, 10);
        let base = Duration::from_secs(1);
        limiter.report_throttled(base);
        limiter.report_throttled(base);
        advance(Duration::from_secs(5)).await;
        limiter.report_success();
        // Too soon: the history is kept.
        assert_eq!(limiter.report_throttled(base), base * 4);
        advance(Duration::from_secs(11)).await;
        limiter.report_success();
        assert_eq!(limiter.report_throttled(base), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_floor_without_burst() {
        let limiter = limiter(2.0, 10);
        let cancel = CancellationToken::new();
        limiter.report_throttled(Duration::from_secs(2));
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        // Floor, then one token's worth of refill.
        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert!(limiter.available_tokens() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled_before_start() {
        let limiter = limiter(1.0, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Cancelled);
        // No token was consumed.
        assert!(limiter.available_tokens() >= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled_while_waiting() {
        let limiter = limiter(1.0, 1);
        let cancel = CancellationToken::new();
        limiter.report_throttled(Duration::from_secs(20));
        let start = Instant::now();
        let (result, ()) = tokio::join!(limiter.acquire(&cancel), async {
            sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        assert_eq!(*result.unwrap_err(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_throttled() {
        let limiter = limiter(10.0, 10);
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let start = Instant::now();
        let value = limiter
            .execute(&cancel, || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        exn::bail!(ErrorKind::Throttled {
                            retry_after: Duration::from_secs(1)
                        });
                    }
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        // 1s floor, then 2s floor (second consecutive throttle).
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_passes_through_other_errors() {
        let limiter = limiter(10.0, 10);
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let err = limiter
            .execute(&cancel, || {
                calls += 1;
                async { Err::<(), _>(exn::Exn::from(ErrorKind::NotFound("abc".to_string()))) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_not_found());
    }

    #[rstest]
    #[case(None, Duration::from_secs(1))]
    #[case(Some(""), Duration::from_secs(1))]
    #[case(Some("7"), Duration::from_secs(7))]
    #[case(Some(" 12 "), Duration::from_secs(12))]
    #[case(Some("soon"), Duration::from_secs(1))]
    #[case(Some("Wed, 21 Oct 2015 07:28:00 GMT"), Duration::ZERO)]
    fn test_parse_retry_after(#[case] value: Option<&str>, #[case] expected: Duration) {
        assert_eq!(parse_retry_after(value), expected);
    }

    #[test]
    fn test_parse_retry_after_future_date() {
        let at = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let header = at
            .format(format_description!(
                "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
            ))
            .unwrap();
        let parsed = parse_retry_after(Some(&header));
        assert!(parsed > Duration::from_secs(200) && parsed <= Duration::from_secs(300));
    }

    #[test]
    fn test_config_sanitized() {
        let limiter = limiter(-1.0, 0);
        assert_eq!(limiter.config().requests_per_second, 3.0);
        assert_eq!(limiter.config().burst, 1);
    }
}
