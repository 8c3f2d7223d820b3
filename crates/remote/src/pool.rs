//! Bounded-concurrency fan-out of rate-limited fetches.

use crate::error::Result;
use crate::limiter::RateLimiter;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Callback fired when a task is admitted and about to make its first call.
pub type OnStart = Arc<dyn Fn(&str) + Send + Sync>;

/// The outcome of fetching one key.
#[derive(Debug)]
pub struct Fetched<K, T> {
    pub key: K,
    pub result: Result<T>,
}

/// Runs many fetches at once, never more than `concurrency` in flight, each
/// one gated by the shared [`RateLimiter`].
#[derive(Clone)]
pub struct FetchPool {
    limiter: Arc<RateLimiter>,
    concurrency: usize,
    on_start: Option<OnStart>,
}

impl FetchPool {
    pub const MIN_CONCURRENCY: usize = 1;
    pub const MAX_CONCURRENCY: usize = 20;
    pub const DEFAULT_CONCURRENCY: usize = 5;

    /// `concurrency` is clamped to `1..=20`.
    pub fn new(limiter: Arc<RateLimiter>, concurrency: usize) -> Self {
        Self {
            limiter,
            concurrency: concurrency.clamp(Self::MIN_CONCURRENCY, Self::MAX_CONCURRENCY),
            on_start: None,
        }
    }

    pub fn with_on_start(mut self, on_start: OnStart) -> Self {
        self.on_start = Some(on_start);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn a worker per key, at most `concurrency` at a time, and return
    /// the channel their results arrive on, in completion order.
    ///
    /// Workers run whether or not the receiver is being polled; a full
    /// channel holds them (and their concurrency slot) until the consumer
    /// catches up. A failure for one key is delivered as that key's `Err`
    /// result and never stops the batch. Once `cancel` fires no further keys
    /// are admitted; workers still waiting on the limiter finish without
    /// sending anything, so a key missing from the output was never
    /// attempted. The channel closes once every spawned worker has finished.
    ///
    /// Must be called from within a tokio runtime.
    pub fn fetch<K, T, F, Fut>(&self, keys: Vec<K>, cancel: &CancellationToken, fetch: F) -> FetchResults<K, T>
    where
        K: AsRef<str> + Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.concurrency);
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let fetch = Arc::new(fetch);
        let pool = self.clone();
        let cancel = cancel.clone();

        let dispatcher = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for key in keys {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let (pool, fetch, tx, cancel) = (pool.clone(), Arc::clone(&fetch), tx.clone(), cancel.clone());
                workers.spawn(async move {
                    let _permit = permit;
                    let mut started = false;
                    let result = pool
                        .limiter
                        .execute(&cancel, || {
                            if !started {
                                started = true;
                                if let Some(on_start) = &pool.on_start {
                                    on_start(key.as_ref());
                                }
                            }
                            fetch(key.clone())
                        })
                        .await;
                    if !started {
                        tracing::trace!(key = key.as_ref(), "Fetch cancelled before admission");
                        return;
                    }
                    if tx.send(Fetched { key, result }).await.is_err() {
                        tracing::trace!("Results dropped before delivery");
                    }
                });
            }
            drop(tx);
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined
                    && err.is_panic()
                {
                    tracing::error!("Fetch worker panicked");
                }
            }
        });

        FetchResults { rx, dispatcher }
    }
}

/// Receiving end of [`FetchPool::fetch`]. Dropping it aborts any work still
/// outstanding.
pub struct FetchResults<K, T> {
    rx: mpsc::Receiver<Fetched<K, T>>,
    dispatcher: JoinHandle<()>,
}

impl<K, T> FetchResults<K, T> {
    /// Next result, or `None` once every worker has finished.
    pub async fn recv(&mut self) -> Option<Fetched<K, T>> {
        self.rx.recv().await
    }
}

impl<K, T> Stream for FetchResults<K, T> {
    type Item = Fetched<K, T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<K, T> Drop for FetchResults<K, T> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::limiter::RateLimiterConfig;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_second: 1000.0,
            burst: 100,
        }))
    }

    #[test]
    fn test_concurrency_clamped() {
        assert_eq!(FetchPool::new(fast_limiter(), 0).concurrency(), 1);
        assert_eq!(FetchPool::new(fast_limiter(), 50).concurrency(), 20);
        assert_eq!(FetchPool::new(fast_limiter(), 7).concurrency(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let pool = FetchPool::new(fast_limiter(), 3);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let keys: Vec<String> = (0..10).map(|i| format!("key-{i}")).collect();

        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
        let results: Vec<_> = pool
            .fetch(keys, &cancel, move |key| {
                let (current, peak) = (Arc::clone(&c), Arc::clone(&p));
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(key.len())
                }
            })
            .collect()
            .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|f| f.result.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_progress_without_consumer() {
        let pool = FetchPool::new(fast_limiter(), 4);
        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let mut results = pool.fetch(vec!["a", "b", "c"], &cancel, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        let mut received = 0;
        while results.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_result_arrives_before_batch_finishes() {
        let pool = FetchPool::new(fast_limiter(), 2);
        let cancel = CancellationToken::new();
        let mut results = pool.fetch(vec!["quick", "slow"], &cancel, |key| async move {
            let delay = if key == "quick" { 10 } else { 1_000 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(key)
        });
        let start = tokio::time::Instant::now();
        let first = results.recv().await.unwrap();
        assert_eq!(first.key, "quick");
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(results.recv().await.unwrap().key, "slow");
        assert!(results.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_isolated_to_key() {
        let pool = FetchPool::new(fast_limiter(), 2);
        let cancel = CancellationToken::new();
        let keys = vec!["a", "bad", "c", "d"];
        let results: Vec<_> = pool
            .fetch(keys, &cancel, |key| async move {
                if key == "bad" {
                    exn::bail!(ErrorKind::NotFound(key.to_string()));
                }
                Ok(key.to_uppercase())
            })
            .collect()
            .await;

        assert_eq!(results.len(), 4);
        let failed: Vec<_> = results.iter().filter(|f| f.result.is_err()).map(|f| f.key).collect();
        assert_eq!(failed, vec!["bad"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_yields_nothing() {
        let pool = FetchPool::new(fast_limiter(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let start = tokio::time::Instant::now();
        let results: Vec<_> = pool
            .fetch(vec!["a", "b", "c"], &cancel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .collect()
            .await;
        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_admission() {
        let pool = FetchPool::new(fast_limiter(), 1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let results: Vec<_> = pool
            .fetch(vec!["a", "b", "c", "d"], &cancel, move |key| {
                if key == "b" {
                    trigger.cancel();
                }
                async { Ok(()) }
            })
            .collect()
            .await;
        let keys: Vec<_> = results.iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_start_fires_once_per_key_despite_throttle() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let pool = FetchPool::new(fast_limiter(), 2).with_on_start(Arc::new(move |_key: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let tries = Arc::clone(&attempts);
        let results: Vec<_> = pool
            .fetch(vec!["only"], &cancel, move |_| {
                let attempt = tries.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        exn::bail!(ErrorKind::Throttled {
                            retry_after: Duration::from_millis(200)
                        });
                    }
                    Ok(attempt)
                }
            })
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(*results[0].result.as_ref().unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
