//! Token bucket throttling delete throughput across all workers of a processor.
//!
//! Tokens are taken from the bucket when [`DeleteRateLimiter::acquire`]
//! returns. The returned [`DeleteTokens`] must be consumed once the gated
//! delete commits; tokens of a failed delete are abandoned, never refunded,
//! so failing batches still spend rate budget.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::TtlError;

/// Highest rate the bucket refills at: one token per nanosecond.
pub const MAX_RATE: u32 = 1_000_000_000;

/// Shared delete rate limiter, capacity and refill both equal to the rate.
pub struct DeleteRateLimiter {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
    acquired: AtomicU64,
    consumed: AtomicU64,
    abandoned: AtomicU64,
}

impl DeleteRateLimiter {
    /// Create a limiter admitting `rows_per_second` rows.
    ///
    /// Rates above [`MAX_RATE`] are clamped to it, which is effectively
    /// unlimited for delete batches.
    pub fn new(rows_per_second: u64) -> Self {
        let rate = rows_per_second.clamp(1, u64::from(MAX_RATE));
        let burst = NonZeroU32::new(rate as u32).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(burst).allow_burst(burst)),
            burst,
            acquired: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Wait until `n` tokens are available, or until `cancel` fires.
    ///
    /// Requests larger than the bucket are admitted in bucket-sized chunks.
    pub async fn acquire(
        &self,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<DeleteTokens<'_>, TtlError> {
        let mut remaining = n;
        while remaining > 0 {
            let chunk = u32::try_from(remaining)
                .unwrap_or(u32::MAX)
                .min(self.burst.get());
            let Some(chunk_nz) = NonZeroU32::new(chunk) else {
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Tokens taken by earlier chunks are spent.
                    self.abandoned.fetch_add(n - remaining, Ordering::Relaxed);
                    self.acquired.fetch_add(n - remaining, Ordering::Relaxed);
                    return Err(TtlError::Cancelled);
                }
                ready = self.limiter.until_n_ready(chunk_nz) => {
                    if ready.is_err() {
                        // Unreachable: chunks never exceed the burst size.
                        return Err(TtlError::InvalidSpec(format!(
                            "delete batch of {chunk} rows exceeds rate limiter capacity {}",
                            self.burst
                        )));
                    }
                }
            }
            remaining -= u64::from(chunk);
        }
        self.acquired.fetch_add(n, Ordering::Relaxed);
        Ok(DeleteTokens {
            limiter: self,
            count: n,
            consumed: false,
        })
    }

    /// Tokens handed out by successful acquisitions.
    pub fn tokens_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Tokens whose gated work committed.
    pub fn tokens_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Tokens whose gated work failed or was cancelled.
    pub fn tokens_abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for DeleteRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteRateLimiter")
            .field("burst", &self.burst)
            .field("acquired", &self.tokens_acquired())
            .field("consumed", &self.tokens_consumed())
            .field("abandoned", &self.tokens_abandoned())
            .finish()
    }
}

/// Tokens held for one delete batch.
#[derive(Debug)]
#[must_use = "tokens must be consumed after the gated delete commits"]
pub struct DeleteTokens<'a> {
    limiter: &'a DeleteRateLimiter,
    count: u64,
    consumed: bool,
}

impl DeleteTokens<'_> {
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mark the gated work as committed.
    pub fn consume(mut self) {
        self.consumed = true;
        self.limiter
            .consumed
            .fetch_add(self.count, Ordering::Relaxed);
    }
}

impl Drop for DeleteTokens<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            self.limiter
                .abandoned
                .fetch_add(self.count, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_consumed_and_abandoned_tokens_are_tracked() {
        let limiter = DeleteRateLimiter::new(u64::MAX);
        let cancel = CancellationToken::new();

        let tokens = limiter.acquire(40, &cancel).await.unwrap();
        assert_eq!(tokens.count(), 40);
        tokens.consume();

        let tokens = limiter.acquire(15, &cancel).await.unwrap();
        drop(tokens);

        assert_eq!(limiter.tokens_acquired(), 55);
        assert_eq!(limiter.tokens_consumed(), 40);
        assert_eq!(limiter.tokens_abandoned(), 15);
    }

    #[tokio::test]
    async fn test_requests_beyond_burst_are_chunked() {
        let limiter = DeleteRateLimiter::new(1_000);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let tokens = limiter.acquire(1_500, &cancel).await.unwrap();
        tokens.consume();

        // The first 1000 are available immediately, the remaining 500 refill in ~0.5s.
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(limiter.tokens_consumed(), 1_500);
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let limiter = DeleteRateLimiter::new(1);
        let cancel = CancellationToken::new();

        limiter.acquire(1, &cancel).await.unwrap().consume();

        let waiter = {
            let cancel = cancel.clone();
            async move { limiter.acquire(1, &cancel).await.map(|t| t.count()) }
        };
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancelled acquire must not block");
        assert!(matches!(result, Err(TtlError::Cancelled)));
    }

    #[tokio::test]
    async fn test_zero_token_acquire_is_immediate() {
        let limiter = DeleteRateLimiter::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tokens = limiter.acquire(0, &cancel).await.unwrap();
        assert_eq!(tokens.count(), 0);
        tokens.consume();
    }
}
