use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{CancelReason, MintlabError, MintlabResult};

/// Token-bucket budget shared by every worker that talks to the external
/// market-data API.
///
/// The client refills the bucket as time passes; workers only consume.
/// When the bucket is empty, [`ApiBudget::acquire`] parks the caller until
/// a token accrues instead of failing — back-pressure, not errors.
#[derive(Debug)]
pub struct ApiBudget {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl ApiBudget {
    /// `requests_per_second` sustained rate with a burst of `capacity`
    /// tokens.
    pub fn new(requests_per_second: f64, capacity: u32) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: requests_per_second.max(0.1),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available. Returns the wait until the next token
    /// otherwise.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("budget lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Parks until a token is available or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> MintlabResult<()> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    trace!(?wait, "api budget empty, parking");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => {
                            return Err(MintlabError::Cancelled {
                                reason: CancelReason::UserRequested,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Tokens currently in the bucket (diagnostics only).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("budget lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_drains_then_reports_wait() {
        let budget = ApiBudget::new(10.0, 2);
        assert!(budget.try_acquire().is_ok());
        assert!(budget.try_acquire().is_ok());
        let wait = budget.try_acquire().unwrap_err();
        // One token accrues in <= 100ms at 10 rps.
        assert!(wait <= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn acquire_parks_and_resumes() {
        let budget = ApiBudget::new(50.0, 1);
        let cancel = CancellationToken::new();

        budget.acquire(&cancel).await.unwrap();
        // Bucket empty now; this must park briefly, then succeed.
        let start = Instant::now();
        budget.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts_parked_acquire() {
        let budget = ApiBudget::new(0.1, 1);
        let cancel = CancellationToken::new();
        budget.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let err = budget.acquire(&cancel).await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }
}
