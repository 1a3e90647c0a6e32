//! The managed transaction loop: retry a transaction function with
//! exponential backoff and jitter until it succeeds, fails permanently, or
//! runs out of the configured retry time.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use super::transaction::ManagedTransaction;
use super::Session;
use crate::config::AccessMode;
use crate::error::{Error, Result};
use crate::protocol::MakeConnection;

/// The stream of jittered backoff delays, in seconds.
///
/// Each delay is drawn uniformly from `[d·(1−j), d·(1+j)]` where `d` grows by
/// the multiplier per attempt and `j` is the jitter factor.
pub(crate) struct RetryDelays {
    delay: f64,
    multiplier: f64,
    jitter_factor: f64,
}

impl RetryDelays {
    pub(crate) fn new(initial_delay: f64, multiplier: f64, jitter_factor: f64) -> Self {
        RetryDelays {
            delay: initial_delay,
            multiplier,
            jitter_factor,
        }
    }

    pub(crate) fn next_delay(&mut self) -> f64 {
        let jitter = self.jitter_factor * self.delay;
        let delay = self.delay - jitter + 2.0 * jitter * rand::random::<f64>();
        self.delay *= self.multiplier;
        delay
    }
}

impl Iterator for RetryDelays {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        Some(self.next_delay())
    }
}

impl<M: MakeConnection> Session<M> {
    /// Execute a unit of work in a managed read transaction, retrying
    /// transient failures.
    ///
    /// The function may be invoked more than once and must be safe to rerun.
    /// On each attempt it receives a fresh [`ManagedTransaction`]; a normal
    /// return commits, an error rolls back.
    pub async fn execute_read<T, F>(&mut self, work: F) -> Result<T>
    where
        F: for<'tx> FnMut(ManagedTransaction<'tx, M>) -> BoxFuture<'tx, Result<T>>,
    {
        self.run_transaction(AccessMode::Read, work).await
    }

    /// Execute a unit of work in a managed write transaction, retrying
    /// transient failures.
    pub async fn execute_write<T, F>(&mut self, work: F) -> Result<T>
    where
        F: for<'tx> FnMut(ManagedTransaction<'tx, M>) -> BoxFuture<'tx, Result<T>>,
    {
        self.run_transaction(AccessMode::Write, work).await
    }

    async fn run_transaction<T, F>(&mut self, access_mode: AccessMode, mut work: F) -> Result<T>
    where
        F: for<'tx> FnMut(ManagedTransaction<'tx, M>) -> BoxFuture<'tx, Result<T>>,
    {
        self.ensure_open()?;
        let config = self.config();
        let mut delays = RetryDelays::new(
            config.initial_retry_delay,
            config.retry_delay_multiplier,
            config.retry_delay_jitter_factor,
        );
        let max_retry_time = config.max_transaction_retry_time;

        let mut errors: Vec<Error> = Vec::new();
        let mut started: Option<Instant> = None;
        loop {
            let outcome = self.attempt(access_mode, &mut work).await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.disconnect().await;
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    errors.push(e);
                }
            }
            // The clock starts after the first attempt; the first retry is
            // only delayed by its jittered backoff.
            let t0 = *started.get_or_insert_with(Instant::now);
            if t0.elapsed() > max_retry_time {
                break;
            }
            let delay = delays.next_delay();
            if let Some(e) = errors.last() {
                tracing::warn!(
                    "[BOLT] transaction failed and will be retried in {:.3}s ({})",
                    delay,
                    e
                );
            }
            tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
        }
        match errors.pop() {
            Some(e) => Err(e),
            None => Err(Error::service_unavailable("Transaction failed")),
        }
    }

    async fn attempt<T, F>(&mut self, access_mode: AccessMode, work: &mut F) -> Result<T>
    where
        F: for<'tx> FnMut(ManagedTransaction<'tx, M>) -> BoxFuture<'tx, Result<T>>,
    {
        self.open_transaction(access_mode, None, None).await?;
        let result = work(ManagedTransaction::new(self)).await;
        match result {
            Ok(value) => {
                self.tx_commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.tx_close().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_the_multiplier_within_jitter_bounds() {
        let mut delays = RetryDelays::new(1.0, 2.0, 0.2);
        let mut expected = 1.0;
        for _ in 0..6 {
            let delay = delays.next_delay();
            assert!(delay >= expected * 0.8 - 1e-9, "{delay} vs {expected}");
            assert!(delay <= expected * 1.2 + 1e-9, "{delay} vs {expected}");
            expected *= 2.0;
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let mut delays = RetryDelays::new(0.5, 3.0, 0.0);
        assert_eq!(delays.next_delay(), 0.5);
        assert_eq!(delays.next_delay(), 1.5);
        assert_eq!(delays.next_delay(), 4.5);
    }

    #[test]
    fn delay_stream_is_endless() {
        let delays = RetryDelays::new(0.01, 2.0, 0.2);
        assert_eq!(delays.take(32).count(), 32);
    }
}
