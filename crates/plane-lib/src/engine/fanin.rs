//! Fan-out/fan-in with an expected-count barrier

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A set of spawned sub-operations whose results are collected together
///
/// Dropping a `FanIn` aborts whatever is still running. With a grace
/// period, sub-operations still running when collection stops get that
/// long to finish before they are aborted.
pub struct FanIn<T> {
    set: JoinSet<T>,
    expected: usize,
    grace: Duration,
}

impl<T: Send + 'static> Default for FanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> FanIn<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            expected: 0,
            grace: Duration::ZERO,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.set.spawn(fut);
        self.expected += 1;
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Wait for exactly `expected` results, the deadline, or cancellation
    ///
    /// Results arrive in completion order. A panicking sub-operation ends
    /// the collection with [`Error::Fault`].
    pub async fn collect(
        mut self,
        what: &str,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Vec<T>> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(self.expected);

        let outcome = loop {
            if results.len() >= self.expected {
                break Ok(());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    break Err(Error::Cancelled(format!("{what} cancelled")));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(Error::Timeout {
                        after: deadline.saturating_duration_since(started),
                        what: format!("{what}: {} of {} reported", results.len(), self.expected),
                    });
                }
                joined = self.set.join_next() => match joined {
                    Some(Ok(value)) => results.push(value),
                    Some(Err(e)) => break Err(Error::Fault(format!("{what}: {e}"))),
                    None => break Ok(()),
                },
            }
        };

        match outcome {
            Ok(()) => Ok(results),
            Err(e) => {
                self.wind_down(what).await;
                Err(e)
            }
        }
    }

    async fn wind_down(&mut self, what: &str) {
        if self.grace.is_zero() || self.set.is_empty() {
            return;
        }
        let set = &mut self.set;
        let drained = tokio::time::timeout(self.grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(what = %what, remaining = self.set.len(), "Aborting sub-operations after grace period");
        }
    }
}
