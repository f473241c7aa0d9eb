//! Polling task executor
//!
//! A [`WaitTask`] runs a condition immediately and then on a fixed
//! interval until the condition reports success, returns an error, the
//! deadline passes, or the task is cancelled. Whatever the outcome, the
//! task's updater runs exactly once with `Ok(())` only on success.
//!
//! Cancellation is cooperative: a condition that blocks on sub-calls
//! should watch [`WaitTask::token`] itself.

mod registry;

pub use registry::WaitTasks;

use crate::{Error, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal callback of a wait task
pub type Updater = Box<dyn FnOnce(Result<()>) -> BoxFuture<'static, ()> + Send>;

/// Box an async closure as an [`Updater`]
pub fn updater<F, Fut>(f: F) -> Updater
where
    F: FnOnce(Result<()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |result| f(result).boxed())
}

/// Smallest interval a task will poll at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A single polling task
pub struct WaitTask {
    key: String,
    interval: Duration,
    token: CancellationToken,
    updater: Updater,
    registration: Option<registry::Registration>,
}

impl WaitTask {
    /// Create an unregistered task
    pub fn new(key: impl Into<String>, interval: Duration, updater: Updater) -> Self {
        Self {
            key: key.into(),
            interval: interval.max(MIN_INTERVAL),
            token: CancellationToken::new(),
            updater,
            registration: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token cancelled when the task is cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Poll until `cond` succeeds or `timeout` elapses
    pub fn with_timeout<F, Fut>(self, timeout: Duration, cond: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let deadline = Some((Instant::now() + timeout, timeout));
        self.spawn(deadline, future::pending().boxed(), cond)
    }

    /// Poll until `cond` succeeds or `parent` is cancelled
    pub fn with_context<F, Fut>(self, parent: CancellationToken, cond: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let stop = async move { parent.cancelled().await }.boxed();
        self.spawn(None, stop, cond)
    }

    /// Poll until `cond` succeeds or `stop` resolves
    pub fn until<S, F, Fut>(self, stop: S, cond: F) -> JoinHandle<()>
    where
        S: Future<Output = ()> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.spawn(None, stop.boxed(), cond)
    }

    fn spawn<F, Fut>(
        self,
        deadline: Option<(Instant, Duration)>,
        stop: BoxFuture<'static, ()>,
        cond: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let WaitTask {
            key,
            interval,
            token,
            updater,
            registration,
        } = self;

        tokio::spawn(async move {
            let result = poll(&key, interval, &token, deadline, stop, cond).await;
            match &result {
                Ok(()) => debug!(key = %key, "Wait task succeeded"),
                Err(Error::Fault(message)) => {
                    error!(key = %key, fault = %message, "Wait task condition panicked")
                }
                Err(e) => debug!(key = %key, error = %e, "Wait task failed"),
            }

            if AssertUnwindSafe(updater(result))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(key = %key, "Wait task updater panicked");
            }
            drop(registration);
        })
    }
}

async fn poll<F, Fut>(
    key: &str,
    interval: Duration,
    token: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
    mut stop: BoxFuture<'static, ()>,
    mut cond: F,
) -> Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool>> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let expiry = async move {
        match deadline {
            Some((at, _)) => tokio::time::sleep_until(at).await,
            None => future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(Error::Cancelled(format!("task {key} cancelled")));
            }
            _ = &mut stop => {
                return Err(Error::Cancelled(format!("task {key} stopped")));
            }
            _ = &mut expiry => {
                let after = deadline.map(|(_, d)| d).unwrap_or_default();
                return Err(Error::Timeout { after, what: key.to_string() });
            }
            _ = ticker.tick() => {
                if check(&mut cond).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// Run one condition call, turning a panic into [`Error::Fault`]
async fn check<F, Fut>(cond: &mut F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| cond())) {
        Ok(fut) => fut,
        Err(payload) => return Err(Error::Fault(panic_message(payload))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            warn!("Recovered panic inside wait task condition");
            Err(Error::Fault(panic_message(payload)))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
