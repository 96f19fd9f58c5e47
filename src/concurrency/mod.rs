//! Go Dispatcher Concurrency Limiting Module
//!
//! Per-key admission control: at most `limit` operations per key run at
//! once, excess callers queue and are admitted first-come-first-served.
//! A negative limit admits everything; a limit of zero admits nothing.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyLimiterError {
    #[error("Limiter for {key:?} stopped more times than it started")]
    StopWithoutStart { key: String },
}

type Limiters = Arc<DashMap<String, ConcurrencyLimiter>>;

enum AdmissionState {
    Admitted,
    Waiting(oneshot::Receiver<()>),
    Never,
}

/// Hands a slot back to a managed limiter when an admission is dropped
/// before the caller saw it.
struct Abandon {
    limiters: Limiters,
    key: String,
}

impl Abandon {
    fn release(self, granted: bool) {
        if let Some(mut limiter) = self.limiters.get_mut(&self.key) {
            if granted {
                debug!(key = %self.key, "Releasing slot of abandoned admission");
                if let Err(e) = limiter.stop() {
                    error!(key = %self.key, error = %e, "Failed to release abandoned slot");
                }
            } else {
                limiter.prune_abandoned();
            }
        }
        self.limiters.remove_if(&self.key, |_, limiter| limiter.is_empty());
    }
}

/// Resolves once the caller has been admitted.
#[must_use = "admission does nothing unless awaited"]
pub struct Admission {
    state: AdmissionState,
    abandon: Option<Abandon>,
}

impl Admission {
    fn new(state: AdmissionState) -> Self {
        Self {
            state,
            abandon: None,
        }
    }
}

impl Future for Admission {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.state {
            AdmissionState::Admitted => Poll::Ready(()),
            AdmissionState::Never => Poll::Pending,
            AdmissionState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.state = AdmissionState::Admitted;
                    Poll::Ready(())
                }
                // The limiter is only dropped once it has no waiters, so a
                // closed channel means this request will never be admitted.
                Poll::Ready(Err(_)) => {
                    self.state = AdmissionState::Never;
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let AdmissionState::Waiting(mut rx) =
            std::mem::replace(&mut self.state, AdmissionState::Never)
        else {
            return;
        };
        let granted = rx.try_recv().is_ok();
        drop(rx);
        if let Some(abandon) = self.abandon.take() {
            abandon.release(granted);
        }
    }
}

/// Admission state for one key.
///
/// A bare limiter leaves `stop` to its caller, including for admissions
/// that were granted but dropped unpolled. [`ConcurrencyLimitManager`]
/// releases those itself.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    limit: i64,
    concurrents: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl ConcurrencyLimiter {
    pub fn new(name: impl Into<String>, limit: i64) -> Self {
        Self {
            name: name.into(),
            limit,
            concurrents: 0,
            waiters: VecDeque::new(),
        }
    }

    pub fn concurrents(&self) -> usize {
        self.concurrents
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn start(&mut self) -> Admission {
        if self.limit < 0 {
            return Admission::new(AdmissionState::Admitted);
        }
        if self.limit == 0 {
            return Admission::new(AdmissionState::Never);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        self.check_concurrents();
        Admission::new(AdmissionState::Waiting(rx))
    }

    pub fn stop(&mut self) -> Result<(), ConcurrencyLimiterError> {
        if self.limit <= 0 {
            return Ok(());
        }
        if self.concurrents == 0 {
            error!(key = %self.name, "Concurrency limiter stopped below zero");
            return Err(ConcurrencyLimiterError::StopWithoutStart {
                key: self.name.clone(),
            });
        }
        self.concurrents -= 1;
        self.check_concurrents();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.concurrents == 0 && self.waiters.is_empty()
    }

    /// Forget queued waiters whose admission has been dropped.
    fn prune_abandoned(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
    }

    fn check_concurrents(&mut self) {
        while (self.concurrents as i64) < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.concurrents += 1;
            } else {
                debug!(key = %self.name, "Skipping abandoned waiter");
            }
        }
    }
}

/// Stops its key when dropped, so cancelled work still frees its slot.
struct Slot<'a> {
    manager: &'a ConcurrencyLimitManager,
    key: &'a str,
    armed: bool,
}

impl Slot<'_> {
    fn release(mut self) -> Result<(), ConcurrencyLimiterError> {
        self.armed = false;
        self.manager.stop(self.key)
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(key = %self.key, "Releasing slot of cancelled work");
        if let Err(e) = self.manager.stop(self.key) {
            error!(key = %self.key, error = %e, "Failed to release cancelled slot");
        }
    }
}

/// Process-wide map of key to limiter, all sharing one limit.
pub struct ConcurrencyLimitManager {
    limit: i64,
    limiters: Limiters,
}

impl ConcurrencyLimitManager {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            limiters: Arc::new(DashMap::new()),
        }
    }

    pub fn start(&self, key: &str) -> Admission {
        let mut admission = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| ConcurrencyLimiter::new(key, self.limit))
            .start();
        admission.abandon = Some(Abandon {
            limiters: self.limiters.clone(),
            key: key.to_string(),
        });
        self.cleanup_limiter(key);
        admission
    }

    pub fn stop(&self, key: &str) -> Result<(), ConcurrencyLimiterError> {
        let result = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| ConcurrencyLimiter::new(key, self.limit))
            .stop();
        self.cleanup_limiter(key);
        result
    }

    /// Run `work` once admitted for `key`, releasing the slot afterwards.
    /// Dropping the returned future releases the slot too.
    pub async fn run<F, T>(&self, key: &str, work: F) -> Result<T, ConcurrencyLimiterError>
    where
        F: Future<Output = T>,
    {
        self.start(key).await;
        let slot = Slot {
            manager: self,
            key,
            armed: self.limit > 0,
        };
        let output = work.await;
        slot.release()?;
        Ok(output)
    }

    pub fn is_tracking(&self, key: &str) -> bool {
        self.limiters.contains_key(key)
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiters.len()
    }

    fn cleanup_limiter(&self, key: &str) {
        self.limiters.remove_if(key, |_, limiter| limiter.is_empty());
    }
}
