//! Bounded admission into risk reprocessing.
//!
//! Every reprocessing request takes one slot of a fixed-capacity semaphore
//! before it touches the deployment store, and gives it back when its
//! [`AdmissionPermit`] is dropped. Requests that wait longer than the
//! configured timeout are dropped; the next reprocessing cycle picks them
//! up again.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Cancellation signal shared with the caller. Sending `true` cancels.
/// A dropped sender never cancels.
pub type CancelSignal = watch::Receiver<bool>;

/// Resolves once `cancel` reads `true`. Pending forever if the sender is
/// gone without having cancelled.
pub async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("timed out after {waited:?} waiting for a reprocessing slot")]
    TimedOut { waited: Duration },

    #[error("cancelled while waiting for a reprocessing slot")]
    Cancelled,

    #[error("admission gate is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Metrics {
    queue_depth: AtomicUsize,
    holding: AtomicUsize,
    timeouts: AtomicU64,
}

/// Point-in-time view of the gate's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Requests waiting for a slot.
    pub queue_depth: usize,
    /// Requests holding a slot.
    pub holding: usize,
    /// Requests dropped on wait timeout since start.
    pub timeouts: u64,
}

/// Decrements the queue depth however the wait ends.
struct Queued<'a>(&'a Metrics);

impl<'a> Queued<'a> {
    fn enter(metrics: &'a Metrics) -> Self {
        metrics.queue_depth.fetch_add(1, Ordering::SeqCst);
        Self(metrics)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.queue_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Weighted semaphore with a wait timeout and cancellation.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl AdmissionGate {
    /// `wait_timeout` of zero waits indefinitely. A `max_concurrency` of zero
    /// would never admit anything and is raised to one.
    pub fn new(max_concurrency: usize, wait_timeout: Duration) -> Self {
        let capacity = if max_concurrency == 0 {
            warn!("admission capacity of 0 admits nothing; using 1");
            1
        } else {
            max_concurrency
        };
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait_timeout,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            queue_depth: self.metrics.queue_depth.load(Ordering::SeqCst),
            holding: self.metrics.holding.load(Ordering::SeqCst),
            timeouts: self.metrics.timeouts.load(Ordering::SeqCst),
        }
    }

    /// Stop admitting. Waiters and later callers get [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Wait for one slot.
    ///
    /// Cancellation wins over a slot that becomes free at the same moment.
    /// A timed-out or cancelled request never ends up holding a slot.
    pub async fn acquire(
        &self,
        cancel: &CancelSignal,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let mut cancel = cancel.clone();
        if *cancel.borrow_and_update() {
            debug!("reprocessing request cancelled before admission");
            return Err(AdmissionError::Cancelled);
        }

        let queued = Queued::enter(&self.metrics);
        let wait_timeout = self.wait_timeout;
        let deadline = async move {
            if wait_timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(wait_timeout).await;
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(AdmissionError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| AdmissionError::Closed)
            }
            _ = deadline => Err(AdmissionError::TimedOut { waited: wait_timeout }),
        };
        drop(queued);

        match result {
            Ok(permit) => {
                self.metrics.holding.fetch_add(1, Ordering::SeqCst);
                Ok(AdmissionPermit {
                    _permit: permit,
                    metrics: Arc::clone(&self.metrics),
                })
            }
            Err(AdmissionError::TimedOut { waited }) => {
                self.metrics.timeouts.fetch_add(1, Ordering::SeqCst);
                warn!(
                    waited = ?waited,
                    capacity = self.capacity,
                    "timed out waiting to reprocess deployment risk; dropping until next cycle"
                );
                Err(AdmissionError::TimedOut { waited })
            }
            Err(err) => {
                debug!(error = %err, "reprocessing request abandoned while queued");
                Err(err)
            }
        }
    }
}

/// A held slot. Released on drop, so every exit path gives it back.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<Metrics>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.metrics.holding.fetch_sub(1, Ordering::SeqCst);
    }
}
