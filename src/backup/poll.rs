//! Bounded readiness polling.
//!
//! Every wait in the pipeline is a [`poll_until`] with a different probe. The
//! probe only observes; it never re-issues the operation being waited on.
//! Dropping the returned future cancels the wait.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Result of a single readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not ready yet; carries the observed state for logging
    Pending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("probe failed: {0}")]
    Probe(E),

    #[error("timed out after {}s", waited.as_secs())]
    TimedOut { waited: Duration },
}

/// Run `probe` until it reports ready, sleeping `policy.interval` between checks.
///
/// The probe always runs at least once, even with a zero timeout. A probe
/// error ends the wait immediately.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match probe().await.map_err(PollError::Probe)? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending(state) => {
                debug!("Poll attempt {} not ready: {}", attempts, state);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                waited: now - started,
            });
        }
        sleep(policy.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn returns_value_once_ready() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, PollError<()>> = poll_until(&fast(), || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n < 3 {
                Probe::Pending(format!("attempt {}", n))
            } else {
                Probe::Ready(n)
            })
        })
        .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn probe_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), PollError<&str>> = poll_until(&fast(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await;

        assert!(matches!(result, Err(PollError::Probe("boom"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let policy = PollPolicy::new(Duration::from_secs(30), Duration::from_secs(120));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), PollError<()>> = poll_until(&policy, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Probe::Pending("creating".into()))
        })
        .await;

        match result {
            Err(PollError::TimedOut { waited }) => assert_eq!(waited, Duration::from_secs(120)),
            other => panic!("expected timeout, got {:?}", other),
        }
        // t = 0, 30, 60, 90, 120
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_probes_once() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::ZERO);
        let result: Result<&str, PollError<()>> =
            poll_until(&policy, || async { Ok(Probe::Ready("done")) }).await;
        assert_eq!(result.ok(), Some("done"));
    }
}
