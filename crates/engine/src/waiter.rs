//! Blocking poll for effects that are not immediately observable.

use std::future::Future;
use std::time::{Duration, Instant};
use warden_core::{WaitConfig, WardenError, WardenResult};

/// Fixed-interval poll bounded by an overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationWaiter {
    timeout: Duration,
    interval: Duration,
}

/// How a successful wait went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    pub polls: u32,
    pub elapsed: Duration,
}

impl PropagationWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls `predicate` until it returns `true` or the timeout elapses.
    ///
    /// `Ok(false)` means "not yet"; an `Err` from the predicate is returned
    /// as-is and never retried. A single notice is logged on the first
    /// unsuccessful poll.
    pub async fn wait_for<F, Fut>(&self, description: &str, mut predicate: F) -> WardenResult<WaitReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WardenResult<bool>>,
    {
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            polls += 1;
            if predicate().await? {
                let elapsed = started.elapsed();
                if polls > 1 {
                    tracing::info!(description, polls, elapsed_ms = elapsed.as_millis() as u64, "propagated");
                }
                return Ok(WaitReport { polls, elapsed });
            }

            if polls == 1 {
                tracing::info!(
                    description,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "waiting for propagation"
                );
            }

            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(WardenError::PropagationTimeout {
                    description: description.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

impl From<WaitConfig> for PropagationWaiter {
    fn from(cfg: WaitConfig) -> Self {
        Self::new(cfg.timeout(), cfg.interval())
    }
}

impl Default for PropagationWaiter {
    fn default() -> Self {
        WaitConfig::default().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;
    use warden_core::{ApiError, ErrorKind};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn fast() -> PropagationWaiter {
        PropagationWaiter::new(Duration::from_millis(1000), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn resolves_on_third_poll_with_one_notice() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let report = fast()
            .wait_for("role binding on projects/app", || async move {
                Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3)
            })
            .await
            .unwrap();

        assert_eq!(report.polls, 3);
        assert!(report.elapsed >= Duration::from_millis(20));
        assert!(report.elapsed < Duration::from_millis(1000));
        assert_eq!(logs.text().matches("waiting for propagation").count(), 1);
    }

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        let report = fast().wait_for("noop", || async { Ok(true) }).await.unwrap();
        assert_eq!(report.polls, 1);
        assert!(report.elapsed < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn times_out_with_description() {
        let waiter = PropagationWaiter::new(Duration::from_millis(30), Duration::from_millis(10));
        let err = waiter
            .wait_for("service iap.googleapis.com", || async { Ok(false) })
            .await
            .unwrap_err();

        match err {
            WardenError::PropagationTimeout { description, elapsed } => {
                assert_eq!(description, "service iap.googleapis.com");
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn predicate_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = fast()
            .wait_for("anything", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new("getProject", ErrorKind::PermissionDenied, "denied").into())
            })
            .await
            .unwrap_err();

        assert_eq!(err.api_kind(), Some(ErrorKind::PermissionDenied));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
