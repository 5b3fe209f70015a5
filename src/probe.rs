//! Bounded readiness polling for freshly launched backends
//!
//! The prober is the only place a cold start waits, and it waits inside the
//! registry's exclusive lock, so every loop here has a hard upper bound.

use crate::error::InstanceError;
use crate::launcher::ProcessHandle;
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use hyper::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Why a single probe attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The backend answered with something other than 200
    Status(u16),
    /// No answer: connection refused, reset, or the attempt timed out
    Transport(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Status(code) => write!(f, "health check returned status {}", code),
            ProbeFailure::Transport(e) => write!(f, "health check failed: {}", e),
        }
    }
}

/// One health check request against a backend
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, port: u16, path: &str) -> Result<(), ProbeFailure>;
}

/// Source of delays between probe attempts
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real time via tokio's timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// HTTP GET through the shared connection pool, bounded by a per-attempt timeout
pub struct HttpHealthCheck {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl HttpHealthCheck {
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, port: u16, path: &str) -> Result<(), ProbeFailure> {
        match tokio::time::timeout(self.timeout, self.pool.get_status(port, path)).await {
            Ok(Ok(StatusCode::OK)) => Ok(()),
            Ok(Ok(status)) => Err(ProbeFailure::Status(status.as_u16())),
            Ok(Err(e)) => Err(ProbeFailure::Transport(e.to_string())),
            Err(_) => Err(ProbeFailure::Transport(format!(
                "no response within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Probe budget and path
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub health_path: String,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl ProbeConfig {
    /// Total time a backend gets to become ready: `max_attempts` x `interval`
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.max(1)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            health_path: "/api/health".to_string(),
            max_attempts: 100,
            interval: Duration::from_millis(10),
        }
    }
}

/// Polls a backend's health endpoint until it answers 200 or the budget runs out
pub struct ReadinessProber {
    config: ProbeConfig,
    check: Arc<dyn HealthCheck>,
    clock: Arc<dyn Clock>,
}

impl ReadinessProber {
    pub fn new(config: ProbeConfig, check: Arc<dyn HealthCheck>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            check,
            clock,
        }
    }

    /// Wait until the backend on `port` answers 200 on the health path.
    ///
    /// Returns the number of attempts used. Fails early if `handle` reports
    /// that the backend already died. The whole wait, checks included, ends
    /// at [`ProbeConfig::budget`] even if a check never completes.
    pub async fn wait_ready(
        &self,
        port: u16,
        handle: &mut ProcessHandle,
    ) -> Result<u32, InstanceError> {
        let max_attempts = self.config.max_attempts.max(1);
        let budget = self.config.budget();
        // A zero interval leaves nothing to measure against; attempts alone bound the loop
        let deadline = (!budget.is_zero()).then(|| Instant::now() + budget);
        let mut attempts = 0;
        let mut last_failure = String::from("no probe attempted");

        for attempt in 1..=max_attempts {
            if let Some(exit) = handle.exit_status() {
                debug!(port, attempt, exit = %exit, "Backend died during startup");
                return Err(InstanceError::NotReady {
                    port,
                    attempts,
                    reason: exit,
                });
            }
            attempts = attempt;

            let check = self.check.check(port, &self.config.health_path);
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, check)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ProbeFailure::Transport(format!(
                            "no response within the {}ms probe budget",
                            budget.as_millis()
                        )))
                    }),
                None => check.await,
            };

            match outcome {
                Ok(()) => {
                    debug!(port, attempt, "Backend passed readiness probe");
                    return Ok(attempt);
                }
                Err(failure) => {
                    trace!(
                        port,
                        attempt,
                        remaining = max_attempts - attempt,
                        failure = %failure,
                        "Readiness probe failed"
                    );
                    last_failure = failure.to_string();
                }
            }

            if attempt == max_attempts {
                break;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    self.config.interval.min(left)
                }
                None => self.config.interval,
            };
            self.clock.sleep(pause).await;
        }

        Err(InstanceError::NotReady {
            port,
            attempts,
            reason: last_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` checks, then succeeds
    struct FlakyCheck {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthCheck for FlakyCheck {
        async fn check(&self, _port: u16, _path: &str) -> Result<(), ProbeFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ProbeFailure::Transport("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct StatusCheck(u16);

    #[async_trait]
    impl HealthCheck for StatusCheck {
        async fn check(&self, _port: u16, _path: &str) -> Result<(), ProbeFailure> {
            Err(ProbeFailure::Status(self.0))
        }
    }

    /// Records requested sleeps instead of sleeping
    #[derive(Default)]
    struct RecordingClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for RecordingClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
        }
    }

    fn running_handle() -> ProcessHandle {
        ProcessHandle::Task(tokio::spawn(std::future::pending::<()>()))
    }

    fn prober(check: Arc<dyn HealthCheck>, clock: Arc<RecordingClock>) -> ReadinessProber {
        ReadinessProber::new(ProbeConfig::default(), check, clock)
    }

    #[tokio::test]
    async fn test_ready_on_first_attempt() {
        let clock = Arc::new(RecordingClock::default());
        let check = Arc::new(FlakyCheck {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut handle = running_handle();

        let attempts = prober(check, Arc::clone(&clock))
            .wait_ready(4000, &mut handle)
            .await
            .unwrap();

        assert_eq!(attempts, 1);
        assert!(clock.sleeps.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_errors_consume_retries() {
        let clock = Arc::new(RecordingClock::default());
        let check = Arc::new(FlakyCheck {
            failures: 7,
            calls: AtomicU32::new(0),
        });
        let mut handle = running_handle();

        let attempts = prober(check.clone(), Arc::clone(&clock))
            .wait_ready(4000, &mut handle)
            .await
            .unwrap();

        assert_eq!(attempts, 8);
        assert_eq!(check.calls.load(Ordering::SeqCst), 8);
        let sleeps = clock.sleeps.lock();
        assert_eq!(sleeps.len(), 7);
        assert!(sleeps.iter().all(|d| *d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let clock = Arc::new(RecordingClock::default());
        let mut handle = running_handle();

        let err = prober(Arc::new(StatusCheck(503)), Arc::clone(&clock))
            .wait_ready(4000, &mut handle)
            .await
            .unwrap_err();

        match err {
            InstanceError::NotReady {
                port,
                attempts,
                reason,
            } => {
                assert_eq!(port, 4000);
                assert_eq!(attempts, 100);
                assert!(reason.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // No sleep after the final attempt
        let total: Duration = clock.sleeps.lock().iter().sum();
        assert_eq!(total, Duration::from_millis(990));
    }

    #[tokio::test]
    async fn test_dead_backend_fails_fast() {
        let clock = Arc::new(RecordingClock::default());
        let check = Arc::new(FlakyCheck {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut handle = ProcessHandle::Task(tokio::spawn(async {}));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = prober(check.clone(), clock)
            .wait_ready(4000, &mut handle)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("backend task finished"));
        assert_eq!(check.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_check_against_closed_port() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let pool = Arc::new(ConnectionPool::new(Default::default()));
        let check = HttpHealthCheck::new(pool, Duration::from_millis(200));

        let result = check.check(port, "/api/health").await;
        assert!(matches!(result, Err(ProbeFailure::Transport(_))));
    }

    /// Accepts connections and never answers
    struct HangingCheck;

    #[async_trait]
    impl HealthCheck for HangingCheck {
        async fn check(&self, _port: u16, _path: &str) -> Result<(), ProbeFailure> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hanging_check_bounded_by_budget() {
        let config = ProbeConfig {
            max_attempts: 10,
            interval: Duration::from_millis(10),
            ..ProbeConfig::default()
        };
        assert_eq!(config.budget(), Duration::from_millis(100));
        let prober = ReadinessProber::new(config, Arc::new(HangingCheck), Arc::new(TokioClock));
        let mut handle = running_handle();

        let started = std::time::Instant::now();
        let err = prober.wait_ready(4000, &mut handle).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(500));
        match err {
            InstanceError::NotReady {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("probe budget"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Serves one canned HTTP response per connection
    async fn canned_backend(response: &'static str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_http_check_requires_200() {
        let pool = Arc::new(ConnectionPool::new(Default::default()));
        let check = HttpHealthCheck::new(pool, Duration::from_millis(500));

        let no_content =
            canned_backend("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        assert_eq!(
            check.check(no_content, "/api/health").await,
            Err(ProbeFailure::Status(204))
        );

        let ok = canned_backend(
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
        )
        .await;
        assert_eq!(check.check(ok, "/api/health").await, Ok(()));
    }

    #[tokio::test]
    async fn test_no_content_counts_as_failed_attempt() {
        let port =
            canned_backend("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        let pool = Arc::new(ConnectionPool::new(Default::default()));
        let clock = Arc::new(RecordingClock::default());
        let prober = ReadinessProber::new(
            ProbeConfig {
                max_attempts: 3,
                ..ProbeConfig::default()
            },
            Arc::new(HttpHealthCheck::new(pool, Duration::from_millis(500))),
            clock,
        );
        let mut handle = running_handle();

        let err = prober.wait_ready(port, &mut handle).await.unwrap_err();
        match err {
            InstanceError::NotReady {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("204"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_probe_failure_display() {
        assert_eq!(
            ProbeFailure::Status(500).to_string(),
            "health check returned status 500"
        );
        assert!(ProbeFailure::Transport("refused".to_string())
            .to_string()
            .contains("refused"));
    }
}
