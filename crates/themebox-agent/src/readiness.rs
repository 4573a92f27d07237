use std::time::Duration;

use crate::config::ReadinessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ready: bool,
    pub attempts: u32,
}

/// Bounded TCP connect poller for `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    connect_timeout: Duration,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ReadinessProber {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(cfg: &ReadinessConfig) -> Self {
        Self::new(Duration::from_millis(cfg.connect_timeout_ms))
    }

    pub async fn wait_until_ready(&self, port: u16, max_attempts: u32, interval: Duration) -> bool {
        self.probe(port, max_attempts, interval).await.ready
    }

    /// Connects up to `max_attempts` times, sleeping `interval` between
    /// failures. The probe connection is closed as soon as it succeeds.
    pub async fn probe(&self, port: u16, max_attempts: u32, interval: Duration) -> ProbeOutcome {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    tracing::debug!(port, attempt, "port is accepting connections");
                    return ProbeOutcome {
                        ready: true,
                        attempts: attempt,
                    };
                }
                Ok(Err(e)) => {
                    tracing::trace!(port, attempt, error = %e, "readiness connect failed");
                }
                Err(_) => {
                    tracing::trace!(port, attempt, "readiness connect timed out");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        ProbeOutcome {
            ready: false,
            attempts: max_attempts,
        }
    }
}
