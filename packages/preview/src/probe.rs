// ABOUTME: Readiness polling for spawned dev servers
// ABOUTME: Treats any non-5xx HTTP response or an accepted TCP connection as ready

use crate::types::{SandboxError, SandboxResult};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Upper bound on a single probe request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a local port until a server answers.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    interval: Duration,
}

impl ReadinessProbe {
    pub fn new(interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT.min(interval.max(Duration::from_millis(500)) * 2))
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build probe client ({}), using defaults", e);
                reqwest::Client::new()
            });

        Self { client, interval }
    }

    /// Wait until something serves `port`, or fail.
    ///
    /// `failure_check` runs before every poll; when it reports an error the probe gives
    /// up immediately with that error instead of spending the rest of its budget.
    ///
    /// # Errors
    ///
    /// * The error returned by `failure_check` (typically `BuildFailed`)
    /// * `SandboxError::ReadinessTimeout` when `timeout_budget` elapses first
    pub async fn wait_until_ready<F, Fut>(
        &self,
        port: u16,
        timeout_budget: Duration,
        failure_check: F,
    ) -> SandboxResult<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Option<SandboxError>>,
    {
        let deadline = Instant::now() + timeout_budget;
        let mut polls = 0u32;

        loop {
            if let Some(err) = failure_check().await {
                debug!("Readiness probe on port {} aborted: {}", port, err);
                return Err(err);
            }

            polls += 1;
            if self.is_serving(port).await {
                info!("Port {} ready after {} poll(s)", port, polls);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Port {} not ready after {}s ({} polls)",
                    port,
                    timeout_budget.as_secs(),
                    polls
                );
                return Err(SandboxError::ReadinessTimeout {
                    port,
                    timeout_secs: timeout_budget.as_secs(),
                });
            }

            sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// One poll: HTTP first, raw TCP as a fallback.
    pub async fn is_serving(&self, port: u16) -> bool {
        match self
            .client
            .get(format!("http://localhost:{}/", port))
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                debug!("Probe of port {} answered {}", port, status);
                !status.is_server_error()
            }
            Err(e) => {
                debug!("Probe of port {} failed: {}", port, e);
                is_accepting(port).await
            }
        }
    }
}

async fn is_accepting(port: u16) -> bool {
    matches!(
        timeout(REQUEST_TIMEOUT, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}
