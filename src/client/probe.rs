//! Host reachability probe

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::http::routes::HealthResponse;

/// Probe errors. All of them mean "go offline".
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Host unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Host unhealthy: HTTP {0}")]
    Status(u16),

    #[error("Invalid health response: {0}")]
    Body(#[source] reqwest::Error),

    #[error("Host reported not ok")]
    NotOk,
}

/// Bounded-timeout health check against `GET /health`
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ProbeError::Client)?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check the host. Never takes longer than the configured timeout.
    pub async fn check(&self) -> Result<HealthResponse, ProbeError> {
        let request = async {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| self.classify(e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ProbeError::Status(status.as_u16()));
            }

            let health: HealthResponse = response.json().await.map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(self.timeout)
                } else {
                    ProbeError::Body(e)
                }
            })?;
            if !health.ok {
                return Err(ProbeError::NotOk);
            }
            Ok::<_, ProbeError>(health)
        };

        let result = tokio::time::timeout(self.timeout, request)
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.timeout)));
        match &result {
            Ok(health) => debug!(url = %self.url, tick = health.tick, "Host reachable"),
            Err(e) => debug!(url = %self.url, error = %e, "Host probe failed"),
        }
        result
    }

    fn classify(&self, error: reqwest::Error) -> ProbeError {
        if error.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else {
            ProbeError::Unreachable(error)
        }
    }
}
