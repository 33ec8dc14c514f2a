//! HTTP readiness probe.

use std::time::Duration;

/// Per-request timeout; a hung socket must not stall the poll loop.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HealthProbe {
    pub fn new(listen: &str, port: u16, path: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build probe client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: health_url(listen, port, path),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET; any 2xx counts as ready.
    pub async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("Health probe {} not ready: {}", self.url, e);
                false
            }
        }
    }

    /// Poll every `interval` until a probe succeeds. Never resolves otherwise;
    /// callers bound it with their own deadline.
    pub async fn wait_until_ready(&self, interval: Duration) {
        loop {
            if self.check().await {
                tracing::info!("Server is responding at {}", self.url);
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Wildcard bind addresses are not connectable; probe loopback instead.
pub fn health_url(listen: &str, port: u16, path: &str) -> String {
    let host = match listen.trim() {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{}]", h),
        h => h.to_string(),
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    format!("http://{}:{}{}", host, port, path)
}
