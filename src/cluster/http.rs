//! Thin client for the REST API every node exposes.

use serde::Deserialize;
use tracing::debug;

use crate::config::TenantId;
use crate::errors::HttpError;
use crate::Result;

/// One tenant as reported by a storage node.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantInfo {
    pub id: TenantId,
    pub state: String,
}

/// Client bound to a single node's HTTP listener.
#[derive(Debug, Clone)]
pub struct NodeHttpClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl NodeHttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send and convert any non-2xx response into [`HttpError::Status`] with
    /// the body attached.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(HttpError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                url,
                body,
            }
            .into());
        }
        Ok(response)
    }

    /// Health check. Any 2xx means the node is up and serving.
    pub async fn status(&self) -> Result<serde_json::Value> {
        let response = self.send(self.request(reqwest::Method::GET, "/v1/status")).await?;
        Ok(response.json().await.map_err(HttpError::Transport)?)
    }

    /// Raw Prometheus-format metrics text.
    pub async fn metrics(&self) -> Result<String> {
        let response = self.send(self.request(reqwest::Method::GET, "/metrics")).await?;
        Ok(response.text().await.map_err(HttpError::Transport)?)
    }

    pub async fn tenant_list(&self) -> Result<Vec<TenantInfo>> {
        let response = self.send(self.request(reqwest::Method::GET, "/v1/tenant")).await?;
        Ok(response.json().await.map_err(HttpError::Transport)?)
    }

    pub async fn tenant_attach(&self, tenant: &TenantId) -> Result<()> {
        debug!("Attaching tenant {tenant} via {}", self.base_url);
        self.send(self.request(reqwest::Method::POST, &format!("/v1/tenant/{tenant}/attach")))
            .await?;
        Ok(())
    }

    pub async fn tenant_detach(&self, tenant: &TenantId) -> Result<()> {
        debug!("Detaching tenant {tenant} via {}", self.base_url);
        self.send(self.request(reqwest::Method::POST, &format!("/v1/tenant/{tenant}/detach")))
            .await?;
        Ok(())
    }
}

/// Extract one gauge/counter value from Prometheus exposition text.
///
/// Matches a bare sample name or a labelled one; returns the first sample's
/// value. Full metrics-text parsing stays out of scope.
pub fn metric_value(metrics_text: &str, name: &str) -> Option<f64> {
    for line in metrics_text.lines() {
        if line.starts_with('#') {
            continue;
        }
        let matches = line
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with(' ') || rest.starts_with('{'));
        if !matches {
            continue;
        }
        if let Some(value) = line.rsplit(' ').next() {
            return value.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod http_test {
    use super::*;

    const SAMPLE: &str = "\
# HELP storage_unexpected_errors_total counter
# TYPE storage_unexpected_errors_total counter
storage_unexpected_errors_total 0
storage_request_seconds{method=\"get\"} 1.25
storage_request_seconds_count 17
";

    #[test]
    fn extracts_bare_sample() {
        assert_eq!(metric_value(SAMPLE, "storage_unexpected_errors_total"), Some(0.0));
    }

    #[test]
    fn extracts_labelled_sample() {
        assert_eq!(metric_value(SAMPLE, "storage_request_seconds"), Some(1.25));
    }

    #[test]
    fn prefix_of_a_longer_name_does_not_match() {
        // `storage_request` is a strict prefix of a sample name, not a sample
        assert_eq!(metric_value(SAMPLE, "storage_request"), None);
    }

    #[test]
    fn missing_metric_reads_as_none() {
        assert_eq!(metric_value(SAMPLE, "no_such_metric"), None);
    }
}
