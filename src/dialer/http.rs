use crate::config::DialerConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DialRequest {
    pub call_id: String,
    pub tenant_id: String,
    pub run_id: String,
    pub job_id: String,
    pub to: String,
    pub from: Option<String>,
    /// Where the vendor should open the call's media stream
    pub stream_url: Option<String>,
}

/// Places outbound calls with the telephony vendor. Returning `Ok` means
/// the vendor accepted the request, not that anyone answered.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, request: DialRequest) -> Result<()>;
}

pub struct HttpDialer {
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpDialer {
    pub fn new(url: String, auth_token: Option<String>) -> Self {
        Self {
            url,
            auth_token,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &DialerConfig) -> Option<Self> {
        config
            .dial_url
            .clone()
            .map(|url| Self::new(url, config.auth_token.clone()))
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, request: DialRequest) -> Result<()> {
        let mut builder = self
            .client
            .post(&self.url)
            .json(&request)
            .timeout(Duration::from_secs(10));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("dial {} rejected: {} {}", request.to, status, body));
        }
        debug!(call_id = request.call_id, to = request.to, "dial accepted");
        Ok(())
    }
}
