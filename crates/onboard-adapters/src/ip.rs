use crate::AdapterError;
use async_trait::async_trait;
use onboard_core::{IpLookup, OnboardError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// Public IP lookup over a JSON endpoint answering `{ "ip": "..." }`.
///
/// The answer is the address the endpoint sees for this process, so it only names the
/// signer when the service runs on the signer's side of the network.
#[derive(Debug, Clone)]
pub struct HttpIpLookup {
    client: Client,
    endpoint: String,
}

impl HttpIpLookup {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, OnboardError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AdapterError::Http(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IpLookup for HttpIpLookup {
    async fn lookup(&self) -> Result<String, OnboardError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AdapterError::Http(format!("ip lookup request failed: {e}")))?;
        let body: IpResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Http(format!("ip lookup response invalid: {e}")))?;

        let ip = body.ip.trim().to_string();
        if ip.is_empty() {
            return Err(AdapterError::Http("ip lookup returned an empty address".to_string()).into());
        }
        debug!(endpoint = %self.endpoint, ip = %ip, "ip resolved");
        Ok(ip)
    }
}
