//! Rate-limited `reqwest` wrapper shared by the marketplace clients.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{rate_limit::TokenBucket, trait_::AdapterError};
use crate::resilience::parse_retry_after;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "marketplace-sync/0.1";

#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    limiter: TokenBucket,
}

impl HttpClient {
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AdapterError::configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            limiter: TokenBucket::new(requests_per_second, burst),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Waits for a rate-limit token, sends, and turns non-2xx into [`AdapterError::Http`].
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AdapterError> {
        self.limiter.acquire().await;
        let response = request.send().await?;
        error_for_status(response).await
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, AdapterError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::malformed(e.to_string()))
    }
}

async fn error_for_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), ?retry_after, "marketplace returned error status");

    Err(AdapterError::Http {
        status: status.as_u16(),
        body,
        retry_after,
    })
}

/// Required string field from a credentials object.
pub fn required_credential(credentials: &Value, key: &str) -> Result<String, AdapterError> {
    optional_credential(credentials, key)
        .ok_or_else(|| AdapterError::configuration(format!("missing credential '{key}'")))
}

pub fn optional_credential(credentials: &Value, key: &str) -> Option<String> {
    credentials
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
