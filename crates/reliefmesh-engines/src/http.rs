//! Shared HTTP plumbing for engine clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::EngineError;

/// Configuration for an HTTP-backed engine.
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    /// Full endpoint URL the engine is invoked at.
    pub endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Client-side request timeout in seconds.
    pub timeout_secs: u64,
    /// Engine/model identifier recorded into the produced record.
    pub model: Option<String>,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            timeout_secs: 120,
            model: None,
        }
    }
}

pub(crate) fn build_client(config: &HttpEngineConfig) -> Result<reqwest::Client, EngineError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| EngineError::Unavailable(format!("invalid api key header: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
        .map_err(|e| EngineError::Unavailable(format!("build http client failed: {}", e)))
}

pub(crate) async fn post_json<B: Serialize, R: DeserializeOwned>(
    client: &reqwest::Client,
    endpoint: &str,
    body: &B,
) -> Result<R, EngineError> {
    let response = client
        .post(endpoint)
        .json(body)
        .send()
        .await
        .map_err(|e| EngineError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(EngineError::BadStatus {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json::<R>()
        .await
        .map_err(|e| EngineError::InvalidResponse(e.to_string()))
}
