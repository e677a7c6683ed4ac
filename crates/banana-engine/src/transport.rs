use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use thiserror::Error;

use crate::config::{EngineConfig, Provider};
use crate::credentials::Credentials;
use crate::wire::{gemini_body, gemini_endpoint, openrouter_body, openrouter_endpoint, WirePayload};

/// Raw outcome of one HTTP attempt. Status classification is the client's
/// job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request could not be sent: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}

/// One attempt against the generation service.
#[async_trait]
pub trait GenerationTransport: Send + Sync {
    async fn send(
        &self,
        payload: &WirePayload,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<WireResponse, TransportError>;
}

pub struct HttpTransport {
    http: reqwest::Client,
    provider: Provider,
    api_base: String,
    model: String,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("banana-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            provider: config.provider,
            api_base: config.api_base().to_string(),
            model: config.model().to_string(),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn request(&self, payload: &WirePayload, secret: &str) -> reqwest::RequestBuilder {
        match self.provider {
            Provider::Gemini => self
                .http
                .post(gemini_endpoint(&self.api_base, &self.model))
                .header("x-goog-api-key", secret)
                .json(&gemini_body(payload)),
            Provider::OpenRouter => self
                .http
                .post(openrouter_endpoint(&self.api_base))
                .bearer_auth(secret)
                .json(&openrouter_body(payload, &self.model)),
        }
    }
}

#[async_trait]
impl GenerationTransport for HttpTransport {
    async fn send(
        &self,
        payload: &WirePayload,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<WireResponse, TransportError> {
        let secret = credentials
            .secret()
            .ok_or_else(|| TransportError::Other("no API key".to_string()))?;
        let response = self
            .request(payload, secret)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(err, timeout))?
            .to_vec();
        Ok(WireResponse {
            status,
            body,
            retry_after,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    let err = err.without_url();
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Delay-seconds form only; HTTP-date values are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds.min(3600.0)))
}
