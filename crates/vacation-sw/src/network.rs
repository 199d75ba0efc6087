//! Network access for the worker.

use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use reqwest::Client;
use tracing::{debug, trace};

use crate::error::NetworkError;
use crate::request::{FetchRequest, FetchResponse};

/// The network the worker falls through to on a cache miss.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request. Any HTTP status is a successful fetch; only
    /// transport failures are errors.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError>;
}

/// `reqwest`-backed network.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    timeout: Option<Duration>,
}

impl HttpNetwork {
    /// Create a network with a default client.
    pub fn new() -> Result<Self, NetworkError> {
        let client = Client::builder()
            .user_agent(concat!("vacation-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Set a per-request timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        trace!(method = %request.method, url = %request.url, "Network fetch");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        debug!(
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "Network response"
        );

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            from_cache: false,
        })
    }
}

impl HttpNetwork {
    fn map_error(&self, err: reqwest::Error) -> NetworkError {
        match self.timeout {
            Some(timeout) if err.is_timeout() => NetworkError::Timeout(timeout),
            _ => NetworkError::Http(err),
        }
    }
}
