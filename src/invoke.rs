//! Calls HTTP-triggered functions on the host.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::poll::retry::IsRetryable;

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const FUNCTION_KEY_HEADER: &str = "x-functions-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    Timeout,
    Network(String),
    Client(String),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::Timeout => write!(f, "request timed out"),
            InvokeError::Network(msg) => write!(f, "network error: {}", msg),
            InvokeError::Client(msg) => write!(f, "client error: {}", msg),
        }
    }
}

impl std::error::Error for InvokeError {}

impl IsRetryable for InvokeError {
    /// A timed out request may still have run the function, so only
    /// transport failures are retried.
    fn is_retryable(&self) -> bool {
        matches!(self, InvokeError::Network(_))
    }
}

pub struct FunctionInvoker {
    client: Client,
    base_url: String,
    function_key: Option<String>,
}

impl FunctionInvoker {
    pub fn new(base_url: &str, function_key: Option<String>) -> Result<Self, InvokeError> {
        Self::with_timeout(base_url, function_key, INVOKE_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        function_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InvokeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InvokeError::Client(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            function_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for an HTTP-triggered function. `query` is appended as given.
    pub fn url(&self, route: &str, query: &str) -> String {
        let route = route.trim_start_matches('/');
        let query = query.trim_start_matches('?');
        if query.is_empty() {
            format!("{}/api/{}", self.base_url, route)
        } else {
            format!("{}/api/{}?{}", self.base_url, route, query)
        }
    }

    /// `GET /api/{route}?{query}`. Any status is returned; only transport
    /// failures are errors.
    #[instrument(name = "invoke", skip(self))]
    pub async fn invoke(&self, route: &str, query: &str) -> Result<HttpResponse, InvokeError> {
        let mut request = self.client.get(self.url(route, query));
        if let Some(key) = &self.function_key {
            request = request.header(FUNCTION_KEY_HEADER, key);
        }
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        debug!(status, body_len = body.len(), "function responded");
        Ok(HttpResponse { status, body })
    }

    /// Probe helper: true once the host answers on its root URL.
    pub async fn is_reachable(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %self.base_url, error = %e, "host not reachable yet");
                false
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> InvokeError {
    if e.is_timeout() {
        InvokeError::Timeout
    } else {
        InvokeError::Network(e.to_string())
    }
}
