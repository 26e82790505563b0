use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use std::fmt::Debug;
use thiserror::Error;
use tracing::debug;

use crate::{config::ForwardSettings, model::WeatherOutput};

/// Upper bound on how much of an error response is read for logging.
const MAX_ERROR_BODY_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to send weather payload to {endpoint}: {source}")]
    Transport {
        endpoint: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("API rejected weather payload with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("invalid API endpoint: {0:#}")]
    Endpoint(anyhow::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ForwardError {
    /// Whether sending the same payload again later could succeed.
    ///
    /// Network failures, 5xx, 408 and 429 are transient. Any other rejection
    /// will be rejected again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForwardError::Transport { .. } => true,
            ForwardError::Rejected { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ForwardError::Endpoint(_) | ForwardError::Client(_) => false,
        }
    }
}

/// Destination for transformed weather payloads.
#[async_trait]
pub trait WeatherSink: Send + Sync + Debug {
    async fn forward(&self, output: &WeatherOutput) -> Result<StatusCode, ForwardError>;
}

/// Posts payloads as JSON to `<API_URL>weather`.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    endpoint: Url,
    http: Client,
    // Without a timeout an error body could stall the loop, so it is skipped.
    read_error_body: bool,
}

impl HttpForwarder {
    pub fn new(settings: &ForwardSettings) -> Result<Self, ForwardError> {
        let endpoint = settings.endpoint().map_err(ForwardError::Endpoint)?;

        let timeout = settings.timeout();
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ForwardError::Client)?;

        Ok(Self {
            endpoint,
            http,
            read_error_body: timeout.is_some(),
        })
    }
}

#[async_trait]
impl WeatherSink for HttpForwarder {
    async fn forward(&self, output: &WeatherOutput) -> Result<StatusCode, ForwardError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(output)
            .send()
            .await
            .map_err(|source| ForwardError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let status = res.status();
        debug!(%status, city = %output.city, "API responded");

        if !status.is_success() {
            let body = if self.read_error_body {
                read_capped(res).await
            } else {
                String::new()
            };
            return Err(ForwardError::Rejected {
                status,
                body: truncate_body(&body),
            });
        }

        Ok(status)
    }
}

// Body is only read for the log line; a read error just ends it early.
async fn read_capped(mut res: Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < MAX_ERROR_BODY_BYTES {
        match res.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&buf).into_owned()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
