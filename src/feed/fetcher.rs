use async_trait::async_trait;
use futures::StreamExt;
use url::Url;

use crate::config::Config;
use crate::error::FeedError;

/// Retrieves the raw body behind a URL.
///
/// The cache coordinator only talks to this trait, so tests can substitute a
/// counting or failing implementation for [`HttpFetcher`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs one GET for `url` and returns the complete response body.
    ///
    /// The connection is released before this returns, on success and on
    /// every error path.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FeedError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
///
/// Requests carry no headers beyond the client defaults. The status code is
/// not inspected unless `reject_error_status` is set, so an error page is
/// handed to the decoder like any other body.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
    reject_error_status: bool,
}

impl HttpFetcher {
    /// Builds a client with the configured connect and read timeouts.
    pub fn new(config: &Config) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Uses an existing client; only the body limit and status policy are
    /// taken from `config`.
    pub fn with_client(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            max_body_bytes: config.max_body_bytes,
            reject_error_status: config.reject_error_status,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let parsed = Url::parse(url)
            .map_err(|e| FeedError::Network(format!("invalid URL '{url}': {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(FeedError::Network(format!(
                    "unsupported scheme: {scheme} (only http/https allowed)"
                )))
            }
        }

        let response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            if self.reject_error_status {
                return Err(FeedError::Network(format!(
                    "HTTP error: status {}",
                    status.as_u16()
                )));
            }
            tracing::debug!(
                url = %url,
                status = %status,
                "Non-success status, passing body to decoder"
            );
        }

        let bytes = read_limited_bytes(response, self.max_body_bytes).await?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched body");
        Ok(bytes)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FeedError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(too_large(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(body_read_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(too_large(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    // Fewer bytes than Content-Length means the stream was cut short
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FeedError::Io(format!(
                "incomplete response: expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

/// Once headers are in, a failed read is a broken stream unless it timed out.
fn body_read_error(e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::from(e)
    } else {
        FeedError::Io(format!("response body read failed: {e}"))
    }
}

fn too_large(limit: usize) -> FeedError {
    FeedError::Network(format!("response too large (exceeds {limit} bytes)"))
}
