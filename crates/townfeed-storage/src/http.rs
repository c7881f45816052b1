use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Bound on establishing a connection. Transfer timeouts are set per request.
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no response from {url} within {idle:?}")]
    Idle { url: String, idle: Duration },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => source.is_timeout(),
            FetchError::Idle { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = resp.status();
    debug!(status = status.as_u16(), "upstream responded");
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

/// Upstream fetcher shared by every job. No retries: a failure is fatal for the run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    /// Send a GET and return the response once its status is known to be a success.
    ///
    /// `timeout` bounds the whole exchange, body included.
    pub async fn send(
        &self,
        source_id: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            check_status(resp)
        }
        .instrument(span)
        .await
    }

    /// Send a GET whose body will be streamed. `idle` bounds the wait for the response
    /// headers only; the caller bounds the gaps between body chunks.
    pub async fn send_streaming(
        &self,
        source_id: &str,
        url: &str,
        idle: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("http_fetch", source_id, url, streaming = true);
        async {
            let resp = tokio::time::timeout(idle, self.client.get(url).send())
                .await
                .map_err(|_| FetchError::Idle {
                    url: url.to_string(),
                    idle,
                })?
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            check_status(resp)
        }
        .instrument(span)
        .await
    }

    /// Fetch a small resource fully into memory.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.send(source_id, url, timeout).await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: final_url.clone(),
                source,
            })?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
