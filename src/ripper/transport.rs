//! HTTP transport capability used by the scanner, site resolvers and workers
//!
//! All upstream traffic goes through the `Transport` trait so the
//! orchestration core can be driven by an in-memory fake in tests.
//! `ReqwestTransport` shares one pooled client (and its cookie jar, which
//! carries the forum session) between every caller.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use tracing::debug;

use crate::ripper::config_loader::Connection;
use crate::ripper::error::{RipperError, RipperResult};

/// Header name/value pairs attached to a single request
pub type Headers = [(String, String)];

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Streaming response body plus the metadata workers need before reading it
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, RipperResult<Bytes>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and return the body as text; non-2xx statuses are errors
    async fn get_text(&self, url: &str, headers: &Headers) -> RipperResult<String>;

    /// POST an urlencoded form and return the body as text
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        headers: &Headers,
    ) -> RipperResult<String>;

    /// GET `url` and hand back the body as a stream of chunks
    async fn get_stream(&self, url: &str, headers: &Headers) -> RipperResult<ByteStream>;
}

/// `Transport` backed by a pooled `reqwest::Client`
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(connection: &Connection) -> RipperResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .gzip(true)
            .pool_max_idle_per_host(connection.worker_count().max(4))
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(connection.timeout_secs))
            .read_timeout(Duration::from_secs(connection.timeout_secs))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }

    fn apply_headers(mut request: reqwest::RequestBuilder, headers: &Headers) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    async fn send(request: reqwest::RequestBuilder, url: &str) -> RipperResult<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(url, status = status.as_u16(), "Unexpected response status");
            return Err(RipperError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get_text(&self, url: &str, headers: &Headers) -> RipperResult<String> {
        let request = Self::apply_headers(self.client.get(url), headers);
        let response = Self::send(request, url).await?;
        Ok(response.text().await?)
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        headers: &Headers,
    ) -> RipperResult<String> {
        let request = Self::apply_headers(self.client.post(url).form(form), headers);
        let response = Self::send(request, url).await?;
        Ok(response.text().await?)
    }

    async fn get_stream(&self, url: &str, headers: &Headers) -> RipperResult<ByteStream> {
        let request = Self::apply_headers(self.client.get(url), headers);
        let response = Self::send(request, url).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RipperError::from))
            .boxed();
        Ok(ByteStream {
            content_length,
            content_type,
            body,
        })
    }
}

/// Build a header list from string pairs
pub fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
