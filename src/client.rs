//! The HTTP client virtual users send requests through.
//!
//! By default each [`VirtualUser`](../user/struct.VirtualUser.html) gets its own
//! [`ReqwestClient`]. Any type implementing [`HttpClient`] can be used instead, set with
//! [`LoadTest::set_client`](../struct.LoadTest.html#method.set_client), which is how the
//! integration tests run deterministic load tests without a server.

use async_trait::async_trait;
use std::error::Error;
use std::time::Duration;

use crate::metrics::RequestErrorKind;
use crate::plan::RenderedRequest;
use crate::FlockError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// What a server sent back.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,
    /// Length of the response body.
    pub bytes_received: u64,
}

/// Sends one rendered request and waits for the complete response.
///
/// Failures to get a response are returned as a [`RequestErrorKind`], they are recorded
/// like any other outcome and never stop the virtual user.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &RenderedRequest) -> Result<HttpResponse, RequestErrorKind>;
}

/// An [`HttpClient`] built on [`reqwest`].
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: reqwest::Client,
}
impl ReqwestClient {
    /// Build a client that gives up on requests taking longer than `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, FlockError> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(ReqwestClient { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: &RenderedRequest) -> Result<HttpResponse, RequestErrorKind> {
        let mut builder = self
            .client
            .request(request.method.as_method(), request.url.as_str());
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status().as_u16();
        // The whole body is read so the latency covers the complete response.
        let body = response.bytes().await.map_err(|e| classify_error(&e))?;
        Ok(HttpResponse {
            status,
            bytes_received: body.len() as u64,
        })
    }
}

/// Determine why reqwest failed to get a response.
pub fn classify_error(error: &reqwest::Error) -> RequestErrorKind {
    if error.is_timeout() {
        return RequestErrorKind::Timeout;
    }
    if !error.is_connect() {
        debug!("request failed: {}", error);
        return RequestErrorKind::Other;
    }

    // Connect errors wrap the underlying cause, walk the chain to find it.
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            match io_error.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return RequestErrorKind::ConnectionRefused
                }
                std::io::ErrorKind::TimedOut => return RequestErrorKind::Timeout,
                _ => (),
            }
        }
        let description = cause.to_string().to_lowercase();
        if description.contains("dns error") || description.contains("failed to lookup") {
            return RequestErrorKind::Dns;
        }
        if description.contains("certificate")
            || description.contains("tls")
            || description.contains("ssl")
        {
            return RequestErrorKind::Tls;
        }
        source = cause.source();
    }
    debug!("failed to connect: {}", error);
    RequestErrorKind::Connect
}
