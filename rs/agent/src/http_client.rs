//! The hyper based HTTP transport.

use crate::error::AgentError;
use crate::transport::{Transport, TransportResponse};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, header::CONTENT_TYPE, Method, StatusCode, Uri as HyperUri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as HyperClient, ResponseFuture},
    rt::TokioExecutor,
};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

#[derive(Clone)]
pub struct HttpClientConfig {
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    pub http2_only: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Some(Duration::from_secs(600)),
            pool_max_idle_per_host: 1,
            http2_only: false,
        }
    }
}

/// An HTTP client to communicate with a replica.
///
/// Cloning shares the underlying connection pool.
#[derive(Clone)]
pub struct HttpClient {
    hyper: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    base_url: Url,
}

impl HttpClient {
    /// `base_url` is the replica or gateway origin; endpoint paths like
    /// `api/v4/canister/_/call` are joined onto it.
    pub fn new(base_url: Url) -> Self {
        Self::new_with_config(base_url, HttpClientConfig::default())
    }

    pub fn new_with_config(base_url: Url, config: HttpClientConfig) -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http();
        let https_connector = if config.http2_only {
            https_connector.enable_http2()
        } else {
            https_connector.enable_http1().enable_http2()
        };
        let https_connector = https_connector.wrap_connector(http_connector);

        let hyper = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(config.http2_only)
            .build::<_, Full<Bytes>>(https_connector);

        Self { hyper, base_url }
    }

    fn build_uri(&self, endpoint: &str) -> Result<HyperUri, AgentError> {
        let url = self.base_url.join(endpoint).map_err(|e| {
            AgentError::InvalidArgument(format!("failed to build URI for {endpoint}: {e}"))
        })?;
        url.as_str().parse::<HyperUri>().map_err(|e| {
            AgentError::InvalidArgument(format!("failed to parse URI {url}: {e}"))
        })
    }

    async fn wait_for_response(
        uri: HyperUri,
        response_future: ResponseFuture,
        deadline: Instant,
    ) -> Result<TransportResponse, AgentError> {
        let response = tokio::time::timeout_at(deadline, response_future)
            .await
            .map_err(|_| AgentError::Transport(format!("request to {uri} timed out")))?
            .map_err(|e| AgentError::Transport(format!("request to {uri} failed: {e}")))?;
        let status: StatusCode = response.status();
        let body = tokio::time::timeout_at(deadline, response.collect())
            .await
            .map_err(|_| {
                AgentError::Transport(format!("request to {uri} timed out reading the body"))
            })?
            .map_err(|e| AgentError::Transport(format!("failed to read body from {uri}: {e}")))?
            .to_bytes()
            .to_vec();
        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn post(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        deadline: Instant,
    ) -> Result<TransportResponse, AgentError> {
        let uri = self.build_uri(endpoint)?;
        let request = hyper::Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header(CONTENT_TYPE, "application/cbor")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| {
                AgentError::Transport(format!("failed to build POST request for {uri}: {e}"))
            })?;
        Self::wait_for_response(uri, self.hyper.request(request), deadline).await
    }

    async fn get(
        &self,
        endpoint: &str,
        deadline: Instant,
    ) -> Result<TransportResponse, AgentError> {
        let uri = self.build_uri(endpoint)?;
        Self::wait_for_response(uri.clone(), self.hyper.get(uri), deadline).await
    }
}
