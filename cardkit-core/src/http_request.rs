use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};

use crate::controller::{SyncAck, SyncBatch, SyncTransport};
use crate::error::{CardKitError, CardKitResult};

/// A simple wrapper on an HTTP client for making requests. Sets sensible defaults such as timeouts
/// & user-agent, and applies retry middleware for transient failures.
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl Request {
    /// Initializes a new `Request` instance.
    pub(crate) fn new() -> Self {
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(5);
        let max_retries = 3; // total attempts = 4
        Self {
            client,
            timeout,
            max_retries,
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("cardkit-core/{}", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Handles sending a request built by `req`/`post` with retries for transient failures.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, CardKitError> {
        if request_builder.try_clone().is_none() {
            return execute_request_builder(request_builder)
                .await
                .map_err(Into::into);
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        let template = request_builder
            .try_clone()
            .ok_or_else(|| CardKitError::Network {
                url: "<unknown>".to_string(),
                status: None,
                error: "request cannot be retried because it is not cloneable".to_string(),
            })?;

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                RequestHandleError::permanent(
                    "<unknown>".to_string(),
                    None,
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute_request_builder(request_builder).await
        })
        .retry(backoff)
        .when(|err: &RequestHandleError| err.is_retryable())
        .notify(|err: &RequestHandleError, delay: Duration| {
            log::debug!("retrying {} in {delay:?}: {}", err.url, err.error);
        })
        .await
        .map_err(Into::into)
    }
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    status: Option<u16>,
    error: String,
    retryable: bool,
}

impl RequestHandleError {
    const fn retryable(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: true,
        }
    }

    const fn permanent(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<RequestHandleError> for CardKitError {
    fn from(value: RequestHandleError) -> Self {
        Self::Network {
            url: value.url,
            status: value.status,
            error: value.error,
        }
    }
}

async fn execute_request_builder(
    request_builder: RequestBuilder,
) -> Result<Response, RequestHandleError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestHandleError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            None,
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(RequestHandleError::retryable(
                    url,
                    Some(status),
                    format!("request error with bad status code {status}"),
                ));
            }
            Ok(resp)
        }
        Err(err) => {
            if err.is_timeout() || err.is_connect() {
                return Err(RequestHandleError::retryable(
                    url,
                    None,
                    format!("request timeout/connect error: {err}"),
                ));
            }

            Err(RequestHandleError::permanent(
                url,
                None,
                format!("request failed: {err}"),
            ))
        }
    }
}

/// [`SyncTransport`] posting batches as JSON to `<base_url>/v1/journal/sync`.
///
/// The endpoint must use HTTPS unless the transport was built with
/// [`HttpSyncTransport::new_insecure`].
pub struct HttpSyncTransport {
    endpoint: String,
    request: Request,
}

impl HttpSyncTransport {
    /// Creates a transport for an HTTPS server.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] for a non-HTTPS base URL.
    pub fn new(base_url: &str) -> CardKitResult<Self> {
        if !base_url.starts_with("https://") {
            return Err(CardKitError::InvalidInput(format!(
                "sync endpoint must use https: {base_url}"
            )));
        }
        Ok(Self::new_insecure(base_url))
    }

    /// Creates a transport without the HTTPS check. For local testing only.
    #[must_use]
    pub fn new_insecure(base_url: &str) -> Self {
        Self {
            endpoint: format!("{}/v1/journal/sync", base_url.trim_end_matches('/')),
            request: Request::new(),
        }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, batch: SyncBatch) -> CardKitResult<SyncAck> {
        let response = self
            .request
            .handle(self.request.post(&self.endpoint).json(&batch))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CardKitError::Network {
                url: self.endpoint.clone(),
                status: Some(status.as_u16()),
                error: format!("sync rejected with status {status}"),
            });
        }
        response
            .json::<SyncAck>()
            .await
            .map_err(|err| CardKitError::Serialization(format!("sync response: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn batch() -> SyncBatch {
        SyncBatch {
            batch_id: Uuid::new_v4(),
            controller_id: "lobby".to_string(),
            entries: Vec::new(),
        }
    }

    #[test]
    fn test_plain_http_is_rejected() {
        assert!(matches!(
            HttpSyncTransport::new("http://example.com"),
            Err(CardKitError::InvalidInput(_))
        ));
        assert!(HttpSyncTransport::new("https://example.com/").is_ok());
    }

    #[tokio::test]
    async fn test_push_parses_acknowledgement() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/journal/sync")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_body(r#"{"acknowledgedThrough": 7}"#)
            .create_async()
            .await;

        let transport = HttpSyncTransport::new_insecure(&server.url());
        let ack = transport.push(batch()).await.expect("push");

        mock.assert_async().await;
        assert_eq!(ack.acknowledged_through, Some(7));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/journal/sync")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let transport = HttpSyncTransport::new_insecure(&server.url());
        match transport.push(batch()).await {
            Err(CardKitError::Network { status, .. }) => assert_eq!(status, Some(503)),
            other => panic!("unexpected result: {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/journal/sync")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpSyncTransport::new_insecure(&server.url());
        match transport.push(batch()).await {
            Err(CardKitError::Network { status, .. }) => assert_eq!(status, Some(400)),
            other => panic!("unexpected result: {other:?}"),
        }
        mock.assert_async().await;
    }
}
