//! HTTP transport boundary.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use thiserror::Error;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Status and raw body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: Url) -> Result<RawResponse, TransportError>;

    /// POST `form` as `application/x-www-form-urlencoded`.
    async fn post_form(
        &self,
        url: Url,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent.unwrap_or(Self::user_agent()))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("hc-client/", env!("CARGO_PKG_VERSION"))
    }

    async fn collect(response: reqwest::Response) -> Result<RawResponse, TransportError> {
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(RawResponse { status, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: Url) -> Result<RawResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        Self::collect(response).await
    }

    async fn post_form(
        &self,
        url: Url,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        Self::collect(response).await
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(Duration::from_secs(5), None).expect("client")
    }

    #[tokio::test]
    async fn get_returns_status_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("GET").path("/api").query_param("action", "getStores");
                then.status(200).body(r#"{"success":true}"#);
            })
            .await;

        let url = Url::parse(&format!("{}?action=getStores", server.url("/api"))).unwrap();
        let raw = transport().get(url).await.expect("response");

        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, Bytes::from_static(br#"{"success":true}"#));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_form_encodes_pairs() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("POST")
                    .path("/api")
                    .header("content-type", FORM_CONTENT_TYPE)
                    .body("action=openOrder&note=a+b%26c");
                then.status(201).body("{}");
            })
            .await;

        let url = Url::parse(&server.url("/api")).unwrap();
        let form = vec![
            ("action".to_string(), "openOrder".to_string()),
            ("note".to_string(), "a b&c".to_string()),
        ];
        let raw = transport().post_form(url, &form).await.expect("response");

        assert_eq!(raw.status, 201);
        assert!(raw.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        let url = Url::parse("http://127.0.0.1:9/api").unwrap();
        let err = transport().get(url).await.expect_err("closed port");
        assert!(matches!(err, TransportError::Http(_)));
    }
}
