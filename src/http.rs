//! HTTP transport used for discovery and token requests.

use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Only a plain 200 counts as success for discovery and token responses.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Minimal HTTP client capability.
///
/// Non-2xx statuses are returned as responses, not errors; only failures to
/// complete the exchange are errors.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;

    /// POST `form` as `application/x-www-form-urlencoded`.
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse>;
}

#[async_trait::async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        (**self).get(url).await
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse> {
        (**self).post_form(url, form).await
    }
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .user_agent(concat!("oidc-pkce-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn into_response(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        debug!(%url, "GET");
        let response = self.client.get(url).send().await?;
        Self::into_response(response).await
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse> {
        debug!(%url, "POST form");
        let response = self.client.post(url).form(form).send().await?;
        Self::into_response(response).await
    }
}
