//! Bearer-token REST client shared by the provider and edge backends

use nimbus_common::{Error, ProviderErrorKind, Result};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Thin JSON client over `reqwest`
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    service: &'static str,
}

impl ApiClient {
    pub fn new(service: &'static str, base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::Validation(format!("{} API token is empty", service)));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("nimbus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            service,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    /// DELETE; responses without a body are fine.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.send::<()>(Method::DELETE, path, None).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(self.service, status, &body));
        }
        Ok(())
    }

    /// Fetch a document from an absolute URL without authentication.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.http.get(url).send().await.map_err(network_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify(self.service, status, &body));
        }
        Ok(body)
    }

    async fn request<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let resp = self.send(method, path, body).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(network_error)?;
        trace!("{} {} -> {}", self.service, path, status);

        if !status.is_success() {
            return Err(classify(self.service, status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            Error::provider(
                ProviderErrorKind::Permanent,
                format!("{} returned an unexpected response: {}", self.service, e),
            )
            .with_detail(text)
        })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {} {}", self.service, method, path);

        let mut req = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(network_error)
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::transient(format!("request failed: {}", e))
}

/// Map an HTTP failure onto the provider error classes.
///
/// The raw body is kept as the error detail.
pub fn classify(service: &str, status: StatusCode, body: &str) -> Error {
    let lowered = body.to_ascii_lowercase();
    let message = format!("{} API returned {}", service, status);

    let err = match status.as_u16() {
        _ if lowered.contains("resource_limit_exceeded") || lowered.contains("quota") => {
            Error::provider(ProviderErrorKind::QuotaExceeded, message)
        }
        401 | 403 => Error::Authentication {
            message: format!("{} rejected the API credentials", service),
            detail: None,
        },
        404 => Error::not_found(format!("{} resource", service), status.as_str()),
        409 if lowered.contains("uniqueness") || lowered.contains("already") => {
            Error::Conflict(message)
        }
        429 => Error::transient(message),
        400 | 422 => Error::provider(ProviderErrorKind::InvalidSpec, message),
        s if s >= 500 => Error::transient(message),
        _ => Error::provider(ProviderErrorKind::Permanent, message),
    };

    if body.is_empty() {
        err
    } else {
        err.with_detail(body)
    }
}
