//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware for
//! exponential backoff retries and standardized JSON response handling.

use reqwest::{
    Url,
    header::{AUTHORIZATION, HeaderMap},
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;

use crate::error::FetchError;

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with metadata about the HTTP
/// transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// authentication tokens, and automatic retries.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Retries applied to transient failures (connect errors, 5xx, 429).
    pub const MAX_RETRIES: u32 = 3;

    /// Creates a new `ApiClient` with the retry policy installed.
    ///
    /// # Errors
    /// `FetchError::Unavailable` if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, FetchError> {
        // A trailing slash keeps `join` from replacing the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)
            .map_err(|e| FetchError::Unavailable(format!("invalid base URL `{}`: {}", base_url, e)))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(Self::MAX_RETRIES);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a `GET` and captures the response. Every endpoint the sync
    /// layer pulls from is read-only.
    ///
    /// Non-2xx answers are not errors at this level; they come back with
    /// `success == false` and the raw body in `error_body`.
    ///
    /// # Errors
    /// `FetchError::Request` when the URL cannot be built or the request
    /// never got an answer, `FetchError::Body` when a 2xx body is not the
    /// expected JSON.
    pub async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ApiResponse<T>, FetchError> {
        let full_url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::Request(format!("bad path `{}`: {}", path, e)))?;
        let mut req = self.inner.get(full_url);

        if !query.is_empty() {
            req = req.query(query);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response: reqwest::Response = req
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Body(e.to_string()))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// `GET` a JSON document. 404 maps to `FetchError::NotFound`, any other
    /// non-2xx status to `FetchError::Status`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FetchError> {
        let resp = self.request::<T>(path, query).await?;
        match resp {
            ApiResponse {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ApiResponse { status: 404, .. } => Err(FetchError::NotFound(path.to_string())),
            ApiResponse { status, error_body, .. } => Err(FetchError::Status {
                status,
                path: path.to_string(),
                body: error_body.unwrap_or_default(),
            }),
        }
    }
}
