//! Async HTTP transport for the `oauth2` crate on top of `reqwest`.
//!
//! `oauth2` describes requests with its own (`http` 0.2) types; this adapter
//! replays them through a caller-supplied [`reqwest::Client`] so the daemon
//! controls TLS roots and timeouts.

use oauth2::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use oauth2::{HttpRequest, HttpResponse};
use thiserror::Error;

/// Failure while carrying a token request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response could not be read.
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// The request or response carried something that cannot be translated.
    #[error("invalid HTTP message: {0}")]
    InvalidMessage(String),
}

/// Execute an `oauth2` request with `client`.
pub async fn execute(
    client: &reqwest::Client,
    request: HttpRequest,
) -> Result<HttpResponse, TransportError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

    let mut builder = client.request(method, request.url.as_str());
    for (name, value) in request.headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = builder.body(request.body).send().await?;

    let status_code = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        let name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        headers.append(name, value);
    }

    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}
