//! Chunked HTTP streaming passthrough
//!
//! Forwards the dispatch payload to the endpoint's `http_stream_url` and
//! hands the upstream byte stream straight through to the client.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use futures::StreamExt;
use lazy_static::lazy_static;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info};

use crate::dispatch::request::{DispatchRequest, MODEL_HEADER};
use crate::registry::Endpoint;
use crate::utils::errors::DispatchError;

lazy_static! {
    static ref HTTP_CLIENT: Client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create HTTP client");
}

/// Open the upstream stream and build a passthrough response. The caller has
/// already resolved `llm` and verified it supports HTTP streaming.
pub async fn relay_http_stream(
    llm: &Endpoint,
    request: &DispatchRequest,
    timeout: Duration,
) -> Result<Response, DispatchError> {
    let upstream = HTTP_CLIENT
        .post(&llm.http_stream_url)
        .basic_auth(&llm.username, Some(&llm.password))
        .json(request)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            error!("Error calling {}: {}", llm.display_name(), e);
            DispatchError::NoFailover {
                status: 502,
                detail: e.to_string(),
            }
        })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&llm.response_mime)
        .to_string();

    let mut builder = Response::builder()
        .status(status)
        .header("content-type", content_type);
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(MODEL_HEADER.as_bytes()),
        HeaderValue::from_str(&llm.display_name()),
    ) {
        builder = builder.header(name, value);
    }

    let display_name = llm.display_name();
    let body_stream = upstream.bytes_stream().map(move |result| match result {
        Ok(bytes) => Ok(axum::body::Bytes::from(bytes.to_vec())),
        Err(e) => {
            error!("Stream error from {}: {}", display_name, e);
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Stream error: {}", e),
            ))
        }
    });

    let response = builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;

    info!(
        "Streaming (http) from {} -> {}",
        llm.display_name(),
        status
    );
    Ok(response)
}
