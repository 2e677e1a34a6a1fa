//! Dispatch endpoints: completion, fill-in-middle, and chunked streaming

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use std::sync::Arc;
use std::time::Duration;

use super::AppState;
use crate::auth::Identity;
use crate::dispatch::{DispatchRequest, EngineResponse, InvokeMode, RequestContext};
use crate::stream::{self, StreamKind};
use crate::utils::errors::DispatchError;

/// Parse the dispatch payload by hand so malformed JSON surfaces as the
/// dispatcher's own parse error rather than an extractor rejection.
fn parse_payload(body: &Bytes) -> Result<DispatchRequest, DispatchError> {
    serde_json::from_slice(body).map_err(|e| DispatchError::InvalidPayload(e.to_string()))
}

pub async fn response_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    let request = parse_payload(&body)?;
    dispatch(&state, method, &headers, request, "/response", InvokeMode::Completion).await
}

pub async fn fim_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    let request = parse_payload(&body)?;
    dispatch(&state, method, &headers, request, "/fim", InvokeMode::Fim).await
}

/// Chunked HTTP streaming. Resolution is name-pinned or priority-1; a
/// streaming request is never failed over.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, DispatchError> {
    let request = parse_payload(&body)?;
    let llm = stream::resolve_stream_target(
        state.registry.as_ref(),
        request.llm_name.as_deref(),
        request.capability(),
        StreamKind::Http,
    )?;
    let timeout = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.request_timeout);
    stream::http::relay_http_stream(&llm, &request, timeout).await
}

async fn dispatch(
    state: &AppState,
    method: Method,
    headers: &HeaderMap,
    request: DispatchRequest,
    path: &str,
    mode: InvokeMode,
) -> Result<Response, DispatchError> {
    let identity = Identity::from_headers(headers);
    let ctx = RequestContext {
        method: method.to_string(),
        path: path.to_string(),
    };
    let engine_response = state.engine.dispatch(request, &identity, &ctx, mode).await?;
    Ok(into_http(engine_response))
}

fn into_http(engine_response: EngineResponse) -> Response {
    let EngineResponse {
        status,
        body,
        headers,
    } = engine_response;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::super::{create_router, test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_response_route_serves_backend_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body("backend says hi")
            .create_async()
            .await;

        let state = test_state();
        let mut llm = crate::registry::test_endpoint("a");
        llm.url = server.url();
        state.registry.put_endpoint(llm).unwrap();
        state.registry.put_type_binding("a", "text", 0).unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/response")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"instruction": "hi", "type": "text"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-dispatcher-model").unwrap(),
            "a(a-model)"
        );
        assert_eq!(
            response.headers().get("x-dispatcher-is-failover").unwrap(),
            "false"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"backend says hi");
    }

    #[tokio::test]
    async fn test_fim_without_fim_url_is_rejected() {
        let state = test_state();
        let llm = crate::registry::test_endpoint("a");
        state.registry.put_endpoint(llm).unwrap();
        state.registry.put_type_binding("a", "text", 0).unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fim")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"instruction": "hi", "type": "text"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_dispatcher_error() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/response")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("JSON load problem"));
    }

    #[tokio::test]
    async fn test_stream_route_requires_stream_url() {
        let state = test_state();
        let llm = crate::registry::test_endpoint("a");
        state.registry.put_endpoint(llm).unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"instruction": "hi", "llm_name": "a"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
