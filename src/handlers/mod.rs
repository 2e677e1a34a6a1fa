//! HTTP request handlers

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::dispatch::DispatchEngine;
use crate::registry::EndpointRegistry;
use crate::stream::StreamRelay;

pub mod admin;
pub mod dispatch;
pub mod health;
pub mod ws;

/// Shared state handed to every handler.
pub struct AppState {
    pub registry: Arc<dyn EndpointRegistry>,
    pub engine: DispatchEngine,
    pub relay: Arc<StreamRelay>,
    /// Default backend timeout for streaming dispatch.
    pub request_timeout: Duration,
}

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/llm",
            get(admin::list_llms)
                .post(admin::create_llm)
                .patch(admin::update_llm),
        )
        .route("/v1/llm/:name", delete(admin::delete_llm))
        .route(
            "/v1/llm_type",
            post(admin::bind_llm_type).put(admin::bind_llm_type),
        )
        .route(
            "/v1/llm_type/:type_name/:name",
            delete(admin::unbind_llm_type),
        )
        .route("/v1/llms_and_types", get(admin::list_catalog))
        .route("/v1/llms_and_types/:type_name", get(admin::list_catalog_by_type))
        .route(
            "/response",
            get(dispatch::response_handler).post(dispatch::response_handler),
        )
        .route("/fim", get(dispatch::fim_handler).post(dispatch::fim_handler))
        .route(
            "/stream",
            get(dispatch::stream_handler).post(dispatch::stream_handler),
        )
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz_handler))
        .route("/readyz", get(health::readyz_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    use crate::config::{Config, RegistryImpl};
    use crate::registry::memory::MemoryRegistry;

    let registry: Arc<dyn EndpointRegistry> = Arc::new(MemoryRegistry::new());
    let config = Config {
        port: 0,
        registry_impl: RegistryImpl::Memory,
        registry_file: None,
        toxicity_filter: false,
        detect_types: vec!["text".to_string()],
        request_timeout: 5,
    };
    Arc::new(AppState {
        engine: DispatchEngine::new(registry.clone(), &config),
        relay: Arc::new(StreamRelay::new(registry.clone())),
        registry,
        request_timeout: Duration::from_secs(config.request_timeout),
    })
}
