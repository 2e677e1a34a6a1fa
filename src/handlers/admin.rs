//! Administrative endpoints: LLM records, type bindings, and catalogs

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::auth::Identity;
use crate::registry::{Endpoint, EndpointPatch, EndpointSummary, ResolvedSummary};
use crate::utils::errors::DispatchError;
use crate::utils::text::str_to_bool;

#[derive(Debug, Deserialize)]
pub struct UpdateLlmBody {
    pub name: String,
    #[serde(flatten)]
    pub patch: EndpointPatch,
}

#[derive(Debug, Deserialize)]
pub struct BindLlmTypeBody {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// 0 (or absent) appends after the chain's current maximum.
    #[serde(default)]
    pub priority: u32,
}

/// Catalog filters. Values are parsed leniently ("yes", "true", "1").
#[derive(Debug, Default, Deserialize)]
pub struct CatalogQuery {
    pub socketio: Option<String>,
    pub stream: Option<String>,
}

pub async fn create_llm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(endpoint): Json<Endpoint>,
) -> Result<(StatusCode, Json<serde_json::Value>), DispatchError> {
    let name = endpoint.name.clone();
    state.registry.put_endpoint(endpoint)?;
    info!(
        "LLM '{}' created by {}",
        name,
        Identity::from_headers(&headers).log_label()
    );
    Ok((StatusCode::CREATED, Json(json!({"status": "created"}))))
}

pub async fn update_llm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateLlmBody>,
) -> Result<Json<serde_json::Value>, DispatchError> {
    state.registry.update_endpoint(&body.name, body.patch)?;
    info!(
        "LLM '{}' updated by {}",
        body.name,
        Identity::from_headers(&headers).log_label()
    );
    Ok(Json(json!({"status": "updated"})))
}

pub async fn delete_llm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, DispatchError> {
    state.registry.delete_endpoint(&name)?;
    info!(
        "LLM '{}' deleted by {}",
        name,
        Identity::from_headers(&headers).log_label()
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bind_llm_type(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BindLlmTypeBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), DispatchError> {
    state
        .registry
        .put_type_binding(&body.name, &body.type_name, body.priority)?;
    info!(
        "LLM '{}' bound to type '{}' by {}",
        body.name,
        body.type_name,
        Identity::from_headers(&headers).log_label()
    );
    Ok((StatusCode::CREATED, Json(json!({"status": "bound"}))))
}

pub async fn unbind_llm_type(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((type_name, name)): Path<(String, String)>,
) -> Result<StatusCode, DispatchError> {
    state.registry.delete_type_binding(&name, &type_name)?;
    info!(
        "LLM '{}' unbound from type '{}' by {}",
        name,
        type_name,
        Identity::from_headers(&headers).log_label()
    );
    Ok(StatusCode::ACCEPTED)
}

/// List all registered LLMs with credentials stripped.
pub async fn list_llms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EndpointSummary>>, DispatchError> {
    let summaries = state
        .registry
        .list_all_endpoints()?
        .into_iter()
        .map(EndpointSummary::from)
        .collect();
    Ok(Json(summaries))
}

pub async fn list_catalog(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<ResolvedSummary>>, DispatchError> {
    let resolved = state.registry.list_all_resolved()?;
    Ok(Json(filter_catalog(&resolved, &query)))
}

pub async fn list_catalog_by_type(
    State(state): State<Arc<AppState>>,
    Path(type_name): Path<String>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<ResolvedSummary>>, DispatchError> {
    let resolved = state.registry.list_resolved_by_type(&type_name)?;
    Ok(Json(filter_catalog(&resolved, &query)))
}

fn filter_catalog(
    resolved: &[crate::registry::ResolvedLlm],
    query: &CatalogQuery,
) -> Vec<ResolvedSummary> {
    let socketio_only = query.socketio.as_deref().map(str_to_bool).unwrap_or(false);
    let stream_only = query.stream.as_deref().map(str_to_bool).unwrap_or(false);
    resolved
        .iter()
        .filter(|r| !socketio_only || r.endpoint.supports_socket_stream())
        .filter(|r| !stream_only || r.endpoint.supports_http_stream())
        .map(ResolvedSummary::from)
        .collect()
}
