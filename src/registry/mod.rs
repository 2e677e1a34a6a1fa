//! Endpoint registry: endpoint definitions and per-capability priority chains
//!
//! The dispatch path only reads; administrative handlers mutate. Storage is
//! pluggable behind [`EndpointRegistry`] and selected at process start.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod file;
pub mod memory;

/// One backend model service record.
///
/// Address and template fields use the empty string for "not configured",
/// which keeps partial-update semantics uniform across storage backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub model: String,
    pub url: String,
    #[serde(default)]
    pub fim_url: String,
    #[serde(default)]
    pub stream_url: String,
    #[serde(default)]
    pub http_stream_url: String,
    pub username: String,
    pub password: String,
    pub response_mime: String,
    #[serde(default)]
    pub system_message: String,
    #[serde(default)]
    pub prompt_mask: String,
    #[serde(default)]
    pub is_external: bool,
    /// RFC3339 timestamp of the last create/update, for reporting only.
    #[serde(default)]
    pub updated_at: String,
}

impl Endpoint {
    /// Identity string used in response headers and logs: `name(model)`.
    pub fn display_name(&self) -> String {
        format!("{}({})", self.name, self.model)
    }

    pub fn supports_fim(&self) -> bool {
        !self.fim_url.is_empty()
    }

    pub fn supports_socket_stream(&self) -> bool {
        !self.stream_url.is_empty()
    }

    pub fn supports_http_stream(&self) -> bool {
        !self.http_stream_url.is_empty()
    }
}

/// Ranks an endpoint for one capability label. Priorities are unique within
/// a type; 1 is the first failover choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub priority: u32,
}

/// Join of an [`Endpoint`] with one [`TypeBinding`] sharing its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLlm {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(rename = "type")]
    pub type_name: String,
    pub priority: u32,
}

/// Endpoint view with credential fields removed, for listing APIs.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub name: String,
    pub model: String,
    pub url: String,
    pub fim_url: String,
    pub stream_url: String,
    pub http_stream_url: String,
    pub response_mime: String,
    pub system_message: String,
    pub prompt_mask: String,
    pub is_external: bool,
    pub updated_at: String,
}

impl From<Endpoint> for EndpointSummary {
    fn from(e: Endpoint) -> Self {
        EndpointSummary {
            name: e.name,
            model: e.model,
            url: e.url,
            fim_url: e.fim_url,
            stream_url: e.stream_url,
            http_stream_url: e.http_stream_url,
            response_mime: e.response_mime,
            system_message: e.system_message,
            prompt_mask: e.prompt_mask,
            is_external: e.is_external,
            updated_at: e.updated_at,
        }
    }
}

/// Resolved view with addresses, credentials, and templates removed, for the
/// capability catalog APIs.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSummary {
    pub name: String,
    pub model: String,
    pub response_mime: String,
    pub is_external: bool,
    #[serde(rename = "type")]
    pub type_name: String,
    pub priority: u32,
}

impl From<&ResolvedLlm> for ResolvedSummary {
    fn from(r: &ResolvedLlm) -> Self {
        ResolvedSummary {
            name: r.endpoint.name.clone(),
            model: r.endpoint.model.clone(),
            response_mime: r.endpoint.response_mime.clone(),
            is_external: r.endpoint.is_external,
            type_name: r.type_name.clone(),
            priority: r.priority,
        }
    }
}

/// Partial endpoint update. Only non-empty fields overwrite; credential
/// fields never overwrite with empty values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointPatch {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fim_url: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub http_stream_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub response_mime: Option<String>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub prompt_mask: Option<String>,
    #[serde(default)]
    pub is_external: Option<bool>,
}

/// Registry error types
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Missing required field: {0}")]
    MissingRequiredField(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry storage error: {0}")]
    Storage(String),
}

/// Uniform registry contract consumed by the dispatch core.
///
/// Operations are synchronous from the caller's point of view; the dispatch
/// engine re-reads current state on every request and never caches.
pub trait EndpointRegistry: Send + Sync {
    fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), RegistryError>;
    fn update_endpoint(&self, name: &str, patch: EndpointPatch) -> Result<(), RegistryError>;
    fn delete_endpoint(&self, name: &str) -> Result<(), RegistryError>;
    fn put_type_binding(&self, name: &str, type_name: &str, priority: u32)
        -> Result<(), RegistryError>;
    fn delete_type_binding(&self, name: &str, type_name: &str) -> Result<(), RegistryError>;
    fn get_endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>, RegistryError>;
    fn get_resolved_by_name(
        &self,
        name: &str,
        type_name: Option<&str>,
    ) -> Result<Option<ResolvedLlm>, RegistryError>;
    fn list_all_endpoints(&self) -> Result<Vec<Endpoint>, RegistryError>;
    fn list_all_resolved(&self) -> Result<Vec<ResolvedLlm>, RegistryError>;
    fn list_resolved_by_type(&self, type_name: &str) -> Result<Vec<ResolvedLlm>, RegistryError>;
    fn get_resolved_by_priority(
        &self,
        type_name: &str,
        priority: u32,
    ) -> Result<Option<ResolvedLlm>, RegistryError>;
}

/// Plain-data store shared by the in-memory and file-backed registries.
/// Each implementation wraps it in its own lock and persistence strategy.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Store {
    #[serde(default)]
    pub endpoints: HashMap<String, Endpoint>,
    /// Bindings grouped by capability label.
    #[serde(default)]
    pub bindings: HashMap<String, Vec<TypeBinding>>,
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(RegistryError::MissingRequiredField(field));
    }
    Ok(())
}

impl Store {
    pub fn put_endpoint(&mut self, mut endpoint: Endpoint) -> Result<(), RegistryError> {
        require_non_empty(&endpoint.name, "name")?;
        require_non_empty(&endpoint.model, "model")?;
        require_non_empty(&endpoint.url, "url")?;
        require_non_empty(&endpoint.username, "username")?;
        require_non_empty(&endpoint.password, "password")?;
        require_non_empty(&endpoint.response_mime, "response_mime")?;

        endpoint.updated_at = chrono::Utc::now().to_rfc3339();
        self.endpoints.insert(endpoint.name.clone(), endpoint);
        Ok(())
    }

    pub fn update_endpoint(&mut self, name: &str, patch: EndpointPatch) -> Result<(), RegistryError> {
        let endpoint = self
            .endpoints
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(format!("endpoint '{}'", name)))?;

        fn apply(target: &mut String, value: Option<String>) {
            if let Some(v) = value {
                if !v.is_empty() {
                    *target = v;
                }
            }
        }

        apply(&mut endpoint.model, patch.model);
        apply(&mut endpoint.url, patch.url);
        apply(&mut endpoint.fim_url, patch.fim_url);
        apply(&mut endpoint.stream_url, patch.stream_url);
        apply(&mut endpoint.http_stream_url, patch.http_stream_url);
        apply(&mut endpoint.username, patch.username);
        apply(&mut endpoint.password, patch.password);
        apply(&mut endpoint.response_mime, patch.response_mime);
        apply(&mut endpoint.system_message, patch.system_message);
        apply(&mut endpoint.prompt_mask, patch.prompt_mask);
        if let Some(is_external) = patch.is_external {
            endpoint.is_external = is_external;
        }
        endpoint.updated_at = chrono::Utc::now().to_rfc3339();
        Ok(())
    }

    pub fn delete_endpoint(&mut self, name: &str) -> Result<(), RegistryError> {
        self.endpoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(format!("endpoint '{}'", name)))
    }

    /// Insert a binding with insertion-shift semantics:
    /// - priority 0 appends after the current maximum
    /// - priority beyond max+1 is clamped to max+1
    /// - a colliding priority shifts that entry and all higher ones up by one
    ///
    /// Re-binding an already-bound name replaces its old entry after the
    /// shift, which can leave a gap. Gaps are never renumbered.
    pub fn put_type_binding(
        &mut self,
        name: &str,
        type_name: &str,
        priority: u32,
    ) -> Result<(), RegistryError> {
        require_non_empty(name, "name")?;
        require_non_empty(type_name, "type")?;

        let chain = self.bindings.entry(type_name.to_string()).or_default();
        let max = chain.iter().map(|b| b.priority).max().unwrap_or(0);

        let mut priority = priority;
        if priority == 0 || priority > max + 1 {
            priority = max + 1;
        }

        for binding in chain.iter_mut() {
            if binding.priority >= priority {
                binding.priority += 1;
            }
        }
        chain.retain(|b| b.name != name);
        chain.push(TypeBinding {
            name: name.to_string(),
            type_name: type_name.to_string(),
            priority,
        });
        chain.sort_by_key(|b| b.priority);
        Ok(())
    }

    /// Delete a binding. Remaining priorities are left untouched, so a chain
    /// can develop gaps (1,3 after deleting 2).
    pub fn delete_type_binding(&mut self, name: &str, type_name: &str) -> Result<(), RegistryError> {
        let chain = self
            .bindings
            .get_mut(type_name)
            .ok_or_else(|| RegistryError::NotFound(format!("type '{}'", type_name)))?;
        let before = chain.len();
        chain.retain(|b| b.name != name);
        if chain.len() == before {
            return Err(RegistryError::NotFound(format!(
                "binding '{}' for type '{}'",
                name, type_name
            )));
        }
        Ok(())
    }

    pub fn get_endpoint_by_name(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.get(name).cloned()
    }

    fn resolve(&self, binding: &TypeBinding) -> Option<ResolvedLlm> {
        self.endpoints.get(&binding.name).map(|endpoint| ResolvedLlm {
            endpoint: endpoint.clone(),
            type_name: binding.type_name.clone(),
            priority: binding.priority,
        })
    }

    pub fn get_resolved_by_name(&self, name: &str, type_name: Option<&str>) -> Option<ResolvedLlm> {
        match type_name {
            Some(type_name) => self
                .bindings
                .get(type_name)?
                .iter()
                .find(|b| b.name == name)
                .and_then(|b| self.resolve(b)),
            // Without a type, take the name's best-ranked binding of any type.
            None => self
                .bindings
                .values()
                .flatten()
                .filter(|b| b.name == name)
                .min_by_key(|b| b.priority)
                .and_then(|b| self.resolve(b)),
        }
    }

    pub fn list_all_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn list_all_resolved(&self) -> Vec<ResolvedLlm> {
        let mut resolved: Vec<_> = self
            .bindings
            .values()
            .flatten()
            .filter_map(|b| self.resolve(b))
            .collect();
        resolved.sort_by(|a, b| {
            a.type_name
                .cmp(&b.type_name)
                .then(a.priority.cmp(&b.priority))
        });
        resolved
    }

    pub fn list_resolved_by_type(&self, type_name: &str) -> Vec<ResolvedLlm> {
        let mut resolved: Vec<_> = self
            .bindings
            .get(type_name)
            .map(|chain| chain.iter().filter_map(|b| self.resolve(b)).collect())
            .unwrap_or_default();
        resolved.sort_by_key(|r| r.priority);
        resolved
    }

    pub fn get_resolved_by_priority(&self, type_name: &str, priority: u32) -> Option<ResolvedLlm> {
        self.bindings
            .get(type_name)?
            .iter()
            .find(|b| b.priority == priority)
            .and_then(|b| self.resolve(b))
    }
}

#[cfg(test)]
pub(crate) fn test_endpoint(name: &str) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        model: format!("{}-model", name),
        url: format!("http://{}.local/response", name),
        username: "dispatcher".to_string(),
        password: "secret".to_string(),
        response_mime: "application/json".to_string(),
        ..Default::default()
    }
}
