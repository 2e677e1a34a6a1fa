//! Dispatch engine: detection, toxicity gating, failover, and fan-out
//!
//! Single-target dispatch is a sequential retry loop over a capability's
//! priority chain; fan-out invokes every bound endpoint concurrently and
//! aggregates results in completion order.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::auth::Identity;
use crate::config::Config;
use crate::dispatch::invoker::{InvokeError, InvokeMode, InvokeOutcome, Invoker};
use crate::dispatch::request::{
    DispatchRequest, EngineResponse, DETECT_TYPE, FAILED_MODELS_HEADER, FAILOVER_HEADER,
    MODEL_HEADER, TOXICITY_TYPE,
};
use crate::dispatch::resolver::{Candidates, Cursor, Resolver};
use crate::registry::{Endpoint, EndpointRegistry, ResolvedLlm};
use crate::utils::errors::DispatchError;
use crate::utils::text::{normalize_label, str_to_bool};

/// Fixed timeout for the detection and toxicity sub-requests.
const SUB_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DETECT_MAX_NEW_TOKENS: u32 = 512;
const DETECT_TEMPERATURE: f64 = 0.1;

/// Transport-layer request coordinates, carried for logging only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
}

pub struct DispatchEngine {
    registry: Arc<dyn EndpointRegistry>,
    resolver: Resolver,
    invoker: Invoker,
    toxicity_filter: bool,
    detect_types: Vec<String>,
}

impl DispatchEngine {
    pub fn new(registry: Arc<dyn EndpointRegistry>, config: &Config) -> Self {
        if !config.toxicity_filter {
            warn!("Toxicity filter is disabled! Counting only on model protections.");
        }
        DispatchEngine {
            resolver: Resolver::new(registry.clone()),
            invoker: Invoker::new(config.request_timeout),
            registry,
            toxicity_filter: config.toxicity_filter,
            detect_types: config.detect_types.clone(),
        }
    }

    /// Process one dispatch request end to end: toxicity gate, detection,
    /// resolution, then single-target failover or fan-out.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        identity: &Identity,
        ctx: &RequestContext,
        mode: InvokeMode,
    ) -> Result<EngineResponse, DispatchError> {
        if self.toxicity_filter && self.is_toxic(&request, identity, ctx).await? {
            return Err(DispatchError::ToxicBlocked);
        }

        let llm_name = request.llm_name.clone();
        let mut try_next = request.try_next_on_failure.unwrap_or(true);

        let capability = match request.capability() {
            Some(c) => c.to_string(),
            None if llm_name.is_some() => {
                // Name-only requests have no chain to fall back onto.
                try_next = false;
                String::new()
            }
            None => DETECT_TYPE.to_string(),
        };

        let capability = if capability == DETECT_TYPE {
            self.detect(&request, identity, ctx).await?
        } else {
            capability
        };

        match self
            .resolver
            .initial(llm_name.as_deref(), &capability, try_next)?
        {
            Candidates::Single { llm, cursor } => {
                self.dispatch_single(llm, cursor, &request, try_next, identity, ctx, mode)
                    .await
            }
            Candidates::FanOut(chain) => self.dispatch_fan_out(chain, &request, identity, ctx).await,
        }
    }

    /// Sequential failover loop: RESOLVE -> INVOKE -> (SUCCESS | RETRY | FAIL).
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_single(
        &self,
        llm: Endpoint,
        mut cursor: Cursor,
        request: &DispatchRequest,
        try_next: bool,
        identity: &Identity,
        ctx: &RequestContext,
        mode: InvokeMode,
    ) -> Result<EngineResponse, DispatchError> {
        let mut current = llm;
        let mut failed: Vec<String> = Vec::new();

        loop {
            match self.invoker.invoke(&current, request, mode).await {
                Ok(outcome) if outcome.status == 200 => {
                    self.log_attempt(&current, &outcome, identity, ctx);
                    let is_failover = !failed.is_empty();
                    return Ok(EngineResponse {
                        status: 200,
                        headers: vec![
                            ("content-type".to_string(), outcome.response_mime),
                            (MODEL_HEADER.to_string(), current.display_name()),
                            (FAILOVER_HEADER.to_string(), is_failover.to_string()),
                            (FAILED_MODELS_HEADER.to_string(), failed.join(",")),
                        ],
                        body: outcome.body,
                    });
                }
                Ok(outcome) => {
                    error!(
                        "Error calling {}: response code not successful: {}",
                        current.display_name(),
                        outcome.status
                    );
                    if !try_next {
                        return Err(DispatchError::NoFailover {
                            status: outcome.status,
                            detail: format!("Response code not successful: {}", outcome.status),
                        });
                    }
                }
                // Unsupported operations are never retried.
                Err(InvokeError::FimNotSupported) => return Err(DispatchError::FimNotSupported),
                Err(e) => {
                    error!("Error calling {}: {}", current.display_name(), e);
                    if !try_next {
                        return Err(DispatchError::NoFailover {
                            status: 500,
                            detail: e.to_string(),
                        });
                    }
                }
            }

            failed.push(current.display_name());
            current = self.resolver.advance(&mut cursor).map_err(|e| {
                error!(
                    "LLM request {} {} user={}: no next priority LLM for type {}",
                    ctx.method,
                    ctx.path,
                    identity.log_label(),
                    cursor.capability
                );
                e
            })?;
            debug!(
                "Failing over to {} (type {}, priority {})",
                current.name, cursor.capability, cursor.priority
            );
        }
    }

    /// Concurrent fan-out across a capability's endpoints. Partial failure is
    /// normal; the combined response is always 200.
    async fn dispatch_fan_out(
        &self,
        chain: Vec<ResolvedLlm>,
        request: &DispatchRequest,
        identity: &Identity,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, DispatchError> {
        debug!(
            "Fan-out requested, chosen LLMs: {}",
            chain
                .iter()
                .map(|r| r.endpoint.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let invoker = &self.invoker;
        let mut calls: FuturesUnordered<_> = chain
            .into_iter()
            .map(|resolved| {
                let llm = resolved.endpoint;
                let request = request.clone();
                async move {
                    let outcome = invoker.invoke(&llm, &request, InvokeMode::Completion).await;
                    (llm, outcome)
                }
            })
            .collect();

        let mut combined: Vec<Value> = Vec::new();
        let mut successful: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        // Aggregation happens in completion order, not submission order.
        while let Some((llm, outcome)) = calls.next().await {
            match outcome {
                Ok(outcome) if outcome.status == 200 => {
                    self.log_attempt(&llm, &outcome, identity, ctx);
                    let response: Value = serde_json::from_slice(&outcome.body)
                        .unwrap_or_else(|_| {
                            Value::String(String::from_utf8_lossy(&outcome.body).into_owned())
                        });
                    combined.push(json!({
                        "name": llm.display_name(),
                        "response": response,
                    }));
                    successful.push(llm.display_name());
                }
                Ok(outcome) => {
                    error!(
                        "Error calling {}: response code not successful: {}",
                        llm.display_name(),
                        outcome.status
                    );
                    failed.push(llm.display_name());
                }
                Err(e) => {
                    error!("Error calling {}: {}", llm.display_name(), e);
                    failed.push(llm.display_name());
                }
            }
        }

        let body = serde_json::to_vec(&combined)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
        Ok(EngineResponse {
            status: 200,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                (MODEL_HEADER.to_string(), successful.join(",")),
                (FAILOVER_HEADER.to_string(), "false".to_string()),
                (FAILED_MODELS_HEADER.to_string(), failed.join(",")),
            ],
            body,
        })
    }

    /// Classify the caller's instruction into a capability label via the
    /// `detect` chain. The label must be in the configured whitelist.
    async fn detect(
        &self,
        request: &DispatchRequest,
        identity: &Identity,
        ctx: &RequestContext,
    ) -> Result<String, DispatchError> {
        let resolved = self
            .registry
            .get_resolved_by_priority(DETECT_TYPE, 1)?
            .ok_or(DispatchError::Classification)?;
        debug!("Type not informed, detecting with {}", resolved.endpoint.name);

        let payload = json!({
            "instruction": request.instruction,
            "max_new_tokens": DETECT_MAX_NEW_TOKENS,
            "temperature": DETECT_TEMPERATURE,
            "timeout": SUB_REQUEST_TIMEOUT.as_secs(),
        });

        let outcome = self
            .invoker
            .invoke_raw(&resolved.endpoint, &payload, SUB_REQUEST_TIMEOUT)
            .await
            .map_err(|e| {
                error!("Error calling {}: {}", resolved.endpoint.display_name(), e);
                DispatchError::Classification
            })?;
        if outcome.status != 200 {
            error!(
                "Detection backend {} returned status {}",
                resolved.endpoint.display_name(),
                outcome.status
            );
            return Err(DispatchError::Classification);
        }
        self.log_attempt(&resolved.endpoint, &outcome, identity, ctx);

        let label = normalize_label(&String::from_utf8_lossy(&outcome.body));
        if !self.detect_types.iter().any(|t| t == &label) {
            warn!("Detected label '{}' is not a recognized type", label);
            return Err(DispatchError::Classification);
        }
        debug!("Type detected: {}", label);
        Ok(label)
    }

    /// Score the caller's instruction against the `toxicity` chain. A failed
    /// check is an error, never treated as "not toxic".
    async fn is_toxic(
        &self,
        request: &DispatchRequest,
        identity: &Identity,
        ctx: &RequestContext,
    ) -> Result<bool, DispatchError> {
        let resolved = self
            .registry
            .get_resolved_by_priority(TOXICITY_TYPE, 1)?
            .ok_or(DispatchError::ToxicityUnavailable)?;

        let payload = json!({ "sentence": request.instruction });
        let outcome = self
            .invoker
            .invoke_raw(&resolved.endpoint, &payload, SUB_REQUEST_TIMEOUT)
            .await
            .map_err(|e| {
                error!("Error calling {}: {}", resolved.endpoint.display_name(), e);
                DispatchError::ToxicityUnavailable
            })?;
        if outcome.status != 200 {
            error!(
                "Toxicity backend {} returned status {}",
                resolved.endpoint.display_name(),
                outcome.status
            );
            return Err(DispatchError::ToxicityUnavailable);
        }
        self.log_attempt(&resolved.endpoint, &outcome, identity, ctx);

        Ok(str_to_bool(&normalize_label(&String::from_utf8_lossy(
            &outcome.body,
        ))))
    }

    fn log_attempt(
        &self,
        llm: &Endpoint,
        outcome: &InvokeOutcome,
        identity: &Identity,
        ctx: &RequestContext,
    ) {
        info!(
            "LLM request {} {} llm={} user={} request_bytes={} response_bytes={} elapsed={:?}",
            ctx.method,
            ctx.path,
            llm.display_name(),
            identity.log_label(),
            outcome.request_bytes,
            outcome.body.len(),
            outcome.elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryImpl;
    use crate::registry::memory::MemoryRegistry;
    use std::path::PathBuf;

    fn test_config(toxicity: bool) -> Config {
        Config {
            port: 0,
            registry_impl: RegistryImpl::Memory,
            registry_file: None::<PathBuf>,
            toxicity_filter: toxicity,
            detect_types: vec!["text".to_string(), "code".to_string()],
            request_timeout: 30,
        }
    }

    fn identity() -> Identity {
        Identity {
            username: "tester".to_string(),
            application: None,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            method: "POST".to_string(),
            path: "/response".to_string(),
        }
    }

    fn endpoint(name: &str, url: String) -> crate::registry::Endpoint {
        let mut e = crate::registry::test_endpoint(name);
        e.url = url;
        e
    }

    fn request(instruction: &str) -> DispatchRequest {
        DispatchRequest {
            instruction: Some(instruction.to_string()),
            type_name: Some("text".to_string()),
            ..Default::default()
        }
    }

    fn header<'a>(response: &'a EngineResponse, name: &str) -> &'a str {
        response
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[tokio::test]
    async fn test_failover_reaches_last_healthy_endpoint() {
        let mut s1 = mockito::Server::new_async().await;
        let mut s2 = mockito::Server::new_async().await;
        let mut s3 = mockito::Server::new_async().await;
        s1.mock("POST", "/").with_status(500).create_async().await;
        s2.mock("POST", "/").with_status(502).create_async().await;
        s3.mock("POST", "/")
            .with_status(200)
            .with_body("answer")
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        for (name, url) in [("a", s1.url()), ("b", s2.url()), ("c", s3.url())] {
            registry.put_endpoint(endpoint(name, url)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }

        let engine = DispatchEngine::new(registry, &test_config(false));
        let response = engine
            .dispatch(request("hi"), &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"answer");
        assert_eq!(header(&response, MODEL_HEADER), "c(c-model)");
        assert_eq!(header(&response, FAILOVER_HEADER), "true");
        assert_eq!(
            header(&response, FAILED_MODELS_HEADER),
            "a(a-model),b(b-model)"
        );
    }

    #[tokio::test]
    async fn test_failover_exhaustion_returns_error() {
        let mut s1 = mockito::Server::new_async().await;
        let mut s2 = mockito::Server::new_async().await;
        s1.mock("POST", "/").with_status(500).create_async().await;
        s2.mock("POST", "/").with_status(500).create_async().await;

        let registry = Arc::new(MemoryRegistry::new());
        for (name, url) in [("a", s1.url()), ("b", s2.url())] {
            registry.put_endpoint(endpoint(name, url)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }

        let engine = DispatchEngine::new(registry, &test_config(false));
        let err = engine
            .dispatch(request("hi"), &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoEndpointAvailable));
    }

    #[tokio::test]
    async fn test_failover_disabled_returns_backend_status() {
        let mut s1 = mockito::Server::new_async().await;
        s1.mock("POST", "/").with_status(503).create_async().await;
        let mut s2 = mockito::Server::new_async().await;
        let healthy = s2
            .mock("POST", "/")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        for (name, url) in [("a", s1.url()), ("b", s2.url())] {
            registry.put_endpoint(endpoint(name, url)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }

        let engine = DispatchEngine::new(registry, &test_config(false));
        let mut req = request("hi");
        req.try_next_on_failure = Some(false);
        let err = engine
            .dispatch(req, &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap_err();

        match err {
            DispatchError::NoFailover { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {:?}", other),
        }
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn test_fan_out_aggregates_partial_failure() {
        let mut s1 = mockito::Server::new_async().await;
        let mut s2 = mockito::Server::new_async().await;
        let mut s3 = mockito::Server::new_async().await;
        s1.mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"text":"from a"}"#)
            .create_async()
            .await;
        s2.mock("POST", "/").with_status(500).create_async().await;
        s3.mock("POST", "/")
            .with_status(200)
            .with_body("plain c")
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        for (name, url) in [("a", s1.url()), ("b", s2.url()), ("c", s3.url())] {
            registry.put_endpoint(endpoint(name, url)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }

        let engine = DispatchEngine::new(registry, &test_config(false));
        let mut req = request("hi");
        req.llm_name = Some("all".to_string());
        let response = engine
            .dispatch(req, &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        let combined: Vec<Value> = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(combined.len(), 2);
        let mut names: Vec<&str> = combined
            .iter()
            .map(|entry| entry["name"].as_str().unwrap())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a(a-model)", "c(c-model)"]);

        let mut successful: Vec<&str> = header(&response, MODEL_HEADER).split(',').collect();
        successful.sort_unstable();
        assert_eq!(successful, vec!["a(a-model)", "c(c-model)"]);
        assert_eq!(header(&response, FAILED_MODELS_HEADER), "b(b-model)");
        assert_eq!(header(&response, FAILOVER_HEADER), "false");
    }

    #[tokio::test]
    async fn test_toxicity_short_circuit_blocks_dispatch() {
        let mut tox = mockito::Server::new_async().await;
        tox.mock("POST", "/")
            .with_status(200)
            .with_body("\"true\"")
            .create_async()
            .await;
        let mut backend = mockito::Server::new_async().await;
        let untouched = backend
            .mock("POST", "/")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        registry.put_endpoint(endpoint("guard", tox.url())).unwrap();
        registry.put_type_binding("guard", "toxicity", 0).unwrap();
        registry.put_endpoint(endpoint("a", backend.url())).unwrap();
        registry.put_type_binding("a", "text", 0).unwrap();

        let engine = DispatchEngine::new(registry, &test_config(true));
        let err = engine
            .dispatch(request("rude words"), &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ToxicBlocked));
        untouched.assert_async().await;
    }

    #[tokio::test]
    async fn test_toxicity_check_failure_is_an_error() {
        let mut tox = mockito::Server::new_async().await;
        tox.mock("POST", "/").with_status(500).create_async().await;

        let registry = Arc::new(MemoryRegistry::new());
        registry.put_endpoint(endpoint("guard", tox.url())).unwrap();
        registry.put_type_binding("guard", "toxicity", 0).unwrap();

        let engine = DispatchEngine::new(registry, &test_config(true));
        let err = engine
            .dispatch(request("hi"), &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ToxicityUnavailable));
    }

    #[tokio::test]
    async fn test_detect_routes_to_detected_type() {
        let mut detector = mockito::Server::new_async().await;
        detector
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(json!({
                "max_new_tokens": 512,
                "temperature": 0.1,
            })))
            .with_status(200)
            .with_body("\"Code\"\n")
            .create_async()
            .await;
        let mut backend = mockito::Server::new_async().await;
        backend
            .mock("POST", "/")
            .with_status(200)
            .with_body("generated")
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        registry
            .put_endpoint(endpoint("classifier", detector.url()))
            .unwrap();
        registry.put_type_binding("classifier", "detect", 0).unwrap();
        registry.put_endpoint(endpoint("coder", backend.url())).unwrap();
        registry.put_type_binding("coder", "code", 0).unwrap();

        let engine = DispatchEngine::new(registry, &test_config(false));
        let req = DispatchRequest {
            instruction: Some("write a function".to_string()),
            ..Default::default()
        };
        let response = engine
            .dispatch(req, &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap();
        assert_eq!(response.body, b"generated");
        assert_eq!(header(&response, MODEL_HEADER), "coder(coder-model)");
    }

    #[tokio::test]
    async fn test_detect_rejects_label_outside_whitelist() {
        let mut detector = mockito::Server::new_async().await;
        detector
            .mock("POST", "/")
            .with_status(200)
            .with_body("banana")
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        registry
            .put_endpoint(endpoint("classifier", detector.url()))
            .unwrap();
        registry.put_type_binding("classifier", "detect", 0).unwrap();

        let engine = DispatchEngine::new(registry, &test_config(false));
        let req = DispatchRequest {
            instruction: Some("hi".to_string()),
            ..Default::default()
        };
        let err = engine
            .dispatch(req, &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Classification));
    }

    #[tokio::test]
    async fn test_name_pinned_failure_restarts_chain() {
        let mut pinned = mockito::Server::new_async().await;
        pinned.mock("POST", "/").with_status(500).create_async().await;
        let mut fallback = mockito::Server::new_async().await;
        fallback
            .mock("POST", "/")
            .with_status(200)
            .with_body("from chain")
            .create_async()
            .await;

        let registry = Arc::new(MemoryRegistry::new());
        registry.put_endpoint(endpoint("pinned", pinned.url())).unwrap();
        registry
            .put_endpoint(endpoint("first", fallback.url()))
            .unwrap();
        registry.put_type_binding("first", "text", 0).unwrap();

        let engine = DispatchEngine::new(registry, &test_config(false));
        let mut req = request("hi");
        req.llm_name = Some("pinned".to_string());
        let response = engine
            .dispatch(req, &identity(), &ctx(), InvokeMode::Completion)
            .await
            .unwrap();

        assert_eq!(response.body, b"from chain");
        assert_eq!(header(&response, FAILOVER_HEADER), "true");
        assert_eq!(header(&response, FAILED_MODELS_HEADER), "pinned(pinned-model)");
    }
}
