//! Backend invoker: performs one call to one endpoint
//!
//! Applies prompt templating, default system message, and fill-in-middle
//! routing, then sends the payload with the endpoint's stored credentials.
//! Retry is the dispatch engine's responsibility, never the invoker's.

use lazy_static::lazy_static;
use reqwest::Client;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::dispatch::request::DispatchRequest;
use crate::registry::Endpoint;

/// Substitution marker replaced by the caller's instruction inside an
/// endpoint's `prompt_mask`.
pub const PROMPT_MARKER: &str = "%PROMPT%";

lazy_static! {
    static ref HTTP_CLIENT: Client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create HTTP client");
}

/// Invocation mode for one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeMode {
    /// Ordinary completion against the endpoint's `url`, with templating.
    Completion,
    /// Fill-in-middle against `fim_url`, no templating.
    Fim,
}

/// Raw result of one backend call, with metadata for logging.
#[derive(Debug)]
pub struct InvokeOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    pub response_mime: String,
    pub request_bytes: usize,
    pub elapsed: Duration,
}

#[derive(Error, Debug)]
pub enum InvokeError {
    /// The endpoint declares no `fim_url`. Never retried.
    #[error("Fill in the middle is not supported by this LLM")]
    FimNotSupported,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Performs single backend calls with the endpoint's credentials.
pub struct Invoker {
    default_timeout: Duration,
}

impl Invoker {
    pub fn new(default_timeout_secs: u64) -> Self {
        Invoker {
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    /// Call one endpoint with the caller's payload.
    pub async fn invoke(
        &self,
        llm: &Endpoint,
        request: &DispatchRequest,
        mode: InvokeMode,
    ) -> Result<InvokeOutcome, InvokeError> {
        let (address, payload) = match mode {
            InvokeMode::Fim => {
                if !llm.supports_fim() {
                    return Err(InvokeError::FimNotSupported);
                }
                // FIM payloads go through untouched.
                (llm.fim_url.as_str(), request.clone())
            }
            InvokeMode::Completion => (llm.url.as_str(), apply_templates(llm, request)),
        };

        let timeout = request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let body = serde_json::to_vec(&payload)?;
        self.send(llm, address, body, timeout).await
    }

    /// Call an endpoint with an arbitrary JSON payload, bypassing templating.
    /// Used for the detection and toxicity sub-requests.
    pub async fn invoke_raw(
        &self,
        llm: &Endpoint,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<InvokeOutcome, InvokeError> {
        let body = serde_json::to_vec(payload)?;
        self.send(llm, &llm.url, body, timeout).await
    }

    async fn send(
        &self,
        llm: &Endpoint,
        address: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<InvokeOutcome, InvokeError> {
        let request_bytes = body.len();
        let started = Instant::now();

        let response = HTTP_CLIENT
            .post(address)
            .basic_auth(&llm.username, Some(&llm.password))
            .header("content-type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        Ok(InvokeOutcome {
            status,
            body: bytes.to_vec(),
            response_mime: llm.response_mime.clone(),
            request_bytes,
            elapsed: started.elapsed(),
        })
    }
}

/// Apply the endpoint's templating to the outgoing payload: substitute the
/// instruction into `prompt_mask` when one is declared, and inject the
/// default `system_message` when the caller supplied none.
fn apply_templates(llm: &Endpoint, request: &DispatchRequest) -> DispatchRequest {
    let mut payload = request.clone();

    if !llm.prompt_mask.is_empty() {
        if let Some(instruction) = &payload.instruction {
            payload.instruction = Some(llm.prompt_mask.replace(PROMPT_MARKER, instruction));
        }
    }

    if !llm.system_message.is_empty() && payload.system_msg.is_none() {
        payload.system_msg = Some(llm.system_message.clone());
    }

    payload
}
