//! Streaming dispatch: websocket relay and chunked HTTP passthrough
//!
//! Streaming requests are never failed over; the resolved endpoint either
//! serves the whole stream or the stream errors out.

pub mod http;
pub mod relay;

pub use relay::StreamRelay;

use crate::registry::{Endpoint, EndpointRegistry};
use crate::utils::errors::DispatchError;

/// Which streaming surface an endpoint is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Websocket relay via `stream_url`.
    Socket,
    /// Chunked HTTP passthrough via `http_stream_url`.
    Http,
}

/// Resolve the single endpoint serving a streaming request: pinned by name,
/// or the priority-1 endpoint of the capability. The endpoint must declare
/// the URL matching `kind`.
pub fn resolve_stream_target(
    registry: &dyn EndpointRegistry,
    llm_name: Option<&str>,
    capability: Option<&str>,
    kind: StreamKind,
) -> Result<Endpoint, DispatchError> {
    let llm = match (llm_name, capability) {
        (Some(name), _) => registry
            .get_endpoint_by_name(name)?
            .ok_or(DispatchError::NoEndpointAvailable)?,
        (None, Some(capability)) => registry
            .get_resolved_by_priority(capability, 1)?
            .ok_or(DispatchError::NoEndpointAvailable)?
            .endpoint,
        (None, None) => {
            return Err(DispatchError::InvalidPayload(
                "llm_name or type is required for streaming".to_string(),
            ))
        }
    };

    let supported = match kind {
        StreamKind::Socket => llm.supports_socket_stream(),
        StreamKind::Http => llm.supports_http_stream(),
    };
    if !supported {
        return Err(DispatchError::StreamNotSupported(llm.display_name()));
    }
    Ok(llm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{memory::MemoryRegistry, test_endpoint};

    fn registry_with(name: &str, stream_url: &str, http_stream_url: &str) -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        let mut llm = test_endpoint(name);
        llm.stream_url = stream_url.to_string();
        llm.http_stream_url = http_stream_url.to_string();
        registry.put_endpoint(llm).unwrap();
        registry.put_type_binding(name, "text", 0).unwrap();
        registry
    }

    #[test]
    fn test_resolves_by_name_then_by_priority() {
        let registry = registry_with("a", "ws://a/stream", "");
        let by_name =
            resolve_stream_target(&registry, Some("a"), None, StreamKind::Socket).unwrap();
        assert_eq!(by_name.name, "a");
        let by_type =
            resolve_stream_target(&registry, None, Some("text"), StreamKind::Socket).unwrap();
        assert_eq!(by_type.name, "a");
    }

    #[test]
    fn test_missing_stream_url_is_not_supported() {
        let registry = registry_with("a", "", "http://a/stream");
        let err =
            resolve_stream_target(&registry, Some("a"), None, StreamKind::Socket).unwrap_err();
        assert!(matches!(err, DispatchError::StreamNotSupported(_)));
        // The same endpoint still serves the HTTP surface.
        assert!(resolve_stream_target(&registry, Some("a"), None, StreamKind::Http).is_ok());
    }

    #[test]
    fn test_requires_name_or_capability() {
        let registry = registry_with("a", "ws://a/stream", "");
        let err = resolve_stream_target(&registry, None, None, StreamKind::Socket).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
    }
}
