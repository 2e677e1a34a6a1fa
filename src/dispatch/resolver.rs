//! Endpoint resolution: turns a dispatch request into candidates
//!
//! Resolution reads the registry on every call; endpoint and priority
//! changes take effect on the next request.

use std::sync::Arc;

use crate::dispatch::request::ALL_ENDPOINTS;
use crate::registry::{Endpoint, EndpointRegistry, ResolvedLlm};
use crate::utils::errors::DispatchError;

/// Where the sequential failover loop currently stands.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub capability: String,
    pub priority: u32,
    /// True while the attempt is pinned to an explicitly named endpoint.
    /// The first advance drops the pin and restarts the chain at priority 1.
    pub pinned: bool,
}

/// Outcome of initial resolution.
#[derive(Debug)]
pub enum Candidates {
    /// One endpoint plus the cursor from which failover continues.
    Single { llm: Endpoint, cursor: Cursor },
    /// Fan-out across every endpoint bound to the capability. No sequential
    /// retry applies in this mode.
    FanOut(Vec<ResolvedLlm>),
}

pub struct Resolver {
    registry: Arc<dyn EndpointRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<dyn EndpointRegistry>) -> Self {
        Resolver { registry }
    }

    /// Resolve the first candidate(s) for a request. `capability` is the
    /// effective type after any detection has already run.
    pub fn initial(
        &self,
        llm_name: Option<&str>,
        capability: &str,
        try_next_on_failure: bool,
    ) -> Result<Candidates, DispatchError> {
        match llm_name {
            Some(ALL_ENDPOINTS) => {
                let chain = self.registry.list_resolved_by_type(capability)?;
                if chain.is_empty() {
                    return Err(DispatchError::NoEndpointAvailable);
                }
                Ok(Candidates::FanOut(chain))
            }
            Some(name) => {
                if let Some(llm) = self.registry.get_endpoint_by_name(name)? {
                    return Ok(Candidates::Single {
                        llm,
                        cursor: Cursor {
                            capability: capability.to_string(),
                            priority: 1,
                            pinned: true,
                        },
                    });
                }
                if !try_next_on_failure {
                    return Err(DispatchError::NoEndpointAvailable);
                }
                // Unknown name with failover enabled falls back to the
                // capability's priority chain.
                self.first_of_chain(capability)
            }
            None => self.first_of_chain(capability),
        }
    }

    fn first_of_chain(&self, capability: &str) -> Result<Candidates, DispatchError> {
        let resolved = self
            .registry
            .get_resolved_by_priority(capability, 1)?
            .ok_or(DispatchError::NoEndpointAvailable)?;
        Ok(Candidates::Single {
            llm: resolved.endpoint,
            cursor: Cursor {
                capability: capability.to_string(),
                priority: 1,
                pinned: false,
            },
        })
    }

    /// Advance the cursor after a failed attempt and resolve the next
    /// endpoint. Resolution failure here is terminal for the request.
    pub fn advance(&self, cursor: &mut Cursor) -> Result<Endpoint, DispatchError> {
        if cursor.pinned {
            cursor.pinned = false;
            cursor.priority = 1;
        } else {
            cursor.priority += 1;
        }

        self.registry
            .get_resolved_by_priority(&cursor.capability, cursor.priority)?
            .map(|r| r.endpoint)
            .ok_or(DispatchError::NoEndpointAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{memory::MemoryRegistry, test_endpoint};

    fn resolver_with_chain(names: &[&str]) -> Resolver {
        let registry = MemoryRegistry::new();
        for name in names {
            registry.put_endpoint(test_endpoint(name)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }
        Resolver::new(Arc::new(registry))
    }

    #[test]
    fn test_unnamed_request_resolves_priority_one() {
        let resolver = resolver_with_chain(&["a", "b"]);
        match resolver.initial(None, "text", true).unwrap() {
            Candidates::Single { llm, cursor } => {
                assert_eq!(llm.name, "a");
                assert_eq!(cursor.priority, 1);
                assert!(!cursor.pinned);
            }
            Candidates::FanOut(_) => panic!("expected single candidate"),
        }
    }

    #[test]
    fn test_named_request_is_pinned() {
        let resolver = resolver_with_chain(&["a", "b"]);
        match resolver.initial(Some("b"), "text", true).unwrap() {
            Candidates::Single { llm, cursor } => {
                assert_eq!(llm.name, "b");
                assert!(cursor.pinned);
            }
            Candidates::FanOut(_) => panic!("expected single candidate"),
        }
    }

    #[test]
    fn test_unknown_name_falls_back_to_chain() {
        let resolver = resolver_with_chain(&["a"]);
        match resolver.initial(Some("ghost"), "text", true).unwrap() {
            Candidates::Single { llm, cursor } => {
                assert_eq!(llm.name, "a");
                assert!(!cursor.pinned);
            }
            Candidates::FanOut(_) => panic!("expected single candidate"),
        }
    }

    #[test]
    fn test_unknown_name_without_failover_fails() {
        let resolver = resolver_with_chain(&["a"]);
        let err = resolver.initial(Some("ghost"), "text", false).unwrap_err();
        assert!(matches!(err, DispatchError::NoEndpointAvailable));
    }

    #[test]
    fn test_all_returns_fan_out_in_priority_order() {
        let resolver = resolver_with_chain(&["a", "b", "c"]);
        match resolver.initial(Some("all"), "text", true).unwrap() {
            Candidates::FanOut(chain) => {
                let names: Vec<_> = chain.iter().map(|r| r.endpoint.name.as_str()).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            Candidates::Single { .. } => panic!("expected fan-out"),
        }
    }

    #[test]
    fn test_all_with_empty_chain_fails() {
        let resolver = resolver_with_chain(&[]);
        let err = resolver.initial(Some("all"), "text", true).unwrap_err();
        assert!(matches!(err, DispatchError::NoEndpointAvailable));
    }

    #[test]
    fn test_advance_walks_the_chain() {
        let resolver = resolver_with_chain(&["a", "b", "c"]);
        let mut cursor = Cursor {
            capability: "text".to_string(),
            priority: 1,
            pinned: false,
        };
        assert_eq!(resolver.advance(&mut cursor).unwrap().name, "b");
        assert_eq!(resolver.advance(&mut cursor).unwrap().name, "c");
        let err = resolver.advance(&mut cursor).unwrap_err();
        assert!(matches!(err, DispatchError::NoEndpointAvailable));
    }

    #[test]
    fn test_advance_from_pin_restarts_at_priority_one() {
        let resolver = resolver_with_chain(&["a", "b"]);
        let mut cursor = Cursor {
            capability: "text".to_string(),
            priority: 1,
            pinned: true,
        };
        let next = resolver.advance(&mut cursor).unwrap();
        assert_eq!(next.name, "a");
        assert_eq!(cursor.priority, 1);
        assert!(!cursor.pinned);
    }

    #[test]
    fn test_advance_skips_priority_gap() {
        let registry = MemoryRegistry::new();
        for name in ["a", "b", "c"] {
            registry.put_endpoint(test_endpoint(name)).unwrap();
            registry.put_type_binding(name, "text", 0).unwrap();
        }
        registry.delete_type_binding("b", "text").unwrap();
        let resolver = Resolver::new(Arc::new(registry));

        let mut cursor = Cursor {
            capability: "text".to_string(),
            priority: 1,
            pinned: false,
        };
        // Priority 2 was deleted; the gap is not bridged and the chain ends.
        let err = resolver.advance(&mut cursor).unwrap_err();
        assert!(matches!(err, DispatchError::NoEndpointAvailable));
    }
}
