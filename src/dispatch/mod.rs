//! Request dispatch: resolution, invocation, failover, and fan-out

pub mod engine;
pub mod invoker;
pub mod request;
pub mod resolver;

pub use engine::{DispatchEngine, RequestContext};
pub use invoker::InvokeMode;
pub use request::{DispatchRequest, EngineResponse};
