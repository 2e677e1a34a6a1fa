//! LLM Dispatcher Library
//! Capability-routing dispatcher for backend LLM services: priority chains,
//! automatic failover, fan-out, and streaming relay.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod stream;
pub mod utils;
