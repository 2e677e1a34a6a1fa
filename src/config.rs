//! Configuration management for the dispatcher service

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Which registry storage backend to run with. Chosen once at startup; the
/// dispatch core never branches on the active implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryImpl {
    Memory,
    File,
}

impl std::str::FromStr for RegistryImpl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RegistryImpl::Memory),
            "file" => Ok(RegistryImpl::File),
            other => bail!("Unknown registry implementation: {}", other),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub registry_impl: RegistryImpl,
    pub registry_file: Option<PathBuf>,
    /// Process-wide toxicity gate switch.
    pub toxicity_filter: bool,
    /// Whitelist of capability labels the detect flow may produce.
    pub detect_types: Vec<String>,
    /// Default per-call backend timeout in seconds, overridable per request.
    pub request_timeout: u64,
}

impl Config {
    pub fn new(
        port: u16,
        registry_impl: RegistryImpl,
        registry_file: Option<PathBuf>,
        toxicity_filter: bool,
        detect_types: &str,
        request_timeout: u64,
    ) -> Result<Self> {
        if registry_impl == RegistryImpl::File && registry_file.is_none() {
            bail!("--registry-file is required when --registry-impl is 'file'");
        }

        let detect_types: Vec<String> = detect_types
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if detect_types.is_empty() {
            bail!("Detect type whitelist must not be empty");
        }

        Ok(Config {
            port,
            registry_impl,
            registry_file,
            toxicity_filter,
            detect_types,
            request_timeout,
        })
    }
}
