//! TOML-file-backed registry implementation
//!
//! Loads the whole store into memory at startup and rewrites the document on
//! every mutation (temp file + rename, so a crash mid-write never truncates
//! the store). Reads are served from memory.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::info;

use crate::registry::{
    Endpoint, EndpointPatch, EndpointRegistry, RegistryError, ResolvedLlm, Store, TypeBinding,
};

/// On-disk document shape: flat endpoint and binding tables.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StoreDocument {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    bindings: Vec<TypeBinding>,
}

impl From<&Store> for StoreDocument {
    fn from(store: &Store) -> Self {
        let mut doc = StoreDocument {
            endpoints: store.list_all_endpoints(),
            bindings: store.bindings.values().flatten().cloned().collect(),
        };
        doc.bindings
            .sort_by(|a, b| a.type_name.cmp(&b.type_name).then(a.priority.cmp(&b.priority)));
        doc
    }
}

impl From<StoreDocument> for Store {
    fn from(doc: StoreDocument) -> Self {
        let mut store = Store::default();
        for endpoint in doc.endpoints {
            store.endpoints.insert(endpoint.name.clone(), endpoint);
        }
        for binding in doc.bindings {
            store
                .bindings
                .entry(binding.type_name.clone())
                .or_default()
                .push(binding);
        }
        for chain in store.bindings.values_mut() {
            chain.sort_by_key(|b| b.priority);
        }
        store
    }
}

pub struct FileRegistry {
    path: PathBuf,
    store: RwLock<Store>,
}

impl FileRegistry {
    /// Open a file-backed registry, creating an empty store if the file does
    /// not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read registry file: {:?}", path))?;
            let doc: StoreDocument = toml::from_str(&content)
                .with_context(|| format!("Failed to parse registry file: {:?}", path))?;
            Store::from(doc)
        } else {
            info!("Registry file {:?} not found, starting empty", path);
            Store::default()
        };

        info!(
            "Loaded registry from {:?}: {} endpoints, {} types",
            path,
            store.endpoints.len(),
            store.bindings.len()
        );

        Ok(FileRegistry {
            path,
            store: RwLock::new(store),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Store>, RegistryError> {
        self.store
            .read()
            .map_err(|e| RegistryError::Storage(format!("registry lock poisoned: {}", e)))
    }

    /// Apply a mutation and persist the resulting store. The write lock is
    /// held across the file rewrite so concurrent admin calls serialize.
    fn mutate<F>(&self, op: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Store) -> Result<(), RegistryError>,
    {
        let mut store = self
            .store
            .write()
            .map_err(|e| RegistryError::Storage(format!("registry lock poisoned: {}", e)))?;
        op(&mut store)?;
        self.persist(&store)
    }

    fn persist(&self, store: &Store) -> Result<(), RegistryError> {
        let doc = StoreDocument::from(store);
        let content = toml::to_string_pretty(&doc)
            .map_err(|e| RegistryError::Storage(format!("failed to serialize registry: {}", e)))?;

        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| RegistryError::Storage(format!("failed to write {:?}: {}", tmp, e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            RegistryError::Storage(format!("failed to replace {:?}: {}", self.path, e))
        })?;
        Ok(())
    }
}

impl EndpointRegistry for FileRegistry {
    fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        self.mutate(|store| store.put_endpoint(endpoint))
    }

    fn update_endpoint(&self, name: &str, patch: EndpointPatch) -> Result<(), RegistryError> {
        self.mutate(|store| store.update_endpoint(name, patch))
    }

    fn delete_endpoint(&self, name: &str) -> Result<(), RegistryError> {
        self.mutate(|store| store.delete_endpoint(name))
    }

    fn put_type_binding(
        &self,
        name: &str,
        type_name: &str,
        priority: u32,
    ) -> Result<(), RegistryError> {
        self.mutate(|store| store.put_type_binding(name, type_name, priority))
    }

    fn delete_type_binding(&self, name: &str, type_name: &str) -> Result<(), RegistryError> {
        self.mutate(|store| store.delete_type_binding(name, type_name))
    }

    fn get_endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>, RegistryError> {
        Ok(self.read()?.get_endpoint_by_name(name))
    }

    fn get_resolved_by_name(
        &self,
        name: &str,
        type_name: Option<&str>,
    ) -> Result<Option<ResolvedLlm>, RegistryError> {
        Ok(self.read()?.get_resolved_by_name(name, type_name))
    }

    fn list_all_endpoints(&self) -> Result<Vec<Endpoint>, RegistryError> {
        Ok(self.read()?.list_all_endpoints())
    }

    fn list_all_resolved(&self) -> Result<Vec<ResolvedLlm>, RegistryError> {
        Ok(self.read()?.list_all_resolved())
    }

    fn list_resolved_by_type(&self, type_name: &str) -> Result<Vec<ResolvedLlm>, RegistryError> {
        Ok(self.read()?.list_resolved_by_type(type_name))
    }

    fn get_resolved_by_priority(
        &self,
        type_name: &str,
        priority: u32,
    ) -> Result<Option<ResolvedLlm>, RegistryError> {
        Ok(self.read()?.get_resolved_by_priority(type_name, priority))
    }
}
