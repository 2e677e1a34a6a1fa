//! In-memory registry implementation
//!
//! Process-local storage behind a read/write lock. Used for development and
//! as the backing registry in tests; contents are lost on restart.

use std::sync::RwLock;

use crate::registry::{
    Endpoint, EndpointPatch, EndpointRegistry, RegistryError, ResolvedLlm, Store,
};

pub struct MemoryRegistry {
    store: RwLock<Store>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry {
            store: RwLock::new(Store::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Store>, RegistryError> {
        self.store
            .read()
            .map_err(|e| RegistryError::Storage(format!("registry lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Store>, RegistryError> {
        self.store
            .write()
            .map_err(|e| RegistryError::Storage(format!("registry lock poisoned: {}", e)))
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry for MemoryRegistry {
    fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        self.write()?.put_endpoint(endpoint)
    }

    fn update_endpoint(&self, name: &str, patch: EndpointPatch) -> Result<(), RegistryError> {
        self.write()?.update_endpoint(name, patch)
    }

    fn delete_endpoint(&self, name: &str) -> Result<(), RegistryError> {
        self.write()?.delete_endpoint(name)
    }

    fn put_type_binding(
        &self,
        name: &str,
        type_name: &str,
        priority: u32,
    ) -> Result<(), RegistryError> {
        self.write()?.put_type_binding(name, type_name, priority)
    }

    fn delete_type_binding(&self, name: &str, type_name: &str) -> Result<(), RegistryError> {
        self.write()?.delete_type_binding(name, type_name)
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
