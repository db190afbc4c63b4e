//! Host namespace
//!
//! Units defined here are taken as-is: no rewriting and no module source.
//! Callers push encoded units in dependency order with [`SharedNamespace::define`].

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use sideload_bytecode::{verify_unit, ModuleUnit};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::error::LoadError;
use crate::namespace::{DefinedType, Namespace, NamespaceId, TypeHandle};
use crate::rewrite::RewriteReport;

static HOST: Lazy<Arc<SharedNamespace>> = Lazy::new(SharedNamespace::new);

/// Namespace of directly defined units
pub struct SharedNamespace {
    id: NamespaceId,
    this: Weak<SharedNamespace>,
    types: RwLock<FxHashMap<String, TypeHandle>>,
}

impl SharedNamespace {
    /// Create an empty namespace
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: NamespaceId::new(),
            this: this.clone(),
            types: RwLock::new(FxHashMap::default()),
        })
    }

    /// Process-wide host namespace
    pub fn host() -> Arc<Self> {
        HOST.clone()
    }

    /// Define an encoded unit
    ///
    /// The super-unit must already be defined here. Defining a name twice
    /// returns the first definition.
    pub fn define(&self, bytes: &[u8]) -> Result<TypeHandle, LoadError> {
        let unit = ModuleUnit::decode(bytes).map_err(|e| LoadError::rewrite_failed("<shared>", e))?;
        let name = unit.name.clone();
        verify_unit(&unit).map_err(|e| LoadError::rewrite_failed(&name, e))?;

        let mut types = self.types.write();
        if let Some(existing) = types.get(&name) {
            return Ok(existing.clone());
        }

        let super_type = match &unit.super_unit {
            Some(parent) => Some(types.get(parent).cloned().ok_or_else(|| {
                LoadError::rewrite_failed(&name, format!("super-unit {} is not defined", parent))
            })?),
            None => None,
        };

        let digest = hex::encode(Sha256::digest(bytes));
        let report = RewriteReport {
            unit: name.clone(),
            ..Default::default()
        };
        let origin: Weak<dyn Namespace> = self.this.clone();
        let handle = TypeHandle::new(DefinedType::new(
            self.id, origin, unit, super_type, report, digest,
        ));

        debug!(unit = %name, namespace = %self.id, "defined shared unit");
        types.insert(name, handle.clone());
        Ok(handle)
    }

    /// Look up a defined type
    pub fn get(&self, name: &str) -> Option<TypeHandle> {
        self.types.read().get(name).cloned()
    }

    /// Number of defined types
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Whether nothing is defined
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl Namespace for SharedNamespace {
    fn id(&self) -> NamespaceId {
        self.id
    }

    fn resolve(&self, name: &str) -> Result<TypeHandle, LoadError> {
        self.get(name).ok_or_else(|| LoadError::NotFound(name.to_string()))
    }
}
