//! Isolated loading context
//!
//! A private namespace fed by a [`ModuleSource`]. Units are read lazily on
//! first reference, rewritten against the interface registry, verified and
//! defined once. Definitions live as long as the context; the host's
//! [`SharedNamespace`](crate::shared::SharedNamespace) is never consulted.

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use sideload_bytecode::{verify_unit, ModuleUnit, TypeRef};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, warn};

use crate::bridge::Bridge;
use crate::config::{ConfigError, ContextConfig, ContextOptions, OverloadPolicy};
use crate::error::LoadError;
use crate::namespace::{DefinedType, Namespace, NamespaceId, TypeHandle};
use crate::registry::InterfaceRegistry;
use crate::rewrite::{rewrite, LimitationKind, Rewritten};
use crate::source::{ModuleSource, SourceError};

/// Where a name is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not referenced yet, or last attempt was not found
    Unresolved,
    /// Bytes being read, decoded and linked to the super-unit
    Loading,
    /// Rewriter and verifier running
    Rewriting,
    /// Defined and cached
    Defined,
    /// Failed permanently
    Failed,
}

#[derive(Default)]
struct LoadTable {
    states: FxHashMap<String, UnitState>,
    failures: FxHashMap<String, LoadError>,
}

/// Private namespace over a module source
pub struct IsolatedContext {
    id: NamespaceId,
    this: Weak<IsolatedContext>,
    source: Box<dyn ModuleSource>,
    registry: InterfaceRegistry,
    options: ContextOptions,
    load_lock: ReentrantMutex<RefCell<LoadTable>>,
    defined: DashMap<String, TypeHandle>,
}

impl IsolatedContext {
    /// Create a context
    pub fn new(
        source: impl ModuleSource + 'static,
        registry: InterfaceRegistry,
        options: ContextOptions,
    ) -> Arc<Self> {
        let context = Arc::new_cyclic(|this| Self {
            id: NamespaceId::new(),
            this: this.clone(),
            source: Box::new(source),
            registry,
            options,
            load_lock: ReentrantMutex::new(RefCell::new(LoadTable::default())),
            defined: DashMap::new(),
        });
        debug!(namespace = %context.id, interfaces = context.registry.len(), "created context");
        context
    }

    /// Create a context from a parsed configuration
    pub fn from_config(
        source: impl ModuleSource + 'static,
        config: ContextConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        let (registry, options) = config.into_parts()?;
        Ok(Self::new(source, registry, options))
    }

    /// Namespace identity
    pub fn id(&self) -> NamespaceId {
        self.id
    }

    /// Interface registry the context rewrites against
    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    /// Options the context runs with
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Reflective bridge over this context
    pub fn bridge(&self) -> Bridge<'_> {
        Bridge::new(self)
    }

    /// Lifecycle state of a name
    pub fn state(&self, name: &str) -> UnitState {
        if self.defined.contains_key(name) {
            return UnitState::Defined;
        }
        let guard = self.load_lock.lock();
        let table = guard.borrow();
        table.states.get(name).copied().unwrap_or(UnitState::Unresolved)
    }

    /// Names defined so far, sorted
    pub fn defined_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defined.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a name to its defined type, loading it on first reference
    #[instrument(level = "debug", skip(self), fields(namespace = %self.id))]
    pub fn resolve(&self, name: &str) -> Result<TypeHandle, LoadError> {
        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }

        let guard = self.load_lock.lock();
        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }

        {
            let table = guard.borrow();
            if let Some(error) = table.failures.get(name) {
                return Err(error.clone());
            }
            if let Some(UnitState::Loading | UnitState::Rewriting) = table.states.get(name) {
                return Err(LoadError::rewrite_failed(name, "super-unit cycle"));
            }
        }

        debug!(unit = name, "loading");
        self.set_state(name, UnitState::Loading);
        let result = self.load(name);

        let mut table = guard.borrow_mut();
        match result {
            Ok(handle) => {
                table.states.insert(name.to_string(), UnitState::Defined);
                self.defined.insert(name.to_string(), handle.clone());
                debug!(unit = name, digest = handle.digest(), "defined");
                Ok(handle)
            }
            Err(error) if error.is_permanent() => {
                debug!(unit = name, %error, "failed");
                table.states.insert(name.to_string(), UnitState::Failed);
                table.failures.insert(name.to_string(), error.clone());
                Err(error)
            }
            Err(error) => {
                table.states.remove(name);
                Err(error)
            }
        }
    }

    fn cached(&self, name: &str) -> Option<TypeHandle> {
        self.defined.get(name).map(|entry| entry.value().clone())
    }

    fn set_state(&self, name: &str, state: UnitState) {
        self.load_lock
            .lock()
            .borrow_mut()
            .states
            .insert(name.to_string(), state);
    }

    fn load(&self, name: &str) -> Result<TypeHandle, LoadError> {
        let bytes = match self.source.read(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(SourceError::InvalidName(_)) => {
                return Err(LoadError::NotFound(name.to_string()))
            }
            Err(e) => {
                return Err(LoadError::Source {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let unit = ModuleUnit::decode(&bytes).map_err(|e| LoadError::rewrite_failed(name, e))?;
        if unit.name != name {
            return Err(LoadError::rewrite_failed(
                name,
                format!("source returned unit {}", unit.name),
            ));
        }

        let super_type = match &unit.super_unit {
            Some(parent) => Some(self.resolve(parent).map_err(|e| {
                LoadError::rewrite_failed(name, format!("super-unit {}: {}", parent, e))
            })?),
            None => None,
        };

        self.set_state(name, UnitState::Rewriting);
        let Rewritten { unit, report } =
            rewrite(unit, &self.registry).map_err(|e| LoadError::rewrite_failed(name, e))?;

        if let Some(collision) = report.ambiguous.first() {
            match self.options.ambiguous_overloads {
                OverloadPolicy::Error => {
                    return Err(LoadError::AmbiguousOverload {
                        unit: name.to_string(),
                        operation: collision.operation.clone(),
                        signature: collision.signature.clone(),
                    })
                }
                OverloadPolicy::Warn => {
                    for collision in &report.ambiguous {
                        warn!(
                            unit = name,
                            operation = %collision.operation,
                            signature = %collision.signature,
                            "synthesized overload collides with authored entry point; keeping authored"
                        );
                    }
                }
            }
        }
        for limitation in &report.limitations {
            match limitation.kind {
                LimitationKind::Unrewritable => warn!(
                    unit = name,
                    operation = %limitation.operation,
                    signature = %limitation.signature,
                    "mapped type nested too deep; entry point left as authored"
                ),
                LimitationKind::StaticUnadapted => debug!(
                    unit = name,
                    operation = %limitation.operation,
                    "static entry point not adapted"
                ),
            }
        }

        if self.options.verify {
            verify_unit(&unit).map_err(|e| LoadError::rewrite_failed(name, e))?;
        }

        self.check_conformance(&unit, super_type.as_ref())?;

        let digest = hex::encode(Sha256::digest(unit.encode()));
        let origin: Weak<dyn Namespace> = self.this.clone();
        Ok(TypeHandle::new(DefinedType::new(
            self.id, origin, unit, super_type, report, digest,
        )))
    }

    /// Every declared interface known to the registry must be implemented
    fn check_conformance(&self, unit: &ModuleUnit, super_type: Option<&TypeHandle>) -> Result<(), LoadError> {
        for capability in &unit.capabilities {
            let Some(interface) = self.registry.interface(capability) else {
                continue;
            };

            for op in &interface.operations {
                let implemented = std::iter::once(unit)
                    .chain(super_type.into_iter().flat_map(|t| t.ancestry().map(TypeHandle::unit)))
                    .flat_map(|u| u.entry_points_named(&op.name))
                    .filter(|e| !e.is_static() && !e.is_constructor())
                    .any(|e| {
                        e.signature.params == op.signature.params
                            && self.returns_conform(&e.signature.ret, &op.signature.ret)
                    });

                if !implemented {
                    return Err(LoadError::rewrite_failed(
                        &unit.name,
                        format!(
                            "{} does not implement {}: missing {}{}",
                            unit.name, interface.name, op.name, op.signature
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn returns_conform(&self, actual: &TypeRef, required: &TypeRef) -> bool {
        if actual == required || *required == TypeRef::Any {
            return true;
        }
        match (actual.as_named(), required.as_named()) {
            (Some(concrete), Some(interface)) => {
                self.registry.interface_name_for(concrete) == Some(interface)
            }
            _ => false,
        }
    }
}

impl Namespace for IsolatedContext {
    fn id(&self) -> NamespaceId {
        self.id
    }

    fn resolve(&self, name: &str) -> Result<TypeHandle, LoadError> {
        IsolatedContext::resolve(self, name)
    }

    fn max_call_depth(&self) -> usize {
        self.options.max_call_depth
    }
}
