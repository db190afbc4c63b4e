//! Capability interfaces and the concrete-name mapping
//!
//! The registry is pure data supplied by the caller: which capability
//! interfaces exist (with their required operations) and which concrete unit
//! names map onto them. A concrete name maps to exactly one interface; an
//! interface may be the target of several concrete names.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sideload_bytecode::{DescriptorError, Signature, TypeRef};
use thiserror::Error;

/// Registry construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Concrete name already has an interface
    #[error("{concrete} is already mapped to {existing}")]
    AlreadyMapped {
        /// Concrete unit name
        concrete: String,
        /// Interface it is mapped to
        existing: String,
    },

    /// Mapping targets an interface that was never declared
    #[error("Unknown capability interface: {0}")]
    UnknownInterface(String),

    /// Interface declared twice
    #[error("Capability interface declared twice: {0}")]
    DuplicateInterface(String),
}

/// One operation a capability interface requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSig {
    /// Operation name
    pub name: String,
    /// Parameter and return types
    pub signature: Signature,
}

impl OperationSig {
    /// Create an operation from a signature descriptor
    pub fn parse(name: impl Into<String>, signature: &str) -> Result<Self, DescriptorError> {
        Ok(Self {
            name: name.into(),
            signature: Signature::parse(signature)?,
        })
    }
}

/// An abstract interface known to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInterface {
    /// Fully qualified name
    pub name: String,
    /// Required operations
    #[serde(default)]
    pub operations: Vec<OperationSig>,
}

impl CapabilityInterface {
    /// Create an interface with no operations
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
        }
    }

    /// Add a required operation
    pub fn with_operation(mut self, name: &str, signature: &str) -> Result<Self, DescriptorError> {
        self.operations.push(OperationSig::parse(name, signature)?);
        Ok(self)
    }

    /// Operations with the given name
    pub fn operations_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a OperationSig> {
        self.operations.iter().filter(move |op| op.name == name)
    }

    /// Whether the interface requires an operation with this name
    pub fn has_operation(&self, name: &str) -> bool {
        self.operations_named(name).next().is_some()
    }
}

/// Mapping from concrete unit names to capability interfaces
#[derive(Debug, Clone, Default)]
pub struct InterfaceRegistry {
    interfaces: FxHashMap<String, CapabilityInterface>,
    mappings: FxHashMap<String, String>,
}

impl InterfaceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability interface
    pub fn declare(&mut self, interface: CapabilityInterface) -> Result<(), RegistryError> {
        if self.interfaces.contains_key(&interface.name) {
            return Err(RegistryError::DuplicateInterface(interface.name));
        }
        self.interfaces.insert(interface.name.clone(), interface);
        Ok(())
    }

    /// Map a concrete unit name to a declared interface
    pub fn map(
        &mut self,
        concrete: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let concrete = concrete.into();
        let interface = interface.into();

        if !self.interfaces.contains_key(&interface) {
            return Err(RegistryError::UnknownInterface(interface));
        }
        if let Some(existing) = self.mappings.get(&concrete) {
            return Err(RegistryError::AlreadyMapped {
                concrete,
                existing: existing.clone(),
            });
        }

        self.mappings.insert(concrete, interface);
        Ok(())
    }

    /// Interface name a concrete name maps to
    pub fn interface_name_for(&self, concrete: &str) -> Option<&str> {
        self.mappings.get(concrete).map(String::as_str)
    }

    /// Interface a concrete name maps to
    pub fn interface_for(&self, concrete: &str) -> Option<&CapabilityInterface> {
        self.interface_name_for(concrete)
            .and_then(|name| self.interfaces.get(name))
    }

    /// Whether the concrete name is mapped
    pub fn is_mapped(&self, concrete: &str) -> bool {
        self.mappings.contains_key(concrete)
    }

    /// Look up a declared interface
    pub fn interface(&self, name: &str) -> Option<&CapabilityInterface> {
        self.interfaces.get(name)
    }

    /// Whether the name is a declared interface
    pub fn is_interface(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    /// Concrete names mapped to an interface, sorted
    pub fn implementers(&self, interface: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .mappings
            .iter()
            .filter(|(_, target)| target.as_str() == interface)
            .map(|(concrete, _)| concrete.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Replace mapped concrete names by their interfaces throughout a type
    pub fn substitute(&self, ty: &TypeRef) -> TypeRef {
        ty.substitute(&|name| self.interface_name_for(name).map(str::to_string))
    }

    /// Deepest nesting of a mapped name inside a type
    pub fn mapped_depth(&self, ty: &TypeRef) -> Option<usize> {
        ty.mapped_depth(&|name| self.is_mapped(name))
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether there are no mappings
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
