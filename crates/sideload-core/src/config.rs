//! Context configuration (sideload.toml)
//!
//! Declares capability interfaces, the concrete-to-interface mapping and the
//! options a loading context runs with:
//!
//! ```toml
//! [options]
//! ambiguous_overloads = "warn"
//!
//! [[interface]]
//! name = "api.Boxed"
//! operations = [{ name = "square", signature = "(int)->int" }]
//!
//! [mappings]
//! "impl.Box" = "api.Boxed"
//! ```

use serde::{Deserialize, Serialize};
use sideload_bytecode::{DescriptorError, Signature};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::registry::{CapabilityInterface, InterfaceRegistry, OperationSig, RegistryError};

/// Default bound on nested calls in the interpreter
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Ceiling on any configured call depth bound
pub const MAX_CALL_DEPTH: usize = 1 << 16;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to render TOML
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Operation signature does not parse
    #[error("Invalid signature for {interface}.{operation}: {source}")]
    Descriptor {
        /// Interface name
        interface: String,
        /// Operation name
        operation: String,
        /// Parse error
        source: DescriptorError,
    },

    /// Interface declaration or mapping rejected
    #[error("Invalid interface mapping: {0}")]
    Registry(#[from] RegistryError),
}

/// What to do when a synthesized overload collides with an authored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Fail the load with `AmbiguousOverload`
    #[default]
    Error,
    /// Log a warning and keep the authored overload
    Warn,
}

/// Options a loading context runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Collision handling for synthesized overloads
    pub ambiguous_overloads: OverloadPolicy,
    /// Run the structural verifier on rewritten units
    pub verify: bool,
    /// Interpreter call depth bound, capped at [`MAX_CALL_DEPTH`]
    pub max_call_depth: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            ambiguous_overloads: OverloadPolicy::Error,
            verify: true,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Interface declaration as written in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Fully qualified name
    pub name: String,
    /// Required operations
    #[serde(default)]
    pub operations: Vec<OperationConfig>,
}

/// Operation declaration as written in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Operation name
    pub name: String,
    /// Signature descriptor, e.g. `(int)->int`
    pub signature: String,
}

/// Context configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context options
    #[serde(default)]
    pub options: ContextOptions,

    /// Capability interfaces
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,

    /// Concrete unit name to interface name
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

impl ContextConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Render configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the interface registry described by this configuration
    pub fn registry(&self) -> Result<InterfaceRegistry, ConfigError> {
        let mut registry = InterfaceRegistry::new();

        for interface in &self.interfaces {
            let mut declared = CapabilityInterface::new(interface.name.clone());
            for op in &interface.operations {
                let signature =
                    Signature::parse(&op.signature).map_err(|source| ConfigError::Descriptor {
                        interface: interface.name.clone(),
                        operation: op.name.clone(),
                        source,
                    })?;
                declared.operations.push(OperationSig {
                    name: op.name.clone(),
                    signature,
                });
            }
            registry.declare(declared)?;
        }

        for (concrete, interface) in &self.mappings {
            registry.map(concrete.clone(), interface.clone())?;
        }

        Ok(registry)
    }

    /// Split into the registry and options a context is created from
    pub fn into_parts(self) -> Result<(InterfaceRegistry, ContextOptions), ConfigError> {
        let registry = self.registry()?;
        Ok((registry, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOXED: &str = r#"
[[interface]]
name = "api.Boxed"
operations = [{ name = "square", signature = "(int)->int" }]

[mappings]
"impl.Box" = "api.Boxed"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = ContextConfig::from_toml_str(BOXED).unwrap();
        assert_eq!(config.options, ContextOptions::default());
        assert_eq!(config.interfaces.len(), 1);

        let (registry, options) = config.into_parts().unwrap();
        assert_eq!(registry.interface_name_for("impl.Box"), Some("api.Boxed"));
        assert_eq!(options.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert!(options.verify);
    }

    #[test]
    fn test_parse_options() {
        let config = ContextConfig::from_toml_str(
            r#"
[options]
ambiguous_overloads = "warn"
verify = false
"#,
        )
        .unwrap();

        assert_eq!(config.options.ambiguous_overloads, OverloadPolicy::Warn);
        assert!(!config.options.verify);
        assert_eq!(config.options.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn test_unknown_policy() {
        let result = ContextConfig::from_toml_str("[options]\nambiguous_overloads = \"maybe\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_bad_operation_signature() {
        let config = ContextConfig::from_toml_str(
            r#"
[[interface]]
name = "api.Boxed"
operations = [{ name = "square", signature = "(int" }]
"#,
        )
        .unwrap();

        match config.registry() {
            Err(ConfigError::Descriptor { operation, .. }) => assert_eq!(operation, "square"),
            other => panic!("expected descriptor error, got {:?}", other),
        }
    }

    #[test]
    fn test_mapping_to_undeclared_interface() {
        let config = ContextConfig::from_toml_str("[mappings]\n\"impl.Box\" = \"api.Nope\"\n").unwrap();
        assert!(matches!(
            config.registry(),
            Err(ConfigError::Registry(RegistryError::UnknownInterface(_)))
        ));
    }

    #[test]
    fn test_config_round_trip() {
        let config = ContextConfig::from_toml_str(BOXED).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(ContextConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
