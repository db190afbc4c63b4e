//! Load-time and call-time errors

use thiserror::Error;

use crate::vm::VmError;

/// Errors raised while resolving a unit
///
/// `NotFound` and `Source` leave the name unresolved so a later resolve tries
/// again; every other variant is cached and returned for the rest of the
/// namespace's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Name absent from the module source
    #[error("Module unit not found: {0}")]
    NotFound(String),

    /// Malformed or unsupported unit, failed verification or linkage
    #[error("Failed to define {name}: {reason}")]
    RewriteFailed {
        /// Unit name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// A synthesized overload collides with an authored entry point
    #[error("Ambiguous overload in {unit}: {operation}{signature} is already authored")]
    AmbiguousOverload {
        /// Unit name
        unit: String,
        /// Entry point name
        operation: String,
        /// Colliding signature
        signature: String,
    },

    /// The module source could not be read
    #[error("Failed to read {name} from module source: {message}")]
    Source {
        /// Unit name
        name: String,
        /// Underlying error
        message: String,
    },
}

impl LoadError {
    /// Shorthand for [`LoadError::RewriteFailed`]
    pub fn rewrite_failed(name: impl Into<String>, reason: impl ToString) -> Self {
        LoadError::RewriteFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure is final for the name
    pub fn is_permanent(&self) -> bool {
        !matches!(self, LoadError::NotFound(_) | LoadError::Source { .. })
    }
}

/// Errors raised by reflective construction and invocation
///
/// All of these are per call: they never invalidate the namespace or the
/// defined types involved.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Type could not be resolved
    #[error(transparent)]
    Load(#[from] LoadError),

    /// No entry point with this name
    #[error("No operation {operation} on {unit}")]
    NoSuchOperation {
        /// Unit name
        unit: String,
        /// Requested operation
        operation: String,
    },

    /// Entry points exist but none accepts the arguments
    #[error("No overload of {unit}.{operation} accepts {arity} argument(s) of the given types")]
    NoMatchingOverload {
        /// Unit name
        unit: String,
        /// Requested operation
        operation: String,
        /// Argument count
        arity: usize,
    },

    /// No constructor accepts the arguments
    #[error("No constructor of {unit} accepts {arity} argument(s) of the given types")]
    NoMatchingConstructor {
        /// Unit name
        unit: String,
        /// Argument count
        arity: usize,
    },

    /// The constructor body failed
    #[error("Construction of {unit} failed: {cause}")]
    ConstructionFailed {
        /// Unit name
        unit: String,
        /// Underlying fault
        cause: Box<VmError>,
    },

    /// An inserted cast rejected an argument
    #[error("Cast failure: expected {expected}, got {actual}")]
    CastFailure {
        /// Descriptor cast to
        expected: String,
        /// Description of the rejected value
        actual: String,
    },

    /// Instance does not implement the capability
    #[error("{unit} does not conform to {interface}")]
    NotConforming {
        /// Description of the instance
        unit: String,
        /// Capability interface
        interface: String,
    },

    /// Any other interpreter fault
    #[error("Runtime error: {0}")]
    Runtime(VmError),
}

impl From<VmError> for BridgeError {
    fn from(error: VmError) -> Self {
        match error {
            VmError::CastFailure { expected, actual } => BridgeError::CastFailure { expected, actual },
            VmError::NoSuchOperation { unit, operation } => {
                BridgeError::NoSuchOperation { unit, operation }
            }
            VmError::NoMatchingOverload {
                unit,
                operation,
                arity,
            } => BridgeError::NoMatchingOverload {
                unit,
                operation,
                arity,
            },
            VmError::NoMatchingConstructor { unit, arity } => {
                BridgeError::NoMatchingConstructor { unit, arity }
            }
            VmError::Load(error) => BridgeError::Load(error),
            other => BridgeError::Runtime(other),
        }
    }
}
