//! Bytecode execution for defined types

mod conform;
mod interpreter;

pub use conform::{conforms, Conformance};
pub use interpreter::Interpreter;

use thiserror::Error;

use crate::error::LoadError;

/// Interpreter faults
#[derive(Debug, Clone, Error)]
pub enum VmError {
    /// Checked cast rejected a value
    #[error("Cast failure: expected {expected}, got {actual}")]
    CastFailure {
        /// Descriptor cast to
        expected: String,
        /// Description of the rejected value
        actual: String,
    },

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

    /// Operand of the wrong kind
    #[error("Type error: {0}")]
    TypeError(String),

    /// Value raised by THROW
    #[error("Thrown: {0}")]
    Thrown(String),

    /// Stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// Call depth bound exceeded
    #[error("Call depth exceeded (limit {0})")]
    CallDepthExceeded(usize),

    /// Null receiver or operand
    #[error("Null reference")]
    NullReference,

    /// Integer division by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Array index out of bounds
    #[error("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: i64,
        /// Array length
        len: usize,
    },

    /// Malformed instruction stream
    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(String),

    /// The namespace that defined the executing code is gone
    #[error("Namespace of {0} has been dropped")]
    NamespaceDropped(String),

    /// Type referenced by code could not be resolved
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
