//! Sideload Core Runtime
//!
//! This crate provides:
//! - Isolated loading contexts over a module source
//! - The type rewriter that retrofits capability interfaces
//! - A reflective bridge for name-based construction and invocation
//! - The interpreter that executes defined entry points
//! - The host's shared namespace

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod namespace;
pub mod registry;
pub mod rewrite;
pub mod shared;
pub mod source;
pub mod value;
pub mod vm;

pub use bridge::{Bridge, InterfaceView};
pub use config::{
    ConfigError, ContextConfig, ContextOptions, OverloadPolicy, DEFAULT_MAX_CALL_DEPTH, MAX_CALL_DEPTH,
};
pub use context::{IsolatedContext, UnitState};
pub use error::{BridgeError, LoadError};
pub use namespace::{Namespace, NamespaceId, TypeHandle};
pub use registry::{CapabilityInterface, InterfaceRegistry, OperationSig, RegistryError};
pub use rewrite::{rewrite, RewriteDirective, RewriteError, RewriteReport, Rewritten};
pub use shared::SharedNamespace;
pub use source::{ArchiveSource, DirectorySource, MemorySource, ModuleSource, SourceError};
pub use value::{Object, Value};
pub use vm::{Interpreter, VmError, VmResult};
