//! Sideload Bytecode Definitions
//!
//! This crate provides the binary module unit format, the instruction set,
//! type descriptors, the constant pool and the structural verifier used by
//! the sideload loading context.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod constants;
pub mod encoder;
pub mod opcode;
pub mod types;
pub mod unit;
pub mod verify;

pub use builder::{BuildError, CodeBuilder, Label, UnitBuilder};
pub use constants::ConstantPool;
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use opcode::Opcode;
pub use types::{DescriptorError, Signature, TypeRef, MAX_DESCRIPTOR_DEPTH};
pub use unit::{EntryPoint, FieldDef, ModuleUnit, UnitError, CONSTRUCTOR, MAX_LOCALS};
pub use verify::{verify_unit, VerifyError};
