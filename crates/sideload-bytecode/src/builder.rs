//! Programmatic construction of module units
//!
//! [`UnitBuilder`] assembles a [`ModuleUnit`] declaration by declaration;
//! [`CodeBuilder`] emits an entry point body with constant interning,
//! local slot tracking and label-based jumps.
//!
//! ```ignore
//! let unit = UnitBuilder::new("impl.Box")
//!     .implements("api.Boxed")
//!     .field("n", "int")
//!     .method("square", "(int)->int", |c| {
//!         c.load_local(1).load_local(1).op(Opcode::Imul).ret();
//!     })
//!     .build()?;
//! ```

use std::collections::HashMap;

use crate::constants::ConstantPool;
use crate::encoder::BytecodeWriter;
use crate::opcode::Opcode;
use crate::types::{DescriptorError, Signature, TypeRef};
use crate::unit::{entry_flags, EntryPoint, FieldDef, ModuleUnit, CONSTRUCTOR};

/// Errors raised while building a unit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A signature or field descriptor failed to parse
    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// A jump targets a label that was never marked
    #[error("Label {label} used in {entry} but never marked")]
    UnmarkedLabel {
        /// Label ID
        label: usize,
        /// Entry point name
        entry: String,
    },
}

/// A jump target inside one entry point body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    id: usize,
}

/// Jump whose offset is patched once its label is marked
#[derive(Debug, Clone)]
struct UnresolvedJump {
    /// Position of the i32 operand
    operand_position: usize,
    label: Label,
}

/// Emits the body of a single entry point
pub struct CodeBuilder<'p> {
    writer: BytecodeWriter,
    pool: &'p mut ConstantPool,
    max_local: Option<u16>,
    next_label: usize,
    labels: HashMap<usize, usize>,
    jumps: Vec<UnresolvedJump>,
}

impl<'p> CodeBuilder<'p> {
    /// Create a builder that interns names into `pool`
    pub fn new(pool: &'p mut ConstantPool) -> Self {
        Self {
            writer: BytecodeWriter::new(),
            pool,
            max_local: None,
            next_label: 0,
            labels: HashMap::new(),
            jumps: Vec::new(),
        }
    }

    fn touch_local(&mut self, index: u16) {
        self.max_local = Some(self.max_local.map_or(index, |m| m.max(index)));
    }

    /// Emit an opcode that takes no operands
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.operand_size(), 0, "{} takes operands", opcode.name());
        self.writer.emit_opcode(opcode);
        self
    }

    // ===== Constants =====

    /// Push null
    pub fn const_null(&mut self) -> &mut Self {
        self.op(Opcode::ConstNull)
    }

    /// Push a boolean
    pub fn const_bool(&mut self, value: bool) -> &mut Self {
        self.op(if value {
            Opcode::ConstTrue
        } else {
            Opcode::ConstFalse
        })
    }

    /// Push an integer, spilling to the constant pool outside the i32 range
    pub fn const_int(&mut self, value: i64) -> &mut Self {
        match i32::try_from(value) {
            Ok(small) => self.writer.emit_const_i32(small),
            Err(_) => {
                let index = self.pool.add_integer(value);
                self.writer.emit_load_const(index);
            }
        }
        self
    }

    /// Push a float
    pub fn const_float(&mut self, value: f64) -> &mut Self {
        self.writer.emit_const_f64(value);
        self
    }

    /// Push a string
    pub fn const_str(&mut self, value: &str) -> &mut Self {
        let index = self.pool.intern(value);
        self.writer.emit_const_str(index);
        self
    }

    // ===== Locals and fields =====

    /// Load a local slot
    pub fn load_local(&mut self, index: u16) -> &mut Self {
        self.touch_local(index);
        match index {
            0 => self.writer.emit_opcode(Opcode::LoadLocal0),
            1 => self.writer.emit_opcode(Opcode::LoadLocal1),
            _ => self.writer.emit_load_local(index),
        }
        self
    }

    /// Store into a local slot
    pub fn store_local(&mut self, index: u16) -> &mut Self {
        self.touch_local(index);
        match index {
            0 => self.writer.emit_opcode(Opcode::StoreLocal0),
            1 => self.writer.emit_opcode(Opcode::StoreLocal1),
            _ => self.writer.emit_store_local(index),
        }
        self
    }

    /// Load a field from the object on top of the stack
    pub fn load_field(&mut self, field: u16) -> &mut Self {
        self.writer.emit_load_field(field);
        self
    }

    /// Store the top of the stack into a field of the object beneath it
    pub fn store_field(&mut self, field: u16) -> &mut Self {
        self.writer.emit_store_field(field);
        self
    }

    /// Load `this.<field>`
    pub fn load_this_field(&mut self, field: u16) -> &mut Self {
        self.load_local(0).load_field(field)
    }

    // ===== Calls and objects =====

    /// Call an instance method by name on the receiver below the arguments
    pub fn call_method(&mut self, name: &str, argc: u16) -> &mut Self {
        let index = self.pool.intern(name);
        self.writer.emit_call_method(index, argc);
        self
    }

    /// Call the super-unit's implementation with `this` as receiver
    pub fn call_super(&mut self, name: &str, argc: u16) -> &mut Self {
        let index = self.pool.intern(name);
        self.writer.emit_call_super(index, argc);
        self
    }

    /// Call a static entry point of a named unit
    pub fn call_static(&mut self, unit: &str, name: &str, argc: u16) -> &mut Self {
        let unit_index = self.pool.intern(unit);
        let name_index = self.pool.intern(name);
        self.writer.emit_call_static(unit_index, name_index, argc);
        self
    }

    /// Call the entry point with exactly this signature
    pub fn call_exact(&mut self, name: &str, signature: &str, argc: u16) -> &mut Self {
        let name_index = self.pool.intern(name);
        let signature_index = self.pool.intern(signature);
        self.writer.emit_call_exact(name_index, signature_index, argc);
        self
    }

    /// Instantiate a named unit with `argc` constructor arguments
    pub fn new_object(&mut self, unit: &str, argc: u16) -> &mut Self {
        let index = self.pool.intern(unit);
        self.writer.emit_new(index, argc);
        self
    }

    /// Build an array from the top `count` values
    pub fn array(&mut self, count: u16) -> &mut Self {
        self.writer.emit_array_literal(count);
        self
    }

    /// Checked cast of the top of the stack
    pub fn check_cast(&mut self, descriptor: &str) -> &mut Self {
        let index = self.pool.intern(descriptor);
        self.writer.emit_check_cast(index);
        self
    }

    /// Replace the top of the stack with whether it conforms to `descriptor`
    pub fn instance_of(&mut self, descriptor: &str) -> &mut Self {
        let index = self.pool.intern(descriptor);
        self.writer.emit_instance_of(index);
        self
    }

    /// Return the top of the stack
    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    /// Return without a value
    pub fn ret_void(&mut self) -> &mut Self {
        self.op(Opcode::ReturnVoid)
    }

    // ===== Labels and control flow =====

    /// Allocate a new label
    pub fn new_label(&mut self) -> Label {
        let label = Label {
            id: self.next_label,
        };
        self.next_label += 1;
        label
    }

    /// Bind `label` to the current position
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels.insert(label.id, self.writer.offset());
        self
    }

    /// Emit a jump to `label`
    pub fn jump_to(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        debug_assert!(opcode.is_jump());
        self.writer.emit_opcode(opcode);
        self.jumps.push(UnresolvedJump {
            operand_position: self.writer.offset(),
            label,
        });
        self.writer.emit_i32(0);
        self
    }

    /// Unconditional jump
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.jump_to(Opcode::Jmp, label)
    }

    /// Jump if the popped condition is false
    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.jump_to(Opcode::JmpIfFalse, label)
    }

    /// Jump if the popped condition is true
    pub fn jump_if_true(&mut self, label: Label) -> &mut Self {
        self.jump_to(Opcode::JmpIfTrue, label)
    }

    /// Patch jumps and return the code plus the highest local slot used
    fn finish(mut self, entry: &str) -> Result<(Vec<u8>, Option<u16>), BuildError> {
        for jump in &self.jumps {
            let target = *self
                .labels
                .get(&jump.label.id)
                .ok_or_else(|| BuildError::UnmarkedLabel {
                    label: jump.label.id,
                    entry: entry.to_string(),
                })?;
            let relative = target as i32 - (jump.operand_position + 4) as i32;
            self.writer.patch_i32(jump.operand_position, relative);
        }
        Ok((self.writer.into_bytes(), self.max_local))
    }
}

/// Assembles a [`ModuleUnit`]
pub struct UnitBuilder {
    unit: ModuleUnit,
    error: Option<BuildError>,
}

impl UnitBuilder {
    /// Start a unit with the given qualified name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            unit: ModuleUnit::new(name),
            error: None,
        }
    }

    fn record(&mut self, error: impl Into<BuildError>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// Set the super-unit
    pub fn extends(mut self, super_unit: impl Into<String>) -> Self {
        self.unit.super_unit = Some(super_unit.into());
        self
    }

    /// Declare conformance to a capability interface
    pub fn implements(mut self, capability: impl Into<String>) -> Self {
        self.unit.capabilities.push(capability.into());
        self
    }

    /// Declare a field
    pub fn field(mut self, name: impl Into<String>, descriptor: &str) -> Self {
        match TypeRef::parse(descriptor) {
            Ok(ty) => self.unit.fields.push(FieldDef {
                name: name.into(),
                ty,
            }),
            Err(e) => self.record(e),
        }
        self
    }

    /// Declare a constructor
    pub fn constructor(self, signature: &str, body: impl FnOnce(&mut CodeBuilder<'_>)) -> Self {
        self.entry(CONSTRUCTOR, signature, entry_flags::CONSTRUCTOR, body)
    }

    /// Declare an instance method
    pub fn method(
        self,
        name: &str,
        signature: &str,
        body: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        self.entry(name, signature, 0, body)
    }

    /// Declare a static entry point
    pub fn static_method(
        self,
        name: &str,
        signature: &str,
        body: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        self.entry(name, signature, entry_flags::STATIC, body)
    }

    /// Declare an entry point with explicit flags
    pub fn entry(
        mut self,
        name: &str,
        signature: &str,
        flags: u32,
        body: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> Self {
        let signature = match Signature::parse(signature) {
            Ok(signature) => signature,
            Err(e) => {
                self.record(e);
                return self;
            }
        };

        let mut code = CodeBuilder::new(&mut self.unit.constants);
        body(&mut code);
        let (code, max_local) = match code.finish(name) {
            Ok(finished) => finished,
            Err(e) => {
                self.record(e);
                return self;
            }
        };

        let receiver = if flags & entry_flags::STATIC != 0 { 0 } else { 1 };
        let required = receiver + signature.arity();
        let local_count = max_local.map_or(required, |m| required.max(m as usize + 1));

        self.unit.entry_points.push(EntryPoint {
            name: name.to_string(),
            signature,
            flags,
            local_count,
            code,
        });
        self
    }

    /// Finish the unit
    pub fn build(self) -> Result<ModuleUnit, BuildError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.unit),
        }
    }

    /// Finish the unit and encode it
    pub fn encode(self) -> Result<Vec<u8>, BuildError> {
        self.build().map(|unit| unit.encode())
    }
}
