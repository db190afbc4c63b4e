//! Structural verification of module units
//!
//! Run on every unit before it is defined. Checks instruction decoding, jump
//! targets, stack depth consistency across control flow, constant pool and
//! local slot references, and that no entry point falls off its end.

use crate::encoder::BytecodeReader;
use crate::opcode::Opcode;
use crate::types::{Signature, TypeRef};
use crate::unit::{EntryPoint, ModuleUnit, MAX_LOCALS};
use std::collections::{HashMap, HashSet};

/// Deepest operand stack an entry point may build
pub const MAX_STACK_DEPTH: i32 = 1024;

/// Bytecode verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Invalid opcode
    #[error("Invalid opcode {opcode:#x} at offset {offset}")]
    InvalidOpcode {
        /// Raw byte
        opcode: u8,
        /// Code offset
        offset: usize,
    },

    /// Operands run past the end of the code
    #[error("Truncated instruction at offset {0}")]
    Truncated(usize),

    /// Stack underflow
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// Stack overflow
    #[error("Stack overflow at offset {0} (depth: {1})")]
    StackOverflow(usize, i32),

    /// Two control-flow paths reach an instruction with different depths
    #[error("Inconsistent stack depth at offset {offset}: {expected} vs {found}")]
    StackMismatch {
        /// Code offset
        offset: usize,
        /// Depth recorded first
        expected: i32,
        /// Conflicting depth
        found: i32,
    },

    /// Invalid jump target
    #[error("Invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Computed target
        target: i64,
        /// Offset of the jump
        offset: usize,
    },

    /// Invalid constant pool reference
    #[error("Invalid constant pool reference: index {index} at offset {offset}")]
    InvalidConstantRef {
        /// Pool index
        index: u32,
        /// Code offset
        offset: usize,
    },

    /// Constant referenced as a descriptor does not parse
    #[error("Invalid type descriptor '{descriptor}' at offset {offset}")]
    InvalidDescriptor {
        /// Descriptor text
        descriptor: String,
        /// Code offset
        offset: usize,
    },

    /// Invalid local variable reference
    #[error("Invalid local variable reference: index {index} (max {max}) at offset {offset}")]
    InvalidLocalRef {
        /// Slot index
        index: usize,
        /// Slot count
        max: usize,
        /// Code offset
        offset: usize,
    },

    /// Execution falls off end
    #[error("Execution falls off end of entry point at offset {0}")]
    FallOffEnd(usize),

    /// Not enough local slots for receiver and parameters
    #[error("Entry point declares {local_count} locals but needs {required}")]
    TooFewLocals {
        /// Declared slots
        local_count: usize,
        /// Slots required by receiver and parameters
        required: usize,
    },

    /// More local slots than `u16` operands can address
    #[error("Entry point declares {0} locals (max {MAX_LOCALS})")]
    TooManyLocals(usize),

    /// Constructors always have a receiver
    #[error("Constructor marked static")]
    StaticConstructor,

    /// Same name, parameter list and staticness declared twice
    #[error("Duplicate entry point {name}{signature}")]
    DuplicateEntryPoint {
        /// Entry point name
        name: String,
        /// Rendered signature
        signature: String,
    },

    /// Error located in a specific entry point
    #[error("In entry point {entry}: {error}")]
    Entry {
        /// Entry point name and signature
        entry: String,
        /// Underlying error
        error: Box<VerifyError>,
    },
}

/// Verify a unit's entry points
pub fn verify_unit(unit: &ModuleUnit) -> Result<(), VerifyError> {
    // Static and instance entry points are looked up separately
    let mut seen: HashSet<(&str, &[TypeRef], bool)> = HashSet::new();
    for entry in &unit.entry_points {
        let key = (entry.name.as_str(), entry.signature.params.as_slice(), entry.is_static());
        if !seen.insert(key) {
            return Err(VerifyError::DuplicateEntryPoint {
                name: entry.name.clone(),
                signature: entry.signature.to_string(),
            });
        }

        verify_entry_point(entry, unit).map_err(|error| VerifyError::Entry {
            entry: format!("{}{}", entry.name, entry.signature),
            error: Box::new(error),
        })?;
    }

    Ok(())
}

/// Verify a single entry point
fn verify_entry_point(entry: &EntryPoint, unit: &ModuleUnit) -> Result<(), VerifyError> {
    if entry.is_constructor() && entry.is_static() {
        return Err(VerifyError::StaticConstructor);
    }

    if entry.local_count > MAX_LOCALS {
        return Err(VerifyError::TooManyLocals(entry.local_count));
    }

    let required = entry.first_param_slot() + entry.signature.arity();
    if entry.local_count < required {
        return Err(VerifyError::TooFewLocals {
            local_count: entry.local_count,
            required,
        });
    }

    if entry.code.is_empty() {
        return Err(VerifyError::FallOffEnd(0));
    }

    let instructions = parse_instructions(&entry.code)?;
    verify_constant_refs(&instructions, unit)?;
    verify_local_refs(&instructions, entry)?;
    verify_stack_depth(&instructions)?;

    Ok(())
}

/// Parsed instruction
#[derive(Debug, Clone)]
struct Instruction {
    offset: usize,
    opcode: Opcode,
    operands: Vec<u8>,
}

impl Instruction {
    fn u16_at(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.operands[at], self.operands[at + 1]])
    }

    fn u32_at(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.operands[at],
            self.operands[at + 1],
            self.operands[at + 2],
            self.operands[at + 3],
        ])
    }

    fn i32_at(&self, at: usize) -> i32 {
        self.u32_at(at) as i32
    }

    fn end(&self) -> usize {
        self.offset + 1 + self.operands.len()
    }

    /// Absolute jump target, relative offsets counting from the next instruction
    fn jump_target(&self) -> i64 {
        self.end() as i64 + self.i32_at(0) as i64
    }

    /// (pops, pushes)
    fn stack_effect(&self) -> (i32, i32) {
        match self.opcode {
            Opcode::Nop => (0, 0),
            Opcode::Pop => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Swap => (2, 2),
            Opcode::ConstNull
            | Opcode::ConstTrue
            | Opcode::ConstFalse
            | Opcode::ConstI32
            | Opcode::ConstF64
            | Opcode::ConstStr
            | Opcode::LoadConst => (0, 1),
            Opcode::LoadLocal | Opcode::LoadLocal0 | Opcode::LoadLocal1 => (0, 1),
            Opcode::StoreLocal | Opcode::StoreLocal0 | Opcode::StoreLocal1 => (1, 0),
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Fadd
            | Opcode::Fsub
            | Opcode::Fmul
            | Opcode::Fdiv
            | Opcode::Ieq
            | Opcode::Ine
            | Opcode::Ilt
            | Opcode::Ile
            | Opcode::Igt
            | Opcode::Ige
            | Opcode::Feq
            | Opcode::Flt
            | Opcode::Fgt
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::And
            | Opcode::Or
            | Opcode::Sconcat => (2, 1),
            Opcode::Ineg | Opcode::Fneg | Opcode::Not | Opcode::Slen | Opcode::ToString => (1, 1),
            Opcode::Jmp => (0, 0),
            Opcode::JmpIfFalse | Opcode::JmpIfTrue | Opcode::JmpIfNull | Opcode::JmpIfNotNull => {
                (1, 0)
            }
            Opcode::CallMethod => (self.u16_at(4) as i32 + 1, 1),
            Opcode::CallSuper => (self.u16_at(4) as i32, 1),
            Opcode::CallStatic => (self.u16_at(8) as i32, 1),
            Opcode::CallExact => (self.u16_at(8) as i32 + 1, 1),
            Opcode::New => (self.u16_at(4) as i32, 1),
            Opcode::Return => (1, 0),
            Opcode::ReturnVoid => (0, 0),
            Opcode::LoadField => (1, 1),
            Opcode::StoreField => (2, 0),
            Opcode::LoadElem => (2, 1),
            Opcode::StoreElem => (3, 0),
            Opcode::ArrayLen => (1, 1),
            Opcode::ArrayLiteral => (self.u16_at(0) as i32, 1),
            Opcode::Throw => (1, 0),
            Opcode::CheckCast | Opcode::InstanceOf => (1, 1),
        }
    }
}

/// Parse all instructions from bytecode
fn parse_instructions(code: &[u8]) -> Result<Vec<Instruction>, VerifyError> {
    let mut instructions = Vec::new();
    let mut reader = BytecodeReader::new(code);

    while reader.has_more() {
        let offset = reader.position();
        let byte = reader.read_u8().map_err(|_| VerifyError::Truncated(offset))?;
        let opcode = Opcode::from_u8(byte).ok_or(VerifyError::InvalidOpcode {
            opcode: byte,
            offset,
        })?;
        let operands = reader
            .read_bytes(opcode.operand_size())
            .map_err(|_| VerifyError::Truncated(offset))?;

        instructions.push(Instruction {
            offset,
            opcode,
            operands,
        });
    }

    Ok(instructions)
}

/// Propagate stack depths along every control-flow edge
fn verify_stack_depth(instructions: &[Instruction]) -> Result<(), VerifyError> {
    let index_of: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.offset, i))
        .collect();

    let mut depths: Vec<Option<i32>> = vec![None; instructions.len()];
    let mut worklist = vec![(0usize, 0i32)];

    while let Some((index, depth)) = worklist.pop() {
        let instr = &instructions[index];
        match depths[index] {
            Some(existing) if existing == depth => continue,
            Some(existing) => {
                return Err(VerifyError::StackMismatch {
                    offset: instr.offset,
                    expected: existing,
                    found: depth,
                })
            }
            None => depths[index] = Some(depth),
        }

        let (pops, pushes) = instr.stack_effect();
        if depth < pops {
            return Err(VerifyError::StackUnderflow(instr.offset));
        }
        let after = depth - pops + pushes;
        if after > MAX_STACK_DEPTH {
            return Err(VerifyError::StackOverflow(instr.offset, after));
        }

        if instr.opcode.is_jump() {
            let target = instr.jump_target();
            let target_index = usize::try_from(target)
                .ok()
                .and_then(|t| index_of.get(&t).copied())
                .ok_or(VerifyError::InvalidJumpTarget {
                    target,
                    offset: instr.offset,
                })?;
            worklist.push((target_index, after));
        }

        if !instr.opcode.is_terminator() {
            if index + 1 >= instructions.len() {
                return Err(VerifyError::FallOffEnd(instr.offset));
            }
            worklist.push((index + 1, after));
        }
    }

    Ok(())
}

/// Verify constant pool references in instructions
fn verify_constant_refs(instructions: &[Instruction], unit: &ModuleUnit) -> Result<(), VerifyError> {
    let string = |index: u32, offset: usize| -> Result<&str, VerifyError> {
        unit.constants
            .get_string(index)
            .ok_or(VerifyError::InvalidConstantRef { index, offset })
    };

    for instr in instructions {
        let offset = instr.offset;
        match instr.opcode {
            Opcode::ConstStr | Opcode::CallMethod | Opcode::CallSuper | Opcode::New => {
                string(instr.u32_at(0), offset)?;
            }
            Opcode::CallStatic => {
                string(instr.u32_at(0), offset)?;
                string(instr.u32_at(4), offset)?;
            }
            Opcode::CallExact => {
                string(instr.u32_at(0), offset)?;
                let descriptor = string(instr.u32_at(4), offset)?;
                Signature::parse(descriptor).map_err(|_| VerifyError::InvalidDescriptor {
                    descriptor: descriptor.to_string(),
                    offset,
                })?;
            }
            Opcode::CheckCast | Opcode::InstanceOf => {
                let descriptor = string(instr.u32_at(0), offset)?;
                TypeRef::parse(descriptor).map_err(|_| VerifyError::InvalidDescriptor {
                    descriptor: descriptor.to_string(),
                    offset,
                })?;
            }
            Opcode::LoadConst => {
                let index = instr.u32_at(0);
                if unit.constants.get_integer(index).is_none() {
                    return Err(VerifyError::InvalidConstantRef { index, offset });
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Verify local variable references in instructions
fn verify_local_refs(instructions: &[Instruction], entry: &EntryPoint) -> Result<(), VerifyError> {
    let max = entry.local_count;

    for instr in instructions {
        let index = match instr.opcode {
            Opcode::LoadLocal | Opcode::StoreLocal => instr.u16_at(0) as usize,
            Opcode::LoadLocal0 | Opcode::StoreLocal0 => 0,
            Opcode::LoadLocal1 | Opcode::StoreLocal1 => 1,
            _ => continue,
        };
        if index >= max {
            return Err(VerifyError::InvalidLocalRef {
                index,
                max,
                offset: instr.offset,
            });
        }
    }

    Ok(())
}
