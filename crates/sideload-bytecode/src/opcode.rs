//! Bytecode opcodes for module unit entry points
//!
//! All opcodes are single-byte instructions. Some opcodes take operands that
//! follow the opcode byte in the code stream.
//!
//! Opcodes are organized into categories:
//! - 0x00-0x0F: Stack manipulation & constants
//! - 0x10-0x1F: Local variables
//! - 0x20-0x2F: Integer arithmetic
//! - 0x30-0x3F: Float arithmetic
//! - 0x50-0x5F: Integer comparison
//! - 0x60-0x6F: Float comparison
//! - 0x70-0x7F: Generic comparison & logical
//! - 0x80-0x8F: String operations
//! - 0x90-0x9F: Control flow
//! - 0xA0-0xAF: Calls
//! - 0xB0-0xBF: Object operations
//! - 0xC0-0xCF: Array operations
//! - 0xE0-0xEF: Error handling
//! - 0xF0-0xFF: Type checks

/// Bytecode opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack Manipulation & Constants (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Pop top value from stack
    Pop = 0x01,
    /// Duplicate top stack value
    Dup = 0x02,
    /// Swap top two stack values
    Swap = 0x03,
    /// Push null constant
    ConstNull = 0x04,
    /// Push true constant
    ConstTrue = 0x05,
    /// Push false constant
    ConstFalse = 0x06,
    /// Push 32-bit integer constant (operand: i32)
    ConstI32 = 0x07,
    /// Push 64-bit float constant (operand: f64)
    ConstF64 = 0x08,
    /// Push string constant from pool (operand: u32 index)
    ConstStr = 0x09,
    /// Push integer constant from pool (operand: u32 index)
    LoadConst = 0x0A,

    // ===== Local Variables (0x10-0x1F) =====
    /// Load local variable onto stack (operand: u16 index)
    LoadLocal = 0x10,
    /// Store top of stack to local variable (operand: u16 index)
    StoreLocal = 0x11,
    /// Load local variable 0
    LoadLocal0 = 0x12,
    /// Load local variable 1
    LoadLocal1 = 0x13,
    /// Store to local variable 0
    StoreLocal0 = 0x14,
    /// Store to local variable 1
    StoreLocal1 = 0x15,

    // ===== Integer Arithmetic (0x20-0x2F) =====
    /// Integer addition: pop b, pop a, push a + b
    Iadd = 0x20,
    /// Integer subtraction: pop b, pop a, push a - b
    Isub = 0x21,
    /// Integer multiplication: pop b, pop a, push a * b
    Imul = 0x22,
    /// Integer division: pop b, pop a, push a / b
    Idiv = 0x23,
    /// Integer modulo: pop b, pop a, push a % b
    Imod = 0x24,
    /// Integer negation: pop a, push -a
    Ineg = 0x25,

    // ===== Float Arithmetic (0x30-0x3F) =====
    /// Float addition
    Fadd = 0x30,
    /// Float subtraction
    Fsub = 0x31,
    /// Float multiplication
    Fmul = 0x32,
    /// Float division
    Fdiv = 0x33,
    /// Float negation
    Fneg = 0x34,

    // ===== Integer Comparison (0x50-0x5F) =====
    /// Integer equality
    Ieq = 0x50,
    /// Integer inequality
    Ine = 0x51,
    /// Integer less than
    Ilt = 0x52,
    /// Integer less or equal
    Ile = 0x53,
    /// Integer greater than
    Igt = 0x54,
    /// Integer greater or equal
    Ige = 0x55,

    // ===== Float Comparison (0x60-0x6F) =====
    /// Float equality
    Feq = 0x60,
    /// Float less than
    Flt = 0x62,
    /// Float greater than
    Fgt = 0x64,

    // ===== Generic Comparison & Logical (0x70-0x7F) =====
    /// Structural/identity equality
    Eq = 0x70,
    /// Structural/identity inequality
    Ne = 0x71,
    /// Logical NOT
    Not = 0x74,
    /// Logical AND
    And = 0x75,
    /// Logical OR
    Or = 0x76,

    // ===== String Operations (0x80-0x8F) =====
    /// String concatenation
    Sconcat = 0x80,
    /// String length
    Slen = 0x81,
    /// Convert value to string
    ToString = 0x88,

    // ===== Control Flow (0x90-0x9F) =====
    /// Unconditional jump (operand: i32 offset, relative to the next instruction)
    Jmp = 0x90,
    /// Jump if false
    JmpIfFalse = 0x91,
    /// Jump if true
    JmpIfTrue = 0x92,
    /// Jump if null
    JmpIfNull = 0x93,
    /// Jump if not null
    JmpIfNotNull = 0x94,

    // ===== Calls (0xA0-0xAF) =====
    /// Call instance method by name (operands: u32 name index, u16 arg count)
    CallMethod = 0xA1,
    /// Return value from entry point
    Return = 0xA2,
    /// Return without value
    ReturnVoid = 0xA3,
    /// Call super-unit method by name (operands: u32 name index, u16 arg count)
    CallSuper = 0xA5,
    /// Call static entry point (operands: u32 type index, u32 name index, u16 arg count)
    CallStatic = 0xA6,
    /// Call instance method with an exact signature
    /// (operands: u32 name index, u32 signature index, u16 arg count)
    CallExact = 0xA7,

    // ===== Object Operations (0xB0-0xBF) =====
    /// Allocate and construct (operands: u32 type index, u16 arg count)
    New = 0xB0,
    /// Load field (operand: u16 field index)
    LoadField = 0xB1,
    /// Store field (operand: u16 field index)
    StoreField = 0xB2,

    // ===== Array Operations (0xC0-0xCF) =====
    /// Load array element: pop index, pop array, push element
    LoadElem = 0xC1,
    /// Store array element: pop value, pop index, pop array
    StoreElem = 0xC2,
    /// Array length
    ArrayLen = 0xC3,
    /// Build array from the top N stack values (operand: u16 count)
    ArrayLiteral = 0xC4,

    // ===== Error Handling (0xE0-0xEF) =====
    /// Raise the value on top of the stack as an error
    Throw = 0xE3,

    // ===== Type Checks (0xF0-0xFF) =====
    /// Checked downcast of the top of stack (operand: u32 descriptor index)
    CheckCast = 0xF5,
    /// Push whether top of stack conforms to a type (operand: u32 descriptor index)
    InstanceOf = 0xF6,
}

impl Opcode {
    /// Convert byte to opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::Pop),
            0x02 => Some(Self::Dup),
            0x03 => Some(Self::Swap),
            0x04 => Some(Self::ConstNull),
            0x05 => Some(Self::ConstTrue),
            0x06 => Some(Self::ConstFalse),
            0x07 => Some(Self::ConstI32),
            0x08 => Some(Self::ConstF64),
            0x09 => Some(Self::ConstStr),
            0x0A => Some(Self::LoadConst),

            0x10 => Some(Self::LoadLocal),
            0x11 => Some(Self::StoreLocal),
            0x12 => Some(Self::LoadLocal0),
            0x13 => Some(Self::LoadLocal1),
            0x14 => Some(Self::StoreLocal0),
            0x15 => Some(Self::StoreLocal1),

            0x20 => Some(Self::Iadd),
            0x21 => Some(Self::Isub),
            0x22 => Some(Self::Imul),
            0x23 => Some(Self::Idiv),
            0x24 => Some(Self::Imod),
            0x25 => Some(Self::Ineg),

            0x30 => Some(Self::Fadd),
            0x31 => Some(Self::Fsub),
            0x32 => Some(Self::Fmul),
            0x33 => Some(Self::Fdiv),
            0x34 => Some(Self::Fneg),

            0x50 => Some(Self::Ieq),
            0x51 => Some(Self::Ine),
            0x52 => Some(Self::Ilt),
            0x53 => Some(Self::Ile),
            0x54 => Some(Self::Igt),
            0x55 => Some(Self::Ige),

            0x60 => Some(Self::Feq),
            0x62 => Some(Self::Flt),
            0x64 => Some(Self::Fgt),

            0x70 => Some(Self::Eq),
            0x71 => Some(Self::Ne),
            0x74 => Some(Self::Not),
            0x75 => Some(Self::And),
            0x76 => Some(Self::Or),

            0x80 => Some(Self::Sconcat),
            0x81 => Some(Self::Slen),
            0x88 => Some(Self::ToString),

            0x90 => Some(Self::Jmp),
            0x91 => Some(Self::JmpIfFalse),
            0x92 => Some(Self::JmpIfTrue),
            0x93 => Some(Self::JmpIfNull),
            0x94 => Some(Self::JmpIfNotNull),

            0xA1 => Some(Self::CallMethod),
            0xA2 => Some(Self::Return),
            0xA3 => Some(Self::ReturnVoid),
            0xA5 => Some(Self::CallSuper),
            0xA6 => Some(Self::CallStatic),
            0xA7 => Some(Self::CallExact),

            0xB0 => Some(Self::New),
            0xB1 => Some(Self::LoadField),
            0xB2 => Some(Self::StoreField),

            0xC1 => Some(Self::LoadElem),
            0xC2 => Some(Self::StoreElem),
            0xC3 => Some(Self::ArrayLen),
            0xC4 => Some(Self::ArrayLiteral),

            0xE3 => Some(Self::Throw),

            0xF5 => Some(Self::CheckCast),
            0xF6 => Some(Self::InstanceOf),

            _ => None,
        }
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::ConstNull => "CONST_NULL",
            Self::ConstTrue => "CONST_TRUE",
            Self::ConstFalse => "CONST_FALSE",
            Self::ConstI32 => "CONST_I32",
            Self::ConstF64 => "CONST_F64",
            Self::ConstStr => "CONST_STR",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadLocal => "LOAD_LOCAL",
            Self::StoreLocal => "STORE_LOCAL",
            Self::LoadLocal0 => "LOAD_LOCAL_0",
            Self::LoadLocal1 => "LOAD_LOCAL_1",
            Self::StoreLocal0 => "STORE_LOCAL_0",
            Self::StoreLocal1 => "STORE_LOCAL_1",
            Self::Iadd => "IADD",
            Self::Isub => "ISUB",
            Self::Imul => "IMUL",
            Self::Idiv => "IDIV",
            Self::Imod => "IMOD",
            Self::Ineg => "INEG",
            Self::Fadd => "FADD",
            Self::Fsub => "FSUB",
            Self::Fmul => "FMUL",
            Self::Fdiv => "FDIV",
            Self::Fneg => "FNEG",
            Self::Ieq => "IEQ",
            Self::Ine => "INE",
            Self::Ilt => "ILT",
            Self::Ile => "ILE",
            Self::Igt => "IGT",
            Self::Ige => "IGE",
            Self::Feq => "FEQ",
            Self::Flt => "FLT",
            Self::Fgt => "FGT",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Not => "NOT",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Sconcat => "SCONCAT",
            Self::Slen => "SLEN",
            Self::ToString => "TO_STRING",
            Self::Jmp => "JMP",
            Self::JmpIfFalse => "JMP_IF_FALSE",
            Self::JmpIfTrue => "JMP_IF_TRUE",
            Self::JmpIfNull => "JMP_IF_NULL",
            Self::JmpIfNotNull => "JMP_IF_NOT_NULL",
            Self::CallMethod => "CALL_METHOD",
            Self::Return => "RETURN",
            Self::ReturnVoid => "RETURN_VOID",
            Self::CallSuper => "CALL_SUPER",
            Self::CallStatic => "CALL_STATIC",
            Self::CallExact => "CALL_EXACT",
            Self::New => "NEW",
            Self::LoadField => "LOAD_FIELD",
            Self::StoreField => "STORE_FIELD",
            Self::LoadElem => "LOAD_ELEM",
            Self::StoreElem => "STORE_ELEM",
            Self::ArrayLen => "ARRAY_LEN",
            Self::ArrayLiteral => "ARRAY_LITERAL",
            Self::Throw => "THROW",
            Self::CheckCast => "CHECK_CAST",
            Self::InstanceOf => "INSTANCE_OF",
        }
    }

    /// Size in bytes of the operands following this opcode
    pub fn operand_size(self) -> usize {
        match self {
            Self::LoadLocal
            | Self::StoreLocal
            | Self::LoadField
            | Self::StoreField
            | Self::ArrayLiteral => 2,

            Self::ConstI32
            | Self::ConstStr
            | Self::LoadConst
            | Self::Jmp
            | Self::JmpIfFalse
            | Self::JmpIfTrue
            | Self::JmpIfNull
            | Self::JmpIfNotNull
            | Self::CheckCast
            | Self::InstanceOf => 4,

            Self::CallMethod | Self::CallSuper | Self::New => 6,

            Self::ConstF64 => 8,

            Self::CallStatic | Self::CallExact => 10,

            _ => 0,
        }
    }

    /// Check if this opcode is a jump instruction
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::JmpIfFalse | Self::JmpIfTrue | Self::JmpIfNull | Self::JmpIfNotNull
        )
    }

    /// Check if this opcode is a call instruction
    pub fn is_call(self) -> bool {
        matches!(
            self,
            Self::CallMethod | Self::CallSuper | Self::CallStatic | Self::CallExact | Self::New
        )
    }

    /// Check if this opcode is a return instruction
    pub fn is_return(self) -> bool {
        matches!(self, Self::Return | Self::ReturnVoid)
    }

    /// Check if control never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        self.is_return() || matches!(self, Self::Jmp | Self::Throw)
    }
}
