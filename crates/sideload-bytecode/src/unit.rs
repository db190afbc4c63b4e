//! Module unit binary format
//!
//! A module unit is the translation unit for one type: its name, super-unit,
//! declared capabilities, fields, constant pool and entry points.

use crate::constants::ConstantPool;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::types::{DescriptorError, Signature, TypeRef};
use thiserror::Error;

/// Magic number for module unit files: "SDLU"
pub const MAGIC: [u8; 4] = *b"SDLU";

/// Current unit format version
pub const VERSION: u32 = 1;

/// Size of the fixed header (magic + version + flags + checksum)
pub const HEADER_SIZE: usize = 16;

/// Name reserved for constructors
pub const CONSTRUCTOR: &str = "constructor";

/// Most local slots an entry point may declare; slots are addressed by `u16`
pub const MAX_LOCALS: usize = u16::MAX as usize + 1;

/// Unit encoding/decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected SDLU, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Checksum of the payload as read
        actual: u32,
    },

    /// A stored type descriptor does not parse
    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Entry point declares more local slots than can be addressed
    #[error("Entry point {entry} declares {local_count} locals (max {MAX_LOCALS})")]
    TooManyLocals {
        /// Entry point name
        entry: String,
        /// Declared slots
        local_count: usize,
    },
}

/// Unit flags
pub mod flags {
    /// Unit was produced by the type rewriter
    pub const REWRITTEN: u32 = 1 << 0;
}

/// Entry point flags
pub mod entry_flags {
    /// No receiver; reachable only by name through static invocation
    pub const STATIC: u32 = 1 << 0;
    /// Constructor; receiver is the freshly allocated instance
    pub const CONSTRUCTOR: u32 = 1 << 1;
    /// Added by the type rewriter, not authored
    pub const SYNTHETIC: u32 = 1 << 2;
}

/// Field declaration
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Declared type
    pub ty: TypeRef,
}

/// An entry point (method, static operation or constructor)
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPoint {
    /// Name
    pub name: String,
    /// Declared parameter and return types
    pub signature: Signature,
    /// Entry point flags
    pub flags: u32,
    /// Number of local slots (receiver and parameters included)
    pub local_count: usize,
    /// Bytecode
    pub code: Vec<u8>,
}

impl EntryPoint {
    /// Whether this entry point has no receiver
    pub fn is_static(&self) -> bool {
        self.flags & entry_flags::STATIC != 0
    }

    /// Whether this entry point is a constructor
    pub fn is_constructor(&self) -> bool {
        self.flags & entry_flags::CONSTRUCTOR != 0
    }

    /// Whether this entry point was added by the rewriter
    pub fn is_synthetic(&self) -> bool {
        self.flags & entry_flags::SYNTHETIC != 0
    }

    /// Local slot holding the first parameter
    pub fn first_param_slot(&self) -> usize {
        if self.is_static() {
            0
        } else {
            1
        }
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_u32(self.signature.params.len() as u32);
        for param in &self.signature.params {
            writer.emit_string(&param.to_string());
        }
        writer.emit_string(&self.signature.ret.to_string());
        writer.emit_u32(self.flags);
        writer.emit_u32(self.local_count as u32);
        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, UnitError> {
        let name = reader.read_string()?;
        let param_count = reader.read_u32()? as usize;
        let mut params = Vec::with_capacity(param_count.min(64));
        for _ in 0..param_count {
            params.push(TypeRef::parse(&reader.read_string()?)?);
        }
        let ret = TypeRef::parse(&reader.read_string()?)?;
        let flags = reader.read_u32()?;
        let local_count = reader.read_u32()? as usize;
        if local_count > MAX_LOCALS {
            return Err(UnitError::TooManyLocals {
                entry: name,
                local_count,
            });
        }
        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?;

        Ok(Self {
            name,
            signature: Signature::new(params, ret),
            flags,
            local_count,
            code,
        })
    }
}

/// A module unit
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleUnit {
    /// Format version
    pub version: u32,
    /// Unit flags
    pub flags: u32,
    /// Fully qualified name
    pub name: String,
    /// Super-unit, if any
    pub super_unit: Option<String>,
    /// Capability interfaces this unit claims to implement
    pub capabilities: Vec<String>,
    /// Fields declared by this unit (super-unit fields excluded)
    pub fields: Vec<FieldDef>,
    /// Constant pool
    pub constants: ConstantPool,
    /// Entry point table, in declaration order
    pub entry_points: Vec<EntryPoint>,
}

impl ModuleUnit {
    /// Create a new empty unit
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: VERSION,
            flags: 0,
            name: name.into(),
            super_unit: None,
            capabilities: Vec::new(),
            fields: Vec::new(),
            constants: ConstantPool::new(),
            entry_points: Vec::new(),
        }
    }

    /// Entry points with the given name
    pub fn entry_points_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EntryPoint> {
        self.entry_points.iter().filter(move |e| e.name == name)
    }

    /// Find an entry point by exact name and parameter list
    pub fn find_exact(&self, name: &str, params: &[TypeRef]) -> Option<&EntryPoint> {
        self.entry_points
            .iter()
            .find(|e| e.name == name && e.signature.params == params)
    }

    /// Whether the unit declares the capability
    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Encode the unit to binary format
    ///
    /// Format:
    /// - Header: magic (4 bytes) + version (u32) + flags (u32) + checksum (u32)
    /// - Name, super-unit (presence byte + name), capabilities
    /// - Field table
    /// - Constant pool
    /// - Entry point table
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();

        writer.emit_bytes(&MAGIC);
        writer.emit_u32(self.version);
        writer.emit_u32(self.flags);
        let checksum_offset = writer.offset();
        writer.emit_u32(0);

        writer.emit_string(&self.name);
        match &self.super_unit {
            Some(name) => {
                writer.emit_u8(1);
                writer.emit_string(name);
            }
            None => writer.emit_u8(0),
        }

        writer.emit_u32(self.capabilities.len() as u32);
        for capability in &self.capabilities {
            writer.emit_string(capability);
        }

        writer.emit_u32(self.fields.len() as u32);
        for field in &self.fields {
            writer.emit_string(&field.name);
            writer.emit_string(&field.ty.to_string());
        }

        self.constants.encode(&mut writer);

        writer.emit_u32(self.entry_points.len() as u32);
        for entry in &self.entry_points {
            entry.encode(&mut writer);
        }

        let checksum = crc32fast::hash(&writer.buffer()[HEADER_SIZE..]);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode a unit from binary format
    pub fn decode(data: &[u8]) -> Result<Self, UnitError> {
        let mut reader = BytecodeReader::new(data);

        let magic: [u8; 4] = reader
            .read_bytes(4)?
            .try_into()
            .map_err(|_| DecodeError::UnexpectedEnd(0))?;
        if magic != MAGIC {
            return Err(UnitError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(UnitError::UnsupportedVersion(version));
        }

        let flags = reader.read_u32()?;
        let stored_checksum = reader.read_u32()?;

        let calculated_checksum = crc32fast::hash(&data[HEADER_SIZE..]);
        if stored_checksum != calculated_checksum {
            return Err(UnitError::ChecksumMismatch {
                expected: stored_checksum,
                actual: calculated_checksum,
            });
        }

        let name = reader.read_string()?;
        let super_unit = match reader.read_u8()? {
            0 => None,
            _ => Some(reader.read_string()?),
        };

        let capability_count = reader.read_u32()? as usize;
        let mut capabilities = Vec::with_capacity(capability_count.min(64));
        for _ in 0..capability_count {
            capabilities.push(reader.read_string()?);
        }

        let field_count = reader.read_u32()? as usize;
        let mut fields = Vec::with_capacity(field_count.min(256));
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let ty = TypeRef::parse(&reader.read_string()?)?;
            fields.push(FieldDef { name, ty });
        }

        let constants = ConstantPool::decode(&mut reader)?;

        let entry_count = reader.read_u32()? as usize;
        let mut entry_points = Vec::with_capacity(entry_count.min(256));
        for _ in 0..entry_count {
            entry_points.push(EntryPoint::decode(&mut reader)?);
        }

        Ok(Self {
            version,
            flags,
            name,
            super_unit,
            capabilities,
            fields,
            constants,
            entry_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn sample_unit() -> ModuleUnit {
        let mut unit = ModuleUnit::new("impl.Wrapper");
        unit.super_unit = Some("impl.Base".to_string());
        unit.capabilities.push("api.Wrapped".to_string());
        unit.fields.push(FieldDef {
            name: "n".to_string(),
            ty: TypeRef::Int,
        });
        let name = unit.constants.intern("square");

        let mut code = BytecodeWriter::new();
        code.emit_load_local(1);
        code.emit_load_local(0);
        code.emit_load_field(0);
        code.emit_call_method(name, 1);
        code.emit_opcode(Opcode::Return);

        unit.entry_points.push(EntryPoint {
            name: "apply".to_string(),
            signature: Signature::parse("(impl.Box)->int").unwrap(),
            flags: 0,
            local_count: 2,
            code: code.into_bytes(),
        });
        unit
    }

    #[test]
    fn test_unit_encoding() {
        let unit = sample_unit();
        let decoded = ModuleUnit::decode(&unit.encode()).unwrap();

        assert_eq!(decoded, unit);
        assert_eq!(decoded.super_unit.as_deref(), Some("impl.Base"));
        assert!(decoded.declares("api.Wrapped"));
        assert_eq!(
            decoded.find_exact("apply", &[TypeRef::named("impl.Box")]).map(|e| e.local_count),
            Some(2)
        );
    }

    #[test]
    fn test_unit_checksum_validation() {
        let mut bytes = sample_unit().encode();
        bytes[HEADER_SIZE + 2] ^= 0xFF;

        let result = ModuleUnit::decode(&bytes);
        assert!(matches!(result, Err(UnitError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic_number() {
        let mut bytes = b"XXXX".to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            ModuleUnit::decode(&bytes),
            Err(UnitError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            ModuleUnit::decode(&bytes),
            Err(UnitError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_unit() {
        let bytes = sample_unit().encode();
        let result = ModuleUnit::decode(&bytes[..10]);
        assert!(matches!(result, Err(UnitError::Decode(_))));
    }
}
