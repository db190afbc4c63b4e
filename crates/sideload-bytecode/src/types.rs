//! Type references and entry point signatures
//!
//! Types are stored in units as textual descriptors:
//!
//! ```text
//! int | float | bool | str | void | any     primitives
//! impl.Box                                  named (module unit or capability interface)
//! impl.Box[]                                array
//! List<impl.Box>                            generic container
//! fn(impl.Box,int)->int                     function
//! (fn(int)->int)[]                          parenthesized for arrays of functions
//! ```
//!
//! A signature is written `(param,param)->ret`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Deepest nesting of array, generic, function and parenthesized layers a
/// descriptor may have
pub const MAX_DESCRIPTOR_DEPTH: usize = 64;

/// Descriptor parse errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Input ended in the middle of a descriptor
    #[error("Unexpected end of descriptor '{0}'")]
    UnexpectedEnd(String),

    /// Unexpected character
    #[error("Unexpected '{found}' at {position} in descriptor '{input}'")]
    Unexpected {
        /// Full descriptor text
        input: String,
        /// Byte position
        position: usize,
        /// Offending character
        found: char,
    },

    /// Trailing characters after a complete descriptor
    #[error("Trailing input at {position} in descriptor '{input}'")]
    Trailing {
        /// Full descriptor text
        input: String,
        /// Byte position
        position: usize,
    },

    /// Descriptor nests deeper than [`MAX_DESCRIPTOR_DEPTH`]
    #[error("Descriptor nested deeper than {limit} levels at {position}")]
    TooDeep {
        /// Byte position
        position: usize,
        /// Nesting limit
        limit: usize,
    },
}

/// A reference to a type in a signature or field declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Boolean
    Bool,
    /// String
    Str,
    /// No value
    Void,
    /// Any value
    Any,
    /// Module unit or capability interface, by fully qualified name
    Named(String),
    /// Array of elements
    Array(Box<TypeRef>),
    /// Generic container instantiation
    Generic {
        /// Container name
        base: String,
        /// Type arguments
        args: Vec<TypeRef>,
    },
    /// Function value
    Function {
        /// Parameter types
        params: Vec<TypeRef>,
        /// Return type
        ret: Box<TypeRef>,
    },
}

impl TypeRef {
    /// Shorthand for a named type
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    /// Parse a descriptor
    pub fn parse(input: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(input);
        let ty = parser.parse_type()?;
        parser.finish()?;
        Ok(ty)
    }

    /// The name, if this is a named type
    pub fn as_named(&self) -> Option<&str> {
        match self {
            TypeRef::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Whether values of this type are references (nullable)
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeRef::Named(_) | TypeRef::Array(_) | TypeRef::Generic { .. } | TypeRef::Function { .. }
        )
    }

    /// Deepest nesting level at which a named type satisfying `pred` occurs
    ///
    /// `0` means the type itself is such a name, `1` means it occurs directly
    /// inside one array, generic or function layer, and so on. `None` when it
    /// does not occur at all.
    pub fn mapped_depth(&self, pred: &dyn Fn(&str) -> bool) -> Option<usize> {
        match self {
            TypeRef::Named(name) => pred(name).then_some(0),
            TypeRef::Array(elem) => elem.mapped_depth(pred).map(|d| d + 1),
            TypeRef::Generic { args, .. } => args
                .iter()
                .filter_map(|arg| arg.mapped_depth(pred))
                .max()
                .map(|d| d + 1),
            TypeRef::Function { params, ret } => params
                .iter()
                .chain(std::iter::once(ret.as_ref()))
                .filter_map(|t| t.mapped_depth(pred))
                .max()
                .map(|d| d + 1),
            _ => None,
        }
    }

    /// Replace every named type for which `map` returns a substitute
    pub fn substitute(&self, map: &dyn Fn(&str) -> Option<String>) -> TypeRef {
        match self {
            TypeRef::Named(name) => map(name).map(TypeRef::Named).unwrap_or_else(|| self.clone()),
            TypeRef::Array(elem) => TypeRef::Array(Box::new(elem.substitute(map))),
            TypeRef::Generic { base, args } => TypeRef::Generic {
                base: base.clone(),
                args: args.iter().map(|a| a.substitute(map)).collect(),
            },
            TypeRef::Function { params, ret } => TypeRef::Function {
                params: params.iter().map(|p| p.substitute(map)).collect(),
                ret: Box::new(ret.substitute(map)),
            },
            _ => self.clone(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Int => f.write_str("int"),
            TypeRef::Float => f.write_str("float"),
            TypeRef::Bool => f.write_str("bool"),
            TypeRef::Str => f.write_str("str"),
            TypeRef::Void => f.write_str("void"),
            TypeRef::Any => f.write_str("any"),
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::Array(elem) => match elem.as_ref() {
                TypeRef::Function { .. } => write!(f, "({})[]", elem),
                _ => write!(f, "{}[]", elem),
            },
            TypeRef::Generic { base, args } => {
                write!(f, "{}<", base)?;
                write_list(f, args)?;
                f.write_str(">")
            }
            TypeRef::Function { params, ret } => {
                f.write_str("fn(")?;
                write_list(f, params)?;
                write!(f, ")->{}", ret)
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[TypeRef]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl FromStr for TypeRef {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeRef::parse(s)
    }
}

impl TryFrom<String> for TypeRef {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TypeRef::parse(&value)
    }
}

impl From<TypeRef> for String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

/// Parameter and return types of an entry point or interface operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    /// Ordered parameter types (receiver excluded)
    pub params: Vec<TypeRef>,
    /// Return type
    pub ret: TypeRef,
}

impl Signature {
    /// Create a signature
    pub fn new(params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self { params, ret }
    }

    /// Parse a `(p1,p2)->ret` signature descriptor
    pub fn parse(input: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(input);
        parser.expect('(')?;
        let params = parser.parse_list(')')?;
        parser.expect('-')?;
        parser.expect('>')?;
        let ret = parser.parse_type()?;
        parser.finish()?;
        Ok(Self { params, ret })
    }

    /// Number of parameters
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        write_list(f, &self.params)?;
        write!(f, ")->{}", self.ret)
    }
}

impl FromStr for Signature {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Signature::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.to_string()
    }
}

/// Recursive-descent descriptor parser
struct Parser<'a> {
    input: &'a str,
    position: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            position: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    fn end_error(&self) -> DescriptorError {
        DescriptorError::UnexpectedEnd(self.input.to_string())
    }

    fn unexpected(&self, found: char) -> DescriptorError {
        DescriptorError::Unexpected {
            input: self.input.to_string(),
            position: self.position,
            found,
        }
    }

    fn expect(&mut self, want: char) -> Result<(), DescriptorError> {
        match self.peek() {
            Some(c) if c == want => {
                self.position += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(self.unexpected(c)),
            None => Err(self.end_error()),
        }
    }

    fn too_deep(&self) -> DescriptorError {
        DescriptorError::TooDeep {
            position: self.position,
            limit: MAX_DESCRIPTOR_DEPTH,
        }
    }

    fn finish(&self) -> Result<(), DescriptorError> {
        if self.position < self.input.len() {
            return Err(DescriptorError::Trailing {
                input: self.input.to_string(),
                position: self.position,
            });
        }
        Ok(())
    }

    fn parse_type(&mut self) -> Result<TypeRef, DescriptorError> {
        self.depth += 1;
        if self.depth > MAX_DESCRIPTOR_DEPTH {
            return Err(self.too_deep());
        }

        let mut ty = self.parse_base()?;
        let mut layers = self.depth;
        while self.rest().starts_with("[]") {
            layers += 1;
            if layers > MAX_DESCRIPTOR_DEPTH {
                return Err(self.too_deep());
            }
            self.position += 2;
            ty = TypeRef::Array(Box::new(ty));
        }

        self.depth -= 1;
        Ok(ty)
    }

    fn parse_base(&mut self) -> Result<TypeRef, DescriptorError> {
        if self.rest().starts_with("fn(") {
            self.position += 3;
            let params = self.parse_list(')')?;
            self.expect('-')?;
            self.expect('>')?;
            let ret = self.parse_type()?;
            return Ok(TypeRef::Function {
                params,
                ret: Box::new(ret),
            });
        }

        if self.peek() == Some('(') {
            self.position += 1;
            let inner = self.parse_type()?;
            self.expect(')')?;
            return Ok(inner);
        }

        let ident = self.parse_ident()?;
        if self.peek() == Some('<') {
            self.position += 1;
            let args = self.parse_list('>')?;
            if args.is_empty() {
                return Err(self.unexpected('>'));
            }
            return Ok(TypeRef::Generic { base: ident, args });
        }

        Ok(match ident.as_str() {
            "int" => TypeRef::Int,
            "float" => TypeRef::Float,
            "bool" => TypeRef::Bool,
            "str" => TypeRef::Str,
            "void" => TypeRef::Void,
            "any" => TypeRef::Any,
            _ => TypeRef::Named(ident),
        })
    }

    /// Parse a comma separated list up to and including `close`
    fn parse_list(&mut self, close: char) -> Result<Vec<TypeRef>, DescriptorError> {
        let mut items = Vec::new();
        if self.peek() == Some(close) {
            self.position += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_type()?);
            match self.peek() {
                Some(',') => self.position += 1,
                Some(c) if c == close => {
                    self.position += 1;
                    return Ok(items);
                }
                Some(c) => return Err(self.unexpected(c)),
                None => return Err(self.end_error()),
            }
        }
    }

    fn parse_ident(&mut self) -> Result<String, DescriptorError> {
        let start = self.position;
        while let Some(c) = self.peek() {
            let ok = if self.position == start {
                c.is_alphabetic() || c == '_' || c == '$'
            } else {
                c.is_alphanumeric() || matches!(c, '_' | '$' | '.')
            };
            if !ok {
                break;
            }
            self.position += c.len_utf8();
        }
        if self.position == start {
            return match self.peek() {
                Some(c) => Err(self.unexpected(c)),
                None => Err(self.end_error()),
            };
        }
        Ok(self.input[start..self.position].to_string())
    }
}
