//! Runtime values and objects

use parking_lot::Mutex;
use sideload_bytecode::TypeRef;
use std::fmt;
use std::sync::Arc;

use crate::namespace::TypeHandle;

/// Shared, mutable array storage
pub type ArrayRef = Arc<Mutex<Vec<Value>>>;

/// A runtime value
#[derive(Clone, Default)]
pub enum Value {
    /// Null reference
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Object instance
    Object(Arc<Object>),
    /// Array
    Array(ArrayRef),
}

impl Value {
    /// Create an array value
    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Arc::new(Mutex::new(elements)))
    }

    /// Default value for a declared field type
    pub fn default_for(ty: &TypeRef) -> Self {
        match ty {
            TypeRef::Int => Value::Int(0),
            TypeRef::Float => Value::Float(0.0),
            TypeRef::Bool => Value::Bool(false),
            _ => Value::Null,
        }
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by conditional jumps
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            _ => true,
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float payload, widening integers
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Object payload
    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Array payload
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Short description used in cast and type errors
    ///
    /// Objects are described with their defining namespace, so that two
    /// types of the same name from different namespaces are told apart.
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::Object(o) => format!("{}@{}", o.ty().name(), o.ty().namespace()),
            Value::Array(a) => format!("array[{}]", a.lock().len()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Object(o) => write!(f, "Object({})", o.ty().name()),
            Value::Array(a) => {
                let elements = a.lock().clone();
                f.write_str("Array(")?;
                f.debug_list().entries(elements.iter().map(Shallow)).finish()?;
                f.write_str(")")
            }
        }
    }
}

/// Element of an array being formatted; nested arrays print only their length
struct Shallow<'a>(&'a Value);

impl fmt::Debug for Shallow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Array(a) => write!(f, "Array[{}]", a.lock().len()),
            other => write!(f, "{:?}", other),
        }
    }
}

impl fmt::Display for Shallow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Array(_) => f.write_str(&self.0.describe()),
            other => write!(f, "{}", other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Object(o) => write!(f, "[{}]", o.ty().name()),
            Value::Array(a) => {
                // Snapshot first: an element may be this very array
                let elements = a.lock().clone();
                f.write_str("[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", Shallow(element))?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::array(value)
    }
}

/// Object instance
///
/// Field slots are absolute: inherited fields come first, in super-unit
/// declaration order.
pub struct Object {
    ty: TypeHandle,
    fields: Mutex<Vec<Value>>,
}

impl Object {
    /// Allocate an instance with every field at its default value
    pub fn new(ty: TypeHandle) -> Self {
        let fields = ty.field_types().map(Value::default_for).collect();
        Self {
            ty,
            fields: Mutex::new(fields),
        }
    }

    /// Type of this instance
    pub fn ty(&self) -> &TypeHandle {
        &self.ty
    }

    /// Get a field value by index
    pub fn get_field(&self, index: usize) -> Option<Value> {
        self.fields.lock().get(index).cloned()
    }

    /// Set a field value by index
    pub fn set_field(&self, index: usize, value: Value) -> Result<(), String> {
        let mut fields = self.fields.lock();
        let count = fields.len();
        match fields.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(format!(
                "Field index {} out of bounds (object has {} fields)",
                index, count
            )),
        }
    }

    /// Get a field value by name, searching the type chain
    pub fn field(&self, name: &str) -> Option<Value> {
        self.ty.field_index(name).and_then(|i| self.get_field(i))
    }

    /// Get number of fields
    pub fn field_count(&self) -> usize {
        self.fields.lock().len()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("ty", &self.ty)
            .field("fields", &*self.fields.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_eq!(Value::from("a"), Value::from("a".to_string()));
        assert_ne!(Value::Null, Value::Bool(false));

        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::from("").is_truthy());
        assert!(Value::Bool(true).is_truthy());
    }

    #[test]
    fn test_display() {
        let array = Value::array(vec![Value::Int(1), Value::from("x"), Value::Null]);
        assert_eq!(array.to_string(), "[1, x, null]");
        assert_eq!(array.describe(), "array[3]");
        assert_eq!(Value::Float(2.5).describe(), "float");
    }

    #[test]
    fn test_self_containing_array_formats() {
        let array = Value::array(vec![Value::Null, Value::Int(7)]);
        let inner = array.as_array().unwrap().clone();
        inner.lock()[0] = array.clone();

        assert_eq!(array.to_string(), "[array[2], 7]");
        assert_eq!(format!("{:?}", array), "Array([Array[2], Int(7)])");

        let nested = Value::array(vec![Value::array(vec![Value::Int(1)])]);
        assert_eq!(nested.to_string(), "[array[1]]");
    }

    #[test]
    fn test_default_for_declared_type() {
        assert_eq!(Value::default_for(&TypeRef::Int), Value::Int(0));
        assert_eq!(Value::default_for(&TypeRef::named("impl.Box")), Value::Null);
    }
}
