//! Value conformance against declared types
//!
//! Used by `CHECK_CAST`/`INSTANCE_OF` and by overload selection. A named type
//! matches exactly only objects of that type (or a subtype) defined in the
//! namespace doing the check; it matches by capability any object whose type
//! declares the name as an interface, wherever it was defined.

use sideload_bytecode::TypeRef;

use crate::namespace::NamespaceId;
use crate::value::Value;

/// How a value matches a declared type, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Conformance {
    /// Accepted without inspection (`any`, null for reference types,
    /// function values)
    Loose,
    /// Object declares the named capability
    Capability,
    /// Value is of the declared kind or named type
    Exact,
}

impl Conformance {
    /// Weight used to rank overloads
    pub fn score(self) -> u32 {
        match self {
            Conformance::Loose => 0,
            Conformance::Capability => 1,
            Conformance::Exact => 2,
        }
    }
}

/// Check `value` against `ty` as seen from `namespace`
pub fn conforms(value: &Value, ty: &TypeRef, namespace: NamespaceId) -> Option<Conformance> {
    match ty {
        TypeRef::Any => Some(Conformance::Loose),
        TypeRef::Void => value.is_null().then_some(Conformance::Loose),
        TypeRef::Int => matches!(value, Value::Int(_)).then_some(Conformance::Exact),
        TypeRef::Float => matches!(value, Value::Float(_)).then_some(Conformance::Exact),
        TypeRef::Bool => matches!(value, Value::Bool(_)).then_some(Conformance::Exact),
        TypeRef::Str => matches!(value, Value::Str(_)).then_some(Conformance::Exact),
        TypeRef::Function { .. } => Some(Conformance::Loose),
        TypeRef::Named(name) => match value {
            Value::Null => Some(Conformance::Loose),
            Value::Object(object) => {
                let ty = object.ty();
                if ty.namespace() == namespace && ty.is_subtype_of(name) {
                    Some(Conformance::Exact)
                } else if ty.conforms_to(name) {
                    Some(Conformance::Capability)
                } else {
                    None
                }
            }
            _ => None,
        },
        TypeRef::Array(element) => elements_conform(value, Some(element), namespace),
        TypeRef::Generic { args, .. } => match args.as_slice() {
            [element] => elements_conform(value, Some(element), namespace),
            // Multi-argument containers are opaque
            _ => elements_conform(value, None, namespace),
        },
    }
}

fn elements_conform(
    value: &Value,
    element: Option<&TypeRef>,
    namespace: NamespaceId,
) -> Option<Conformance> {
    match value {
        Value::Null => Some(Conformance::Loose),
        Value::Array(array) => {
            let Some(element) = element else {
                return Some(Conformance::Loose);
            };
            let elements = array.lock().clone();
            elements
                .iter()
                .all(|v| conforms(v, element, namespace).is_some())
                .then_some(Conformance::Exact)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::shared::SharedNamespace;
    use crate::value::Object;
    use sideload_bytecode::UnitBuilder;
    use std::sync::Arc;

    fn instance(ns: &SharedNamespace, name: &str, capability: Option<&str>) -> Value {
        let mut builder = UnitBuilder::new(name);
        if let Some(capability) = capability {
            builder = builder.implements(capability);
        }
        let handle = ns.define(&builder.encode().unwrap()).unwrap();
        Value::Object(Arc::new(Object::new(handle)))
    }

    fn ty(descriptor: &str) -> TypeRef {
        TypeRef::parse(descriptor).unwrap()
    }

    #[test]
    fn test_primitives() {
        let ns = NamespaceId::new();
        assert_eq!(conforms(&Value::Int(1), &TypeRef::Int, ns), Some(Conformance::Exact));
        assert_eq!(conforms(&Value::Int(1), &TypeRef::Float, ns), None);
        assert_eq!(conforms(&Value::Null, &TypeRef::Int, ns), None);
        assert_eq!(conforms(&Value::from("x"), &TypeRef::Any, ns), Some(Conformance::Loose));
    }

    #[test]
    fn test_named_types_respect_namespace() {
        let host = SharedNamespace::new();
        let other = SharedNamespace::new();
        let boxed = instance(&host, "impl.Box", Some("api.Boxed"));

        assert_eq!(conforms(&boxed, &ty("impl.Box"), host.id()), Some(Conformance::Exact));
        assert_eq!(conforms(&boxed, &ty("impl.Box"), other.id()), None);
        assert_eq!(
            conforms(&boxed, &ty("api.Boxed"), other.id()),
            Some(Conformance::Capability)
        );
        assert_eq!(conforms(&Value::Null, &ty("impl.Box"), host.id()), Some(Conformance::Loose));
    }

    #[test]
    fn test_array_elements_are_checked() {
        let host = SharedNamespace::new();
        let a = instance(&host, "impl.Box", None);
        let b = instance(&host, "impl.FakeBox", None);

        let good = Value::array(vec![a.clone(), a.clone()]);
        let bad = Value::array(vec![a, b]);
        assert_eq!(conforms(&good, &ty("impl.Box[]"), host.id()), Some(Conformance::Exact));
        assert_eq!(conforms(&bad, &ty("impl.Box[]"), host.id()), None);
        assert_eq!(conforms(&bad, &ty("List<impl.Box>"), host.id()), None);
        assert_eq!(
            conforms(&bad, &ty("Map<str,impl.Box>"), host.id()),
            Some(Conformance::Loose)
        );
    }

    #[test]
    fn test_self_containing_array() {
        let ns = NamespaceId::new();
        let array = Value::array(vec![Value::Null]);
        array.as_array().unwrap().lock()[0] = array.clone();

        assert_eq!(conforms(&array, &ty("any[][]"), ns), Some(Conformance::Exact));
        assert_eq!(conforms(&array, &ty("int[][]"), ns), None);
    }

    #[test]
    fn test_functions_pass_through() {
        let ns = NamespaceId::new();
        assert_eq!(
            conforms(&Value::Int(3), &ty("fn(impl.Box)->int"), ns),
            Some(Conformance::Loose)
        );
    }
}
