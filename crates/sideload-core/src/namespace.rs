//! Namespaces and defined type handles
//!
//! A namespace owns a set of defined units keyed by name. Type identity is
//! the pair (namespace, name): the same unit defined in two namespaces gives
//! two distinct, non-interchangeable types even when the bytes are identical.

use sideload_bytecode::{EntryPoint, ModuleUnit, TypeRef};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::DEFAULT_MAX_CALL_DEPTH;
use crate::error::LoadError;
use crate::rewrite::RewriteReport;

/// Global counter for namespace IDs
static NEXT_NAMESPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique namespace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(u64);

impl NamespaceId {
    /// Generate a new unique namespace ID
    pub fn new() -> Self {
        Self(NEXT_NAMESPACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns{}", self.0)
    }
}

/// Something that defines types by name
pub trait Namespace: Send + Sync {
    /// Namespace identity
    fn id(&self) -> NamespaceId;

    /// Resolve a name to its defined type
    fn resolve(&self, name: &str) -> Result<TypeHandle, LoadError>;

    /// Interpreter call depth bound for code defined here
    fn max_call_depth(&self) -> usize {
        DEFAULT_MAX_CALL_DEPTH
    }
}

/// A unit as defined in one namespace
pub struct DefinedType {
    namespace: NamespaceId,
    origin: Weak<dyn Namespace>,
    unit: ModuleUnit,
    super_type: Option<TypeHandle>,
    field_base: usize,
    report: RewriteReport,
    digest: String,
}

impl DefinedType {
    /// Assemble a definition
    ///
    /// `super_type` must already be defined in the same namespace.
    pub fn new(
        namespace: NamespaceId,
        origin: Weak<dyn Namespace>,
        unit: ModuleUnit,
        super_type: Option<TypeHandle>,
        report: RewriteReport,
        digest: String,
    ) -> Self {
        let field_base = super_type.as_ref().map_or(0, TypeHandle::field_count);
        Self {
            namespace,
            origin,
            unit,
            super_type,
            field_base,
            report,
            digest,
        }
    }
}

/// Runtime handle to a defined unit
///
/// Cheap to clone. The owning namespace keeps one clone for its lifetime;
/// callers and bridges hold further clones.
#[derive(Clone)]
pub struct TypeHandle(Arc<DefinedType>);

impl TypeHandle {
    /// Wrap a definition
    pub fn new(defined: DefinedType) -> Self {
        Self(Arc::new(defined))
    }

    /// Fully qualified name
    pub fn name(&self) -> &str {
        &self.0.unit.name
    }

    /// Namespace the type is defined in
    pub fn namespace(&self) -> NamespaceId {
        self.0.namespace
    }

    /// The namespace itself, while it is alive
    pub fn origin(&self) -> Option<Arc<dyn Namespace>> {
        self.0.origin.upgrade()
    }

    /// Defined (rewritten) unit
    pub fn unit(&self) -> &ModuleUnit {
        &self.0.unit
    }

    /// Super type, if any
    pub fn super_type(&self) -> Option<&TypeHandle> {
        self.0.super_type.as_ref()
    }

    /// Rewrite report produced when the type was defined
    pub fn report(&self) -> &RewriteReport {
        &self.0.report
    }

    /// SHA-256 of the defined byte form, hex encoded
    pub fn digest(&self) -> &str {
        &self.0.digest
    }

    /// Whether both handles share the same definition
    pub fn ptr_eq(a: &TypeHandle, b: &TypeHandle) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// This type followed by its super types
    pub fn ancestry(&self) -> Ancestry<'_> {
        Ancestry { next: Some(self) }
    }

    /// Whether this type is `name` or inherits from it
    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.ancestry().any(|t| t.name() == name)
    }

    /// Whether this type or a super type declares the capability
    pub fn conforms_to(&self, capability: &str) -> bool {
        self.ancestry().any(|t| t.unit().declares(capability))
    }

    /// Total field count, inherited fields included
    pub fn field_count(&self) -> usize {
        self.0.field_base + self.0.unit.fields.len()
    }

    /// Absolute index of the first field declared by this type
    pub fn field_base(&self) -> usize {
        self.0.field_base
    }

    /// Declared field types in slot order
    pub fn field_types(&self) -> impl Iterator<Item = &TypeRef> {
        let mut chain: Vec<&TypeHandle> = self.ancestry().collect();
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|t| t.unit().fields.iter().map(|f| &f.ty))
    }

    /// Absolute slot of a field, the most derived declaration winning
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.ancestry().find_map(|t| {
            t.unit()
                .fields
                .iter()
                .position(|f| f.name == name)
                .map(|i| t.field_base() + i)
        })
    }

    /// Constructors declared by this type itself
    pub fn constructors(&self) -> impl Iterator<Item = &EntryPoint> {
        self.unit()
            .entry_points
            .iter()
            .filter(|e| e.is_constructor())
    }
}

/// Iterator over a type and its super types
pub struct Ancestry<'a> {
    next: Option<&'a TypeHandle>,
}

impl<'a> Iterator for Ancestry<'a> {
    type Item = &'a TypeHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.super_type();
        Some(current)
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.namespace() == other.namespace() && self.name() == other.name()
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace().hash(state);
        self.name().hash(state);
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHandle({}@{})", self.name(), self.namespace())
    }
}

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sideload_bytecode::UnitBuilder;

    struct Detached;

    impl Namespace for Detached {
        fn id(&self) -> NamespaceId {
            NamespaceId(0)
        }

        fn resolve(&self, name: &str) -> Result<TypeHandle, LoadError> {
            Err(LoadError::NotFound(name.to_string()))
        }
    }

    fn define(ns: NamespaceId, unit: ModuleUnit, super_type: Option<TypeHandle>) -> TypeHandle {
        let origin: Weak<dyn Namespace> = Weak::<Detached>::new();
        TypeHandle::new(DefinedType::new(
            ns,
            origin,
            unit,
            super_type,
            RewriteReport::default(),
            String::new(),
        ))
    }

    #[test]
    fn test_namespace_id_uniqueness() {
        let id1 = NamespaceId::new();
        let id2 = NamespaceId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_identity_includes_namespace() {
        let unit = UnitBuilder::new("impl.Box").build().unwrap();
        let a = define(NamespaceId::new(), unit.clone(), None);
        let b = define(NamespaceId::new(), unit, None);

        assert_eq!(a, a.clone());
        assert!(TypeHandle::ptr_eq(&a, &a.clone()));
        assert_ne!(a, b);
        assert!(a.origin().is_none());
    }

    #[test]
    fn test_fields_follow_super_chain() {
        let ns = NamespaceId::new();
        let base = UnitBuilder::new("impl.Shape")
            .field("id", "int")
            .implements("api.Named")
            .build()
            .unwrap();
        let derived = UnitBuilder::new("impl.Square")
            .extends("impl.Shape")
            .field("side", "float")
            .field("label", "str")
            .build()
            .unwrap();

        let base = define(ns, base, None);
        let square = define(ns, derived, Some(base));

        assert_eq!(square.field_count(), 3);
        assert_eq!(square.field_base(), 1);
        assert_eq!(square.field_index("id"), Some(0));
        assert_eq!(square.field_index("label"), Some(2));
        assert_eq!(
            square.field_types().cloned().collect::<Vec<_>>(),
            vec![TypeRef::Int, TypeRef::Float, TypeRef::Str]
        );
        assert!(square.is_subtype_of("impl.Shape"));
        assert!(square.conforms_to("api.Named"));
        assert!(!square.conforms_to("api.Boxed"));
    }
}
