//! Reflective construction bridge
//!
//! Name-based construction and invocation over any [`Namespace`]. Nothing is
//! checked ahead of time: constructors and overloads are picked from the
//! runtime values of the arguments on every call.

use tracing::trace;

use crate::error::BridgeError;
use crate::namespace::{Namespace, TypeHandle};
use crate::registry::CapabilityInterface;
use crate::value::Value;
use crate::vm::{Interpreter, VmError};

/// Call-time access to the types of one namespace
#[derive(Clone, Copy)]
pub struct Bridge<'ns> {
    namespace: &'ns dyn Namespace,
}

impl<'ns> Bridge<'ns> {
    /// Bridge over a context or the host namespace
    pub fn new(namespace: &'ns dyn Namespace) -> Self {
        Self { namespace }
    }

    fn interpreter(&self) -> Interpreter {
        Interpreter::for_namespace(self.namespace)
    }

    /// Resolve a type by name
    pub fn type_of(&self, name: &str) -> Result<TypeHandle, BridgeError> {
        Ok(self.namespace.resolve(name)?)
    }

    /// Instantiate a type with the best-matching constructor
    pub fn construct(&self, ty: &TypeHandle, args: Vec<Value>) -> Result<Value, BridgeError> {
        trace!(unit = ty.name(), arity = args.len(), "construct");
        let constructor = Interpreter::select_constructor(ty, &args)?;
        self.interpreter()
            .run_constructor(ty, constructor, args)
            .map_err(|cause| BridgeError::ConstructionFailed {
                unit: ty.name().to_string(),
                cause: Box::new(cause),
            })
    }

    /// Invoke a static operation by name
    pub fn invoke_static(
        &self,
        ty: &TypeHandle,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        trace!(unit = ty.name(), operation, "invoke static");
        Ok(self.interpreter().invoke_static(ty, operation, args)?)
    }

    /// Invoke an instance operation by name
    pub fn invoke(&self, instance: &Value, operation: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        trace!(operation, "invoke");
        Ok(self.interpreter().invoke(instance, operation, args)?)
    }

    /// View an instance through a capability interface
    ///
    /// Fails with `NotConforming` unless the instance's type declares the
    /// interface.
    pub fn as_interface<'a>(
        &self,
        instance: &Value,
        interface: &'a CapabilityInterface,
    ) -> Result<InterfaceView<'a>, BridgeError>
    where
        'ns: 'a,
    {
        let object = match instance {
            Value::Object(object) => object,
            Value::Null => return Err(BridgeError::Runtime(VmError::NullReference)),
            other => {
                return Err(BridgeError::NotConforming {
                    unit: other.describe(),
                    interface: interface.name.clone(),
                })
            }
        };

        if !object.ty().conforms_to(&interface.name) {
            return Err(BridgeError::NotConforming {
                unit: instance.describe(),
                interface: interface.name.clone(),
            });
        }

        Ok(InterfaceView {
            bridge: *self,
            instance: instance.clone(),
            interface,
        })
    }
}

/// An instance used where a capability interface is expected
pub struct InterfaceView<'a> {
    bridge: Bridge<'a>,
    instance: Value,
    interface: &'a CapabilityInterface,
}

impl<'a> InterfaceView<'a> {
    /// Invoke one of the interface's operations
    pub fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        if !self.interface.has_operation(operation) {
            return Err(BridgeError::NoSuchOperation {
                unit: self.interface.name.clone(),
                operation: operation.to_string(),
            });
        }
        self.bridge.invoke(&self.instance, operation, args)
    }

    /// The viewed instance
    pub fn instance(&self) -> &Value {
        &self.instance
    }

    /// Interface name
    pub fn interface_name(&self) -> &str {
        &self.interface.name
    }
}
