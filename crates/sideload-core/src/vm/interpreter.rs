//! Stack interpreter
//!
//! Calls made by bytecode never recurse on the native stack: each entry point
//! runs in a [`CallFrame`] (operand stack plus locals) kept on a heap frame
//! stack, bounded by the namespace's call depth limit. Type names in `NEW`
//! and `CALL_STATIC` resolve through the namespace that defined the
//! executing code.

use sideload_bytecode::{
    BytecodeReader, ConstantPool, DecodeError, EntryPoint, Opcode, Signature, TypeRef, CONSTRUCTOR,
    MAX_LOCALS,
};
use std::sync::Arc;
use tracing::trace;

use super::conform::conforms;
use super::{VmError, VmResult};
use crate::config::MAX_CALL_DEPTH;
use crate::namespace::{Namespace, NamespaceId, TypeHandle};
use crate::value::{Object, Value};

/// What the caller receives when a frame returns
#[derive(Debug)]
enum ReturnAction {
    /// The callee's return value
    PushReturnValue,
    /// The instance a constructor ran on
    PushObject(Value),
    /// `null`, after a super constructor
    PushNull,
}

/// An entry point being executed
#[derive(Debug)]
struct CallFrame {
    owner: TypeHandle,
    /// Index into the owner's entry point table
    entry: usize,
    ip: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
    return_action: ReturnAction,
}

impl CallFrame {
    fn new(
        owner: &TypeHandle,
        entry: &EntryPoint,
        receiver: Option<Value>,
        args: Vec<Value>,
        return_action: ReturnAction,
    ) -> VmResult<Self> {
        let index = owner
            .unit()
            .entry_points
            .iter()
            .position(|e| std::ptr::eq(e, entry))
            .ok_or_else(|| {
                VmError::InvalidBytecode(format!(
                    "{}{} is not an entry point of {}",
                    entry.name,
                    entry.signature,
                    owner.name()
                ))
            })?;

        let first = entry.first_param_slot();
        let slots = entry.local_count.max(first + args.len()).max(1);
        if slots > MAX_LOCALS {
            return Err(VmError::InvalidBytecode(format!(
                "{} declares {} locals",
                entry.name, slots
            )));
        }

        let mut locals = vec![Value::Null; slots];
        if let Some(receiver) = receiver {
            locals[0] = receiver;
        }
        for (i, arg) in args.into_iter().enumerate() {
            locals[first + i] = arg;
        }

        Ok(Self {
            owner: owner.clone(),
            entry: index,
            ip: 0,
            locals,
            stack: Vec::with_capacity(8),
            return_action,
        })
    }

    fn entry(&self) -> &EntryPoint {
        &self.owner.unit().entry_points[self.entry]
    }
}

/// Outcome of setting up a call
enum Call {
    /// Entry point to run in a new frame
    Frame(CallFrame),
    /// Finished without running any code
    Done(Value),
}

/// How the current frame stopped
enum Transfer {
    Call(CallFrame),
    Return(Value),
}

/// Bytecode interpreter
#[derive(Debug)]
pub struct Interpreter {
    max_call_depth: usize,
}

impl Interpreter {
    /// Create an interpreter with the given call depth bound
    ///
    /// The bound is capped at [`MAX_CALL_DEPTH`].
    pub fn new(max_call_depth: usize) -> Self {
        Self {
            max_call_depth: max_call_depth.min(MAX_CALL_DEPTH),
        }
    }

    /// Create an interpreter using the namespace's call depth bound
    pub fn for_namespace(namespace: &dyn Namespace) -> Self {
        Self::new(namespace.max_call_depth())
    }

    /// Effective call depth bound
    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    // ===== Overload selection =====

    /// Pick the best entry point for the arguments
    ///
    /// Arity must match and every argument must conform to its parameter.
    /// Among several candidates the one whose parameters match most
    /// specifically wins; ties go to the first candidate.
    pub fn select<'t>(
        candidates: impl IntoIterator<Item = (&'t TypeHandle, &'t EntryPoint)>,
        args: &[Value],
        namespace: NamespaceId,
    ) -> Option<(&'t TypeHandle, &'t EntryPoint)> {
        let mut best: Option<((&'t TypeHandle, &'t EntryPoint), u32)> = None;

        for (owner, entry) in candidates {
            if entry.signature.arity() != args.len() {
                continue;
            }
            let score = entry
                .signature
                .params
                .iter()
                .zip(args)
                .map(|(param, arg)| conforms(arg, param, namespace).map(|c| c.score()))
                .sum::<Option<u32>>();
            if let Some(score) = score {
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some(((owner, entry), score));
                }
            }
        }

        best.map(|(candidate, _)| candidate)
    }

    /// Instance entry points named `name`, most derived first
    pub fn instance_candidates<'t>(
        ty: &'t TypeHandle,
        name: &'t str,
    ) -> impl Iterator<Item = (&'t TypeHandle, &'t EntryPoint)> {
        ty.ancestry().flat_map(move |t| {
            t.unit()
                .entry_points_named(name)
                .filter(|e| !e.is_static() && !e.is_constructor())
                .map(move |e| (t, e))
        })
    }

    /// Static entry points named `name`, most derived first
    pub fn static_candidates<'t>(
        ty: &'t TypeHandle,
        name: &'t str,
    ) -> impl Iterator<Item = (&'t TypeHandle, &'t EntryPoint)> {
        ty.ancestry().flat_map(move |t| {
            t.unit()
                .entry_points_named(name)
                .filter(|e| e.is_static())
                .map(move |e| (t, e))
        })
    }

    /// Constructor for the arguments
    ///
    /// `None` means default construction: the type declares no constructor
    /// and no arguments were given.
    pub fn select_constructor<'t>(
        ty: &'t TypeHandle,
        args: &[Value],
    ) -> VmResult<Option<&'t EntryPoint>> {
        let mut constructors = ty.constructors().peekable();
        if constructors.peek().is_none() && args.is_empty() {
            return Ok(None);
        }

        Self::select(constructors.map(|e| (ty, e)), args, ty.namespace())
            .map(|(_, entry)| Some(entry))
            .ok_or_else(|| VmError::NoMatchingConstructor {
                unit: ty.name().to_string(),
                arity: args.len(),
            })
    }

    // ===== Calls =====

    /// Invoke an instance operation with dynamic dispatch
    pub fn invoke(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let frame = Self::method_call(receiver.clone(), name, args)?;
        self.run(frame)
    }

    /// Invoke a static operation
    pub fn invoke_static(&mut self, ty: &TypeHandle, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let frame = Self::static_call(ty, name, args)?;
        self.run(frame)
    }

    /// Allocate an instance and run the chosen constructor on it
    pub fn run_constructor(
        &mut self,
        ty: &TypeHandle,
        constructor: Option<&EntryPoint>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        match Self::instantiate(ty, constructor, args)? {
            Call::Frame(frame) => self.run(frame),
            Call::Done(instance) => Ok(instance),
        }
    }

    /// Instantiate a type with the best-matching constructor
    pub fn construct(&mut self, ty: &TypeHandle, args: Vec<Value>) -> VmResult<Value> {
        let constructor = Self::select_constructor(ty, &args)?;
        self.run_constructor(ty, constructor, args)
    }

    /// Execute one entry point of `owner`
    pub fn execute(
        &mut self,
        owner: &TypeHandle,
        entry: &EntryPoint,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let frame = CallFrame::new(owner, entry, receiver, args, ReturnAction::PushReturnValue)?;
        self.run(frame)
    }

    /// Frame for an instance call on `receiver`
    fn method_call(receiver: Value, name: &str, args: Vec<Value>) -> VmResult<CallFrame> {
        let ty = match &receiver {
            Value::Object(object) => object.ty().clone(),
            Value::Null => return Err(VmError::NullReference),
            other => {
                return Err(VmError::TypeError(format!(
                    "Cannot call {} on {}",
                    name,
                    other.describe()
                )))
            }
        };
        Self::dispatch(&ty, receiver, name, args)
    }

    /// Frame for an instance call, starting the lookup at `ty`
    fn dispatch(ty: &TypeHandle, receiver: Value, name: &str, args: Vec<Value>) -> VmResult<CallFrame> {
        let candidates: Vec<_> = Self::instance_candidates(ty, name).collect();
        if candidates.is_empty() {
            return Err(VmError::NoSuchOperation {
                unit: ty.name().to_string(),
                operation: name.to_string(),
            });
        }

        let (owner, entry) = Self::select(candidates, &args, ty.namespace()).ok_or_else(|| {
            VmError::NoMatchingOverload {
                unit: ty.name().to_string(),
                operation: name.to_string(),
                arity: args.len(),
            }
        })?;
        CallFrame::new(owner, entry, Some(receiver), args, ReturnAction::PushReturnValue)
    }

    /// Frame for a static call
    fn static_call(ty: &TypeHandle, name: &str, args: Vec<Value>) -> VmResult<CallFrame> {
        let candidates: Vec<_> = Self::static_candidates(ty, name).collect();
        if candidates.is_empty() {
            return Err(VmError::NoSuchOperation {
                unit: ty.name().to_string(),
                operation: name.to_string(),
            });
        }

        let (owner, entry) = Self::select(candidates, &args, ty.namespace()).ok_or_else(|| {
            VmError::NoMatchingOverload {
                unit: ty.name().to_string(),
                operation: name.to_string(),
                arity: args.len(),
            }
        })?;
        CallFrame::new(owner, entry, None, args, ReturnAction::PushReturnValue)
    }

    /// Allocate an instance; the frame, if any, runs its constructor
    fn instantiate(ty: &TypeHandle, constructor: Option<&EntryPoint>, args: Vec<Value>) -> VmResult<Call> {
        let instance = Value::Object(Arc::new(Object::new(ty.clone())));
        match constructor {
            Some(constructor) => Ok(Call::Frame(CallFrame::new(
                ty,
                constructor,
                Some(instance.clone()),
                args,
                ReturnAction::PushObject(instance),
            )?)),
            None => Ok(Call::Done(instance)),
        }
    }

    /// `CALL_SUPER`: dispatch on the super type of the code's owner
    fn super_call(owner: &TypeHandle, receiver: Value, name: &str, args: Vec<Value>) -> VmResult<Call> {
        let parent = owner.super_type().ok_or_else(|| VmError::NoSuchOperation {
            unit: owner.name().to_string(),
            operation: format!("super.{}", name),
        })?;

        if name == CONSTRUCTOR {
            return match Self::select_constructor(parent, &args)? {
                Some(constructor) => Ok(Call::Frame(CallFrame::new(
                    parent,
                    constructor,
                    Some(receiver),
                    args,
                    ReturnAction::PushNull,
                )?)),
                None => Ok(Call::Done(Value::Null)),
            };
        }

        Self::dispatch(parent, receiver, name, args).map(Call::Frame)
    }

    /// `CALL_EXACT`: call the entry point with exactly this signature
    ///
    /// Constructors bind to the code's owner; methods dispatch on the
    /// receiver's type.
    fn exact_call(
        owner: &TypeHandle,
        receiver: Value,
        name: &str,
        signature: &Signature,
        args: Vec<Value>,
    ) -> VmResult<CallFrame> {
        let not_found = |ty: &TypeHandle| VmError::NoSuchOperation {
            unit: ty.name().to_string(),
            operation: format!("{}{}", name, signature),
        };

        if name == CONSTRUCTOR {
            let constructor = owner
                .constructors()
                .find(|e| e.signature.params == signature.params)
                .ok_or_else(|| not_found(owner))?;
            return CallFrame::new(owner, constructor, Some(receiver), args, ReturnAction::PushNull);
        }

        let ty = expect_object(&receiver)?.ty().clone();
        let (target, entry) = ty
            .ancestry()
            .find_map(|t| {
                t.unit()
                    .entry_points_named(name)
                    .find(|e| !e.is_static() && e.signature.params == signature.params)
                    .map(|e| (t, e))
            })
            .ok_or_else(|| not_found(&ty))?;
        CallFrame::new(target, entry, Some(receiver), args, ReturnAction::PushReturnValue)
    }

    fn resolve_in(owner: &TypeHandle, name: &str) -> VmResult<TypeHandle> {
        let namespace = owner
            .origin()
            .ok_or_else(|| VmError::NamespaceDropped(owner.name().to_string()))?;
        Ok(namespace.resolve(name)?)
    }

    // ===== Execution loop =====

    /// Run `frame` and every frame it calls until it returns
    fn run(&mut self, frame: CallFrame) -> VmResult<Value> {
        if self.max_call_depth == 0 {
            return Err(VmError::CallDepthExceeded(0));
        }

        let mut frame = frame;
        let mut callers: Vec<CallFrame> = Vec::new();
        trace!(unit = frame.owner.name(), entry = %frame.entry().name, depth = 0, "execute");

        loop {
            match Self::step(&mut frame)? {
                Transfer::Call(callee) => {
                    if callers.len() + 1 >= self.max_call_depth {
                        return Err(VmError::CallDepthExceeded(self.max_call_depth));
                    }
                    trace!(
                        unit = callee.owner.name(),
                        entry = %callee.entry().name,
                        signature = %callee.entry().signature,
                        depth = callers.len() + 1,
                        "execute"
                    );
                    callers.push(std::mem::replace(&mut frame, callee));
                }
                Transfer::Return(value) => {
                    let value = match std::mem::replace(
                        &mut frame.return_action,
                        ReturnAction::PushReturnValue,
                    ) {
                        ReturnAction::PushReturnValue => value,
                        ReturnAction::PushObject(object) => object,
                        ReturnAction::PushNull => Value::Null,
                    };
                    match callers.pop() {
                        Some(caller) => {
                            frame = caller;
                            frame.stack.push(value);
                        }
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    /// Execute instructions of `frame` until it calls or returns
    fn step(frame: &mut CallFrame) -> VmResult<Transfer> {
        let CallFrame {
            owner,
            entry,
            ip,
            locals,
            stack,
            ..
        } = frame;
        let owner: &TypeHandle = owner;
        let unit = owner.unit();
        let pool = &unit.constants;
        let mut reader = BytecodeReader::new(&unit.entry_points[*entry].code);
        reader.seek(*ip);

        while reader.has_more() {
            let opcode = reader.read_opcode().map_err(invalid)?;

            match opcode {
                // Stack manipulation
                Opcode::Nop => {}
                Opcode::Pop => {
                    pop(stack)?;
                }
                Opcode::Dup => {
                    let top = stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                    stack.push(top);
                }
                Opcode::Swap => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(b);
                    stack.push(a);
                }

                // Constants
                Opcode::ConstNull => stack.push(Value::Null),
                Opcode::ConstTrue => stack.push(Value::Bool(true)),
                Opcode::ConstFalse => stack.push(Value::Bool(false)),
                Opcode::ConstI32 => {
                    let value = reader.read_i32().map_err(invalid)?;
                    stack.push(Value::Int(value as i64));
                }
                Opcode::ConstF64 => {
                    let value = reader.read_f64().map_err(invalid)?;
                    stack.push(Value::Float(value));
                }
                Opcode::ConstStr => {
                    let index = reader.read_u32().map_err(invalid)?;
                    stack.push(Value::from(string(pool, index)?));
                }
                Opcode::LoadConst => {
                    let index = reader.read_u32().map_err(invalid)?;
                    let value = pool.get_integer(index).ok_or_else(|| {
                        VmError::InvalidBytecode(format!("No integer constant {}", index))
                    })?;
                    stack.push(Value::Int(value));
                }

                // Locals
                Opcode::LoadLocal => {
                    let index = reader.read_u16().map_err(invalid)? as usize;
                    stack.push(local(locals, index)?);
                }
                Opcode::StoreLocal => {
                    let index = reader.read_u16().map_err(invalid)? as usize;
                    store_local(locals, index, pop(stack)?)?;
                }
                Opcode::LoadLocal0 => stack.push(local(locals, 0)?),
                Opcode::LoadLocal1 => stack.push(local(locals, 1)?),
                Opcode::StoreLocal0 => store_local(locals, 0, pop(stack)?)?,
                Opcode::StoreLocal1 => store_local(locals, 1, pop(stack)?)?,

                // Integer arithmetic
                Opcode::Iadd => int_op(stack, |a, b| Ok(a.wrapping_add(b)))?,
                Opcode::Isub => int_op(stack, |a, b| Ok(a.wrapping_sub(b)))?,
                Opcode::Imul => int_op(stack, |a, b| Ok(a.wrapping_mul(b)))?,
                Opcode::Idiv => int_op(stack, |a, b| {
                    if b == 0 {
                        Err(VmError::DivisionByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                Opcode::Imod => int_op(stack, |a, b| {
                    if b == 0 {
                        Err(VmError::DivisionByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                Opcode::Ineg => {
                    let a = pop_int(stack)?;
                    stack.push(Value::Int(a.wrapping_neg()));
                }

                // Float arithmetic
                Opcode::Fadd => float_op(stack, |a, b| Value::Float(a + b))?,
                Opcode::Fsub => float_op(stack, |a, b| Value::Float(a - b))?,
                Opcode::Fmul => float_op(stack, |a, b| Value::Float(a * b))?,
                Opcode::Fdiv => float_op(stack, |a, b| Value::Float(a / b))?,
                Opcode::Fneg => {
                    let a = pop_float(stack)?;
                    stack.push(Value::Float(-a));
                }

                // Comparison
                Opcode::Ieq => int_cmp(stack, |a, b| a == b)?,
                Opcode::Ine => int_cmp(stack, |a, b| a != b)?,
                Opcode::Ilt => int_cmp(stack, |a, b| a < b)?,
                Opcode::Ile => int_cmp(stack, |a, b| a <= b)?,
                Opcode::Igt => int_cmp(stack, |a, b| a > b)?,
                Opcode::Ige => int_cmp(stack, |a, b| a >= b)?,
                Opcode::Feq => float_op(stack, |a, b| Value::Bool(a == b))?,
                Opcode::Flt => float_op(stack, |a, b| Value::Bool(a < b))?,
                Opcode::Fgt => float_op(stack, |a, b| Value::Bool(a > b))?,
                Opcode::Eq => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::Bool(a == b));
                }
                Opcode::Ne => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::Bool(a != b));
                }

                // Logical
                Opcode::Not => {
                    let a = pop(stack)?;
                    stack.push(Value::Bool(!a.is_truthy()));
                }
                Opcode::And => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Opcode::Or => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }

                // Strings
                Opcode::Sconcat => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::from(format!("{}{}", a, b)));
                }
                Opcode::Slen => {
                    let a = pop(stack)?;
                    let s = a
                        .as_str()
                        .ok_or_else(|| VmError::TypeError(format!("Expected str, got {}", a.describe())))?;
                    stack.push(Value::Int(s.chars().count() as i64));
                }
                Opcode::ToString => {
                    let a = pop(stack)?;
                    stack.push(Value::from(a.to_string()));
                }

                // Control flow
                Opcode::Jmp => {
                    let offset = reader.read_i32().map_err(invalid)?;
                    jump(&mut reader, offset)?;
                }
                Opcode::JmpIfFalse | Opcode::JmpIfTrue | Opcode::JmpIfNull | Opcode::JmpIfNotNull => {
                    let offset = reader.read_i32().map_err(invalid)?;
                    let value = pop(stack)?;
                    let taken = match opcode {
                        Opcode::JmpIfFalse => !value.is_truthy(),
                        Opcode::JmpIfTrue => value.is_truthy(),
                        Opcode::JmpIfNull => value.is_null(),
                        _ => !value.is_null(),
                    };
                    if taken {
                        jump(&mut reader, offset)?;
                    }
                }

                // Calls
                Opcode::CallMethod => {
                    let name = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let argc = reader.read_u16().map_err(invalid)? as usize;
                    let args = pop_n(stack, argc)?;
                    let receiver = pop(stack)?;
                    let callee = Self::method_call(receiver, name, args)?;
                    *ip = reader.position();
                    return Ok(Transfer::Call(callee));
                }
                Opcode::CallSuper => {
                    let name = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let argc = reader.read_u16().map_err(invalid)? as usize;
                    let args = pop_n(stack, argc)?;
                    let receiver = local(locals, 0)?;
                    match Self::super_call(owner, receiver, name, args)? {
                        Call::Frame(callee) => {
                            *ip = reader.position();
                            return Ok(Transfer::Call(callee));
                        }
                        Call::Done(value) => stack.push(value),
                    }
                }
                Opcode::CallStatic => {
                    let unit = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let name = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let argc = reader.read_u16().map_err(invalid)? as usize;
                    let args = pop_n(stack, argc)?;
                    let ty = Self::resolve_in(owner, unit)?;
                    let callee = Self::static_call(&ty, name, args)?;
                    *ip = reader.position();
                    return Ok(Transfer::Call(callee));
                }
                Opcode::CallExact => {
                    let name = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let descriptor = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let argc = reader.read_u16().map_err(invalid)? as usize;
                    let signature = Signature::parse(descriptor)
                        .map_err(|e| VmError::InvalidBytecode(e.to_string()))?;
                    let args = pop_n(stack, argc)?;
                    let receiver = pop(stack)?;
                    let callee = Self::exact_call(owner, receiver, name, &signature, args)?;
                    *ip = reader.position();
                    return Ok(Transfer::Call(callee));
                }
                Opcode::Return => return pop(stack).map(Transfer::Return),
                Opcode::ReturnVoid => return Ok(Transfer::Return(Value::Null)),

                // Objects
                Opcode::New => {
                    let unit = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let argc = reader.read_u16().map_err(invalid)? as usize;
                    let args = pop_n(stack, argc)?;
                    let ty = Self::resolve_in(owner, unit)?;
                    let constructor = Self::select_constructor(&ty, &args)?;
                    match Self::instantiate(&ty, constructor, args)? {
                        Call::Frame(callee) => {
                            *ip = reader.position();
                            return Ok(Transfer::Call(callee));
                        }
                        Call::Done(instance) => stack.push(instance),
                    }
                }
                Opcode::LoadField => {
                    let index = reader.read_u16().map_err(invalid)? as usize;
                    let target = pop(stack)?;
                    let object = expect_object(&target)?;
                    let value = object.get_field(index).ok_or_else(|| {
                        VmError::InvalidBytecode(format!(
                            "Field index {} out of bounds for {}",
                            index,
                            object.ty().name()
                        ))
                    })?;
                    stack.push(value);
                }
                Opcode::StoreField => {
                    let index = reader.read_u16().map_err(invalid)? as usize;
                    let value = pop(stack)?;
                    let target = pop(stack)?;
                    expect_object(&target)?
                        .set_field(index, value)
                        .map_err(VmError::InvalidBytecode)?;
                }

                // Arrays
                Opcode::LoadElem => {
                    let index = pop_int(stack)?;
                    let target = pop(stack)?;
                    let array = expect_array(&target)?.lock();
                    let value = usize::try_from(index)
                        .ok()
                        .and_then(|i| array.get(i).cloned())
                        .ok_or(VmError::IndexOutOfBounds {
                            index,
                            len: array.len(),
                        })?;
                    stack.push(value);
                }
                Opcode::StoreElem => {
                    let value = pop(stack)?;
                    let index = pop_int(stack)?;
                    let target = pop(stack)?;
                    let mut array = expect_array(&target)?.lock();
                    let len = array.len();
                    let slot = usize::try_from(index)
                        .ok()
                        .and_then(|i| array.get_mut(i))
                        .ok_or(VmError::IndexOutOfBounds { index, len })?;
                    *slot = value;
                }
                Opcode::ArrayLen => {
                    let target = pop(stack)?;
                    let len = expect_array(&target)?.lock().len();
                    stack.push(Value::Int(len as i64));
                }
                Opcode::ArrayLiteral => {
                    let count = reader.read_u16().map_err(invalid)? as usize;
                    let elements = pop_n(stack, count)?;
                    stack.push(Value::array(elements));
                }

                Opcode::Throw => {
                    let value = pop(stack)?;
                    return Err(VmError::Thrown(value.to_string()));
                }

                // Type checks
                Opcode::CheckCast => {
                    let descriptor = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let ty = parse_descriptor(descriptor)?;
                    let value = stack.last().ok_or(VmError::StackUnderflow)?;
                    if conforms(value, &ty, owner.namespace()).is_none() {
                        return Err(VmError::CastFailure {
                            expected: descriptor.to_string(),
                            actual: value.describe(),
                        });
                    }
                }
                Opcode::InstanceOf => {
                    let descriptor = string(pool, reader.read_u32().map_err(invalid)?)?;
                    let ty = parse_descriptor(descriptor)?;
                    let value = pop(stack)?;
                    stack.push(Value::Bool(conforms(&value, &ty, owner.namespace()).is_some()));
                }
            }
        }

        // Unverified code may run off the end
        Ok(Transfer::Return(Value::Null))
    }
}

fn invalid(error: DecodeError) -> VmError {
    VmError::InvalidBytecode(error.to_string())
}

fn string(pool: &ConstantPool, index: u32) -> VmResult<&str> {
    pool.get_string(index)
        .ok_or_else(|| VmError::InvalidBytecode(format!("No string constant {}", index)))
}

fn parse_descriptor(descriptor: &str) -> VmResult<TypeRef> {
    TypeRef::parse(descriptor).map_err(|e| VmError::InvalidBytecode(e.to_string()))
}

fn jump(reader: &mut BytecodeReader<'_>, offset: i32) -> VmResult<()> {
    let target = reader.position() as i64 + offset as i64;
    let total = (reader.position() + reader.remaining()) as i64;
    if target < 0 || target > total {
        return Err(VmError::InvalidBytecode(format!("Jump target {} out of range", target)));
    }
    reader.seek(target as usize);
    Ok(())
}

fn pop(stack: &mut Vec<Value>) -> VmResult<Value> {
    stack.pop().ok_or(VmError::StackUnderflow)
}

fn pop_n(stack: &mut Vec<Value>, count: usize) -> VmResult<Vec<Value>> {
    let at = stack.len().checked_sub(count).ok_or(VmError::StackUnderflow)?;
    Ok(stack.split_off(at))
}

fn pop_int(stack: &mut Vec<Value>) -> VmResult<i64> {
    let value = pop(stack)?;
    value
        .as_int()
        .ok_or_else(|| VmError::TypeError(format!("Expected int, got {}", value.describe())))
}

fn pop_float(stack: &mut Vec<Value>) -> VmResult<f64> {
    let value = pop(stack)?;
    value
        .as_float()
        .ok_or_else(|| VmError::TypeError(format!("Expected float, got {}", value.describe())))
}

fn int_op(stack: &mut Vec<Value>, op: impl FnOnce(i64, i64) -> VmResult<i64>) -> VmResult<()> {
    let b = pop_int(stack)?;
    let a = pop_int(stack)?;
    stack.push(Value::Int(op(a, b)?));
    Ok(())
}

fn int_cmp(stack: &mut Vec<Value>, op: impl FnOnce(i64, i64) -> bool) -> VmResult<()> {
    let b = pop_int(stack)?;
    let a = pop_int(stack)?;
    stack.push(Value::Bool(op(a, b)));
    Ok(())
}

fn float_op(stack: &mut Vec<Value>, op: impl FnOnce(f64, f64) -> Value) -> VmResult<()> {
    let b = pop_float(stack)?;
    let a = pop_float(stack)?;
    stack.push(op(a, b));
    Ok(())
}

fn local(locals: &[Value], index: usize) -> VmResult<Value> {
    locals
        .get(index)
        .cloned()
        .ok_or_else(|| VmError::InvalidBytecode(format!("Local {} out of range", index)))
}

fn store_local(locals: &mut [Value], index: usize, value: Value) -> VmResult<()> {
    let slot = locals
        .get_mut(index)
        .ok_or_else(|| VmError::InvalidBytecode(format!("Local {} out of range", index)))?;
    *slot = value;
    Ok(())
}

fn expect_object(value: &Value) -> VmResult<&Arc<Object>> {
    match value {
        Value::Object(object) => Ok(object),
        Value::Null => Err(VmError::NullReference),
        other => Err(VmError::TypeError(format!("Expected object, got {}", other.describe()))),
    }
}

fn expect_array(value: &Value) -> VmResult<&crate::value::ArrayRef> {
    match value {
        Value::Array(array) => Ok(array),
        Value::Null => Err(VmError::NullReference),
        other => Err(VmError::TypeError(format!("Expected array, got {}", other.describe()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedNamespace;
    use sideload_bytecode::UnitBuilder;

    fn define(ns: &SharedNamespace, builder: UnitBuilder) -> TypeHandle {
        ns.define(&builder.encode().unwrap()).unwrap()
    }

    fn boxed(ns: &SharedNamespace) -> TypeHandle {
        define(
            ns,
            UnitBuilder::new("impl.Box")
                .field("n", "int")
                .constructor("(int)->void", |c| {
                    c.load_local(0).load_local(1).store_field(0).ret_void();
                })
                .method("get", "()->int", |c| {
                    c.load_this_field(0).ret();
                })
                .method("square", "(int)->int", |c| {
                    c.load_local(1).load_local(1).op(Opcode::Imul).ret();
                }),
        )
    }

    #[test]
    fn test_construct_and_invoke() {
        let ns = SharedNamespace::new();
        let ty = boxed(&ns);
        let mut vm = Interpreter::new(64);

        let instance = vm.construct(&ty, vec![Value::Int(7)]).unwrap();
        assert_eq!(vm.invoke(&instance, "get", vec![]).unwrap(), Value::Int(7));
        assert_eq!(
            vm.invoke(&instance, "square", vec![Value::Int(11)]).unwrap(),
            Value::Int(121)
        );
    }

    #[test]
    fn test_loop_sums_range() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Math").static_method("sum", "(int)->int", |c| {
                let top = c.new_label();
                let done = c.new_label();
                c.const_int(0).store_local(1);
                c.mark(top)
                    .load_local(0)
                    .const_int(0)
                    .op(Opcode::Igt)
                    .jump_if_false(done);
                c.load_local(1).load_local(0).op(Opcode::Iadd).store_local(1);
                c.load_local(0).const_int(1).op(Opcode::Isub).store_local(0);
                c.jump(top);
                c.mark(done).load_local(1).ret();
            }),
        );

        let mut vm = Interpreter::new(64);
        assert_eq!(vm.invoke_static(&ty, "sum", vec![Value::Int(10)]).unwrap(), Value::Int(55));
    }

    #[test]
    fn test_overloads_prefer_exact_match() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Show")
                .static_method("show", "(any)->str", |c| {
                    c.const_str("any").ret();
                })
                .static_method("show", "(int)->str", |c| {
                    c.const_str("int").ret();
                }),
        );

        let mut vm = Interpreter::new(64);
        assert_eq!(vm.invoke_static(&ty, "show", vec![Value::Int(1)]).unwrap(), Value::from("int"));
        assert_eq!(vm.invoke_static(&ty, "show", vec![Value::from("x")]).unwrap(), Value::from("any"));
        assert!(matches!(
            vm.invoke_static(&ty, "show", vec![]),
            Err(VmError::NoMatchingOverload { arity: 0, .. })
        ));
        assert!(matches!(
            vm.invoke_static(&ty, "hide", vec![]),
            Err(VmError::NoSuchOperation { .. })
        ));
    }

    #[test]
    fn test_super_dispatch_and_inherited_fields() {
        let ns = SharedNamespace::new();
        boxed(&ns);
        let ty = define(
            &ns,
            UnitBuilder::new("impl.LabeledBox")
                .extends("impl.Box")
                .field("label", "str")
                .constructor("(int,str)->void", |c| {
                    c.load_local(1).call_super(CONSTRUCTOR, 1).op(Opcode::Pop);
                    c.load_local(0).load_local(2).store_field(1).ret_void();
                })
                .method("get", "()->int", |c| {
                    c.call_super("get", 0).const_int(1).op(Opcode::Iadd).ret();
                }),
        );

        let mut vm = Interpreter::new(64);
        let instance = vm.construct(&ty, vec![Value::Int(4), Value::from("b")]).unwrap();
        assert_eq!(vm.invoke(&instance, "get", vec![]).unwrap(), Value::Int(5));
        assert_eq!(instance.as_object().unwrap().field("label"), Some(Value::from("b")));
    }

    #[test]
    fn test_new_resolves_through_namespace() {
        let ns = SharedNamespace::new();
        boxed(&ns);
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Factory").static_method("make", "(int)->impl.Box", |c| {
                c.load_local(0).new_object("impl.Box", 1).ret();
            }),
        );

        let mut vm = Interpreter::new(64);
        let made = vm.invoke_static(&ty, "make", vec![Value::Int(3)]).unwrap();
        assert_eq!(made.as_object().unwrap().ty().name(), "impl.Box");
        assert_eq!(vm.invoke(&made, "get", vec![]).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_check_cast_failure() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Caster").static_method("cast", "(any)->int", |c| {
                c.load_local(0).check_cast("int").ret();
            }),
        );

        let mut vm = Interpreter::new(64);
        assert_eq!(vm.invoke_static(&ty, "cast", vec![Value::Int(2)]).unwrap(), Value::Int(2));
        match vm.invoke_static(&ty, "cast", vec![Value::from("two")]) {
            Err(VmError::CastFailure { expected, actual }) => {
                assert_eq!(expected, "int");
                assert_eq!(actual, "str");
            }
            other => panic!("expected cast failure, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_faults() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Faults")
                .static_method("div", "(int,int)->int", |c| {
                    c.load_local(0).load_local(1).op(Opcode::Idiv).ret();
                })
                .static_method("recurse", "()->int", |c| {
                    c.call_static("impl.Faults", "recurse", 0).ret();
                })
                .static_method("fail", "()->void", |c| {
                    c.const_str("boom").op(Opcode::Throw);
                }),
        );

        let mut vm = Interpreter::new(16);
        assert!(matches!(
            vm.invoke_static(&ty, "div", vec![Value::Int(1), Value::Int(0)]),
            Err(VmError::DivisionByZero)
        ));
        assert!(matches!(
            vm.invoke_static(&ty, "recurse", vec![]),
            Err(VmError::CallDepthExceeded(16))
        ));
        assert!(matches!(
            vm.invoke_static(&ty, "fail", vec![]),
            Err(VmError::Thrown(message)) if message == "boom"
        ));
    }

    #[test]
    fn test_deep_recursion_runs_on_heap_frames() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Count").static_method("down", "(int)->int", |c| {
                let base = c.new_label();
                c.load_local(0).const_int(0).op(Opcode::Igt).jump_if_false(base);
                c.load_local(0)
                    .const_int(1)
                    .op(Opcode::Isub)
                    .call_static("impl.Count", "down", 1)
                    .const_int(1)
                    .op(Opcode::Iadd)
                    .ret();
                c.mark(base).const_int(0).ret();
            }),
        );

        let mut vm = Interpreter::new(MAX_CALL_DEPTH);
        assert_eq!(
            vm.invoke_static(&ty, "down", vec![Value::Int(20_000)]).unwrap(),
            Value::Int(20_000)
        );

        let mut shallow = Interpreter::new(100);
        assert!(matches!(
            shallow.invoke_static(&ty, "down", vec![Value::Int(100)]),
            Err(VmError::CallDepthExceeded(100))
        ));
        assert_eq!(
            shallow.invoke_static(&ty, "down", vec![Value::Int(99)]).unwrap(),
            Value::Int(99)
        );
    }

    #[test]
    fn test_call_depth_is_capped() {
        assert_eq!(Interpreter::new(usize::MAX).max_call_depth(), MAX_CALL_DEPTH);
        assert_eq!(Interpreter::new(16).max_call_depth(), 16);

        let ns = SharedNamespace::new();
        let ty = boxed(&ns);
        assert!(matches!(
            Interpreter::new(0).construct(&ty, vec![Value::Int(1)]),
            Err(VmError::CallDepthExceeded(0))
        ));
    }

    #[test]
    fn test_self_containing_array_to_string() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Cycle").static_method("go", "()->str", |c| {
                c.const_null().array(1).store_local(0);
                c.load_local(0).const_int(0).load_local(0).op(Opcode::StoreElem);
                c.load_local(0).op(Opcode::ToString).ret();
            }),
        );

        let mut vm = Interpreter::new(16);
        assert_eq!(
            vm.invoke_static(&ty, "go", vec![]).unwrap(),
            Value::from("[array[1]]")
        );
    }

    #[test]
    fn test_arrays() {
        let ns = SharedNamespace::new();
        let ty = define(
            &ns,
            UnitBuilder::new("impl.Arrays").static_method("second", "(int[])->int", |c| {
                c.load_local(0).const_int(1).op(Opcode::LoadElem).ret();
            }),
        );

        let mut vm = Interpreter::new(16);
        let values = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(vm.invoke_static(&ty, "second", vec![values]).unwrap(), Value::Int(2));

        let short = Value::array(vec![Value::Int(1)]);
        assert!(matches!(
            vm.invoke_static(&ty, "second", vec![short]),
            Err(VmError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_default_construction() {
        let ns = SharedNamespace::new();
        let ty = define(&ns, UnitBuilder::new("impl.Empty").field("n", "int"));

        let mut vm = Interpreter::new(16);
        let instance = vm.construct(&ty, vec![]).unwrap();
        assert_eq!(instance.as_object().unwrap().field("n"), Some(Value::Int(0)));
        assert!(matches!(
            vm.construct(&ty, vec![Value::Int(1)]),
            Err(VmError::NoMatchingConstructor { arity: 1, .. })
        ));
    }
}
