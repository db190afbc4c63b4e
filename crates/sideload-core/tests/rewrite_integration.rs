//! Type Rewriter Integration Tests
//!
//! Covers rewriting as observed through a loading context:
//! - Synthesized overloads for arrays of mapped types
//! - Collisions with authored overloads under both policies
//! - Shapes reported instead of rewritten
//!
//! # Running Tests
//! ```bash
//! cargo test --test rewrite_integration
//! ```

mod common;

use sideload_bytecode::{ModuleUnit, Opcode, TypeRef, UnitBuilder};
use sideload_core::rewrite::LimitationKind;
use sideload_core::{
    BridgeError, ContextOptions, IsolatedContext, LoadError, MemorySource, OverloadPolicy,
    RewriteDirective, UnitState, Value,
};

fn boxes(context: &IsolatedContext, count: i64) -> Value {
    let bridge = context.bridge();
    let box_ty = bridge.type_of("impl.Box").unwrap();
    let elements = (0..count)
        .map(|i| bridge.construct(&box_ty, vec![Value::Int(i)]).unwrap())
        .collect();
    Value::array(elements)
}

// ===== Synthesized Overloads =====

#[test]
fn test_array_parameter_gets_adapting_overload() {
    let context = common::context(ContextOptions::default());
    let wrapper_ty = context.resolve("impl.Wrapper").unwrap();

    assert_eq!(
        wrapper_ty.report().directive_for("total", "(impl.Box[])->int"),
        Some(&RewriteDirective::SynthesizeOverload { params: vec![0] })
    );
    assert_eq!(wrapper_ty.report().synthesized, vec!["total(api.Boxed[])->int".to_string()]);

    let unit = wrapper_ty.unit();
    let original = unit.find_exact("total", &[TypeRef::parse("impl.Box[]").unwrap()]);
    let adapted = unit.find_exact("total", &[TypeRef::parse("api.Boxed[]").unwrap()]);
    assert!(original.is_some_and(|e| !e.is_synthetic()));
    assert!(adapted.is_some_and(|e| e.is_synthetic()));
}

#[test]
fn test_adapting_overload_forwards() {
    let context = common::context(ContextOptions::default());
    let bridge = context.bridge();
    let wrapper_ty = bridge.type_of("impl.Wrapper").unwrap();
    let wrapper = bridge.construct(&wrapper_ty, vec![Value::Int(3)]).unwrap();

    let adapted = wrapper_ty
        .unit()
        .find_exact("total", &[TypeRef::parse("api.Boxed[]").unwrap()])
        .unwrap();
    let result = sideload_core::Interpreter::for_namespace(&*context)
        .execute(&wrapper_ty, adapted, Some(wrapper.clone()), vec![boxes(&context, 2)])
        .unwrap();
    assert_eq!(result, Value::Int(18));

    assert_eq!(
        bridge.invoke(&wrapper, "total", vec![boxes(&context, 3)]).unwrap(),
        Value::Int(27)
    );
}

#[test]
fn test_adapting_overload_rejects_other_implementers() {
    let context = common::context(ContextOptions::default());
    let bridge = context.bridge();
    let wrapper_ty = bridge.type_of("impl.Wrapper").unwrap();
    let wrapper = bridge.construct(&wrapper_ty, vec![Value::Int(3)]).unwrap();

    let fake_ty = bridge.type_of("impl.FakeBox").unwrap();
    let fake = bridge.construct(&fake_ty, vec![]).unwrap();
    let box_ty = bridge.type_of("impl.Box").unwrap();
    let real = bridge.construct(&box_ty, vec![Value::Int(1)]).unwrap();

    match bridge.invoke(&wrapper, "total", vec![Value::array(vec![real, fake])]) {
        Err(BridgeError::CastFailure { expected, .. }) => assert_eq!(expected, "impl.Box[]"),
        other => panic!("expected cast failure, got {:?}", other),
    }
}

// ===== Collisions =====

fn collider() -> ModuleUnit {
    UnitBuilder::new("impl.Collider")
        .method("count", "(impl.Box[])->int", |c| {
            c.const_int(1).ret();
        })
        .method("count", "(api.Boxed[])->int", |c| {
            c.const_int(2).ret();
        })
        .build()
        .unwrap()
}

fn collider_context(policy: OverloadPolicy) -> std::sync::Arc<IsolatedContext> {
    common::init_tracing();
    let options = ContextOptions {
        ambiguous_overloads: policy,
        ..Default::default()
    };
    IsolatedContext::new(
        common::source().with(&collider()),
        common::registry(),
        options,
    )
}

#[test]
fn test_collision_fails_by_default() {
    let context = collider_context(OverloadPolicy::Error);

    let expected = LoadError::AmbiguousOverload {
        unit: "impl.Collider".to_string(),
        operation: "count".to_string(),
        signature: "(api.Boxed[])->int".to_string(),
    };
    assert_eq!(context.resolve("impl.Collider"), Err(expected.clone()));
    assert_eq!(context.resolve("impl.Collider"), Err(expected));
    assert_eq!(context.state("impl.Collider"), UnitState::Failed);
}

#[test]
fn test_collision_keeps_authored_overload_when_warning() {
    let context = collider_context(OverloadPolicy::Warn);
    let collider_ty = context.resolve("impl.Collider").unwrap();

    assert_eq!(collider_ty.report().ambiguous.len(), 1);
    assert!(collider_ty.report().synthesized.is_empty());
    assert_eq!(collider_ty.unit().entry_points_named("count").count(), 2);

    let bridge = context.bridge();
    let instance = bridge.construct(&collider_ty, vec![]).unwrap();
    assert_eq!(
        bridge.invoke(&instance, "count", vec![boxes(&context, 1)]).unwrap(),
        Value::Int(1)
    );
}

// ===== Reported Shapes =====

#[test]
fn test_deep_nesting_and_static_entry_points_are_reported() {
    common::init_tracing();
    let unit = UnitBuilder::new("impl.Shapes")
        .method("nested", "(List<List<impl.Box>>)->int", |c| {
            c.const_int(0).ret();
        })
        .static_method("measure", "(impl.Box)->int", |c| {
            c.load_local(0).load_field(0).ret();
        })
        .build()
        .unwrap();
    let context = IsolatedContext::new(
        common::source().with(&unit),
        common::registry(),
        ContextOptions::default(),
    );

    let shapes = context.resolve("impl.Shapes").unwrap();
    let kinds: Vec<LimitationKind> = shapes.report().limitations.iter().map(|l| l.kind).collect();
    assert_eq!(kinds, vec![LimitationKind::Unrewritable, LimitationKind::StaticUnadapted]);
    assert!(shapes
        .unit()
        .find_exact("nested", &[TypeRef::parse("List<List<impl.Box>>").unwrap()])
        .is_some());

    let bridge = context.bridge();
    let box_ty = bridge.type_of("impl.Box").unwrap();
    let boxed = bridge.construct(&box_ty, vec![Value::Int(9)]).unwrap();
    assert_eq!(
        bridge.invoke_static(&shapes, "measure", vec![boxed]).unwrap(),
        Value::Int(9)
    );
}

#[test]
fn test_unmapped_unit_is_defined_as_authored() {
    common::init_tracing();
    let unit = UnitBuilder::new("impl.Plain")
        .static_method("twice", "(int)->int", |c| {
            c.load_local(0).const_int(2).op(Opcode::Imul).ret();
        })
        .build()
        .unwrap();
    let context = IsolatedContext::new(
        MemorySource::new().with(&unit),
        common::registry(),
        ContextOptions::default(),
    );

    let plain = context.resolve("impl.Plain").unwrap();
    assert_eq!(plain.unit(), &unit);
    assert!(plain.report().injected.is_none());
}
