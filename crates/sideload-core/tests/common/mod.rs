//! Shared fixtures for the integration tests
//!
//! The Box/Wrapper scenario: `impl.Box` is mapped to `api.Boxed`, and
//! `impl.Wrapper` takes boxes directly, in arrays and from its own factory.

#![allow(dead_code)]

use sideload_bytecode::{ModuleUnit, Opcode, UnitBuilder};
use sideload_core::{
    CapabilityInterface, ContextOptions, InterfaceRegistry, IsolatedContext, MemorySource,
    ModuleSource, SourceError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Route `tracing` output through the test harness, once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn registry() -> InterfaceRegistry {
    let mut registry = InterfaceRegistry::new();
    registry
        .declare(
            CapabilityInterface::new("api.Boxed")
                .with_operation("square", "(int)->int")
                .unwrap(),
        )
        .unwrap();
    registry.map("impl.Box", "api.Boxed").unwrap();
    registry
}

/// `impl.Box`: holds `n`, squares its argument
pub fn box_builder() -> UnitBuilder {
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
        })
}

pub fn box_unit() -> ModuleUnit {
    box_builder().build().unwrap()
}

/// Another `api.Boxed` implementer that is not `impl.Box`
pub fn fake_box_unit() -> ModuleUnit {
    UnitBuilder::new("impl.FakeBox")
        .implements("api.Boxed")
        .method("square", "(int)->int", |c| {
            c.const_int(0).ret();
        })
        .build()
        .unwrap()
}

/// `impl.Wrapper(n)`
pub fn wrapper_unit() -> ModuleUnit {
    UnitBuilder::new("impl.Wrapper")
        .field("n", "int")
        .constructor("(int)->void", |c| {
            c.load_local(0).load_local(1).store_field(0).ret_void();
        })
        // b.square(this.n)
        .method("apply", "(impl.Box)->int", |c| {
            c.load_local(1).load_this_field(0).call_method("square", 1).ret();
        })
        // sum of b.square(this.n) over the array
        .method("total", "(impl.Box[])->int", |c| {
            let top = c.new_label();
            let done = c.new_label();
            c.const_int(0).store_local(2).const_int(0).store_local(3);
            c.mark(top)
                .load_local(2)
                .load_local(1)
                .op(Opcode::ArrayLen)
                .op(Opcode::Ilt)
                .jump_if_false(done);
            c.load_local(3)
                .load_local(1)
                .load_local(2)
                .op(Opcode::LoadElem)
                .load_this_field(0)
                .call_method("square", 1)
                .op(Opcode::Iadd)
                .store_local(3);
            c.load_local(2).const_int(1).op(Opcode::Iadd).store_local(2);
            c.jump(top);
            c.mark(done).load_local(3).ret();
        })
        .method("wrap", "()->impl.Box", |c| {
            c.load_this_field(0).new_object("impl.Box", 1).ret();
        })
        .build()
        .unwrap()
}

pub fn source() -> MemorySource {
    MemorySource::new()
        .with(&box_unit())
        .with(&fake_box_unit())
        .with(&wrapper_unit())
}

pub fn context(options: ContextOptions) -> Arc<IsolatedContext> {
    init_tracing();
    IsolatedContext::new(source(), registry(), options)
}

/// Source wrapper that counts reads per call
pub struct CountingSource<S> {
    inner: S,
    reads: Arc<AtomicUsize>,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                reads: reads.clone(),
            },
            reads,
        )
    }
}

impl<S: ModuleSource> ModuleSource for CountingSource<S> {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(name)
    }

    fn names(&self) -> Vec<String> {
        self.inner.names()
    }
}
