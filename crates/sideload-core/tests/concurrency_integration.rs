//! Concurrent Resolution Tests
//!
//! Many threads resolving and invoking through one context must observe a
//! single definition per name and read each unit from the source once.
//!
//! # Running Tests
//! ```bash
//! cargo test --test concurrency_integration
//! ```

mod common;

use common::CountingSource;
use sideload_core::{ContextOptions, IsolatedContext, TypeHandle, Value};
use std::sync::atomic::Ordering;
use std::thread;

const THREADS: usize = 8;

#[test]
fn test_concurrent_resolve_defines_once() {
    common::init_tracing();
    let (source, reads) = CountingSource::new(common::source());
    let context = IsolatedContext::new(source, common::registry(), ContextOptions::default());

    let handles: Vec<TypeHandle> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| scope.spawn(|| context.resolve("impl.Wrapper").unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for handle in &handles[1..] {
        assert!(TypeHandle::ptr_eq(&handles[0], handle));
    }
    assert_eq!(context.defined_names(), vec!["impl.Wrapper".to_string()]);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_invocations_share_definitions() {
    let context = common::context(ContextOptions::default());

    let results: Vec<Value> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS as i64)
            .map(|n| {
                let context = &context;
                scope.spawn(move || {
                    let bridge = context.bridge();
                    let box_ty = bridge.type_of("impl.Box").unwrap();
                    let wrapper_ty = bridge.type_of("impl.Wrapper").unwrap();
                    let boxed = bridge.construct(&box_ty, vec![Value::Int(n)]).unwrap();
                    let wrapper = bridge.construct(&wrapper_ty, vec![Value::Int(n)]).unwrap();
                    bridge.invoke(&wrapper, "apply", vec![boxed]).unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let expected: Vec<Value> = (0..THREADS as i64).map(|n| Value::Int(n * n)).collect();
    assert_eq!(results, expected);
    assert_eq!(
        context.defined_names(),
        vec!["impl.Box".to_string(), "impl.Wrapper".to_string()]
    );
}
