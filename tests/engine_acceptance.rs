//! End-to-end behavior of the call engine through a session: memoization,
//! configuration sensitivity, argument inheritance, failure handling.

use marmot::{kwargs, Error, FunctionSpec, Registry, Session, Value};
use serde_json::json;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
#[serial]
fn test_memoization_is_transparent() {
    let registry = Registry::new();
    let leaf_calls = counter();
    let parent_calls = counter();

    let calls = Arc::clone(&leaf_calls);
    registry.register(
        FunctionSpec::new("acc.leaf", move |_, kw| {
            calls.fetch_add(1, Ordering::SeqCst);
            let x = kw.get("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(x * 10))
        })
        .param("x")
        .cached(true),
    );
    let calls = Arc::clone(&parent_calls);
    registry.register(
        FunctionSpec::new("acc.parent", move |ctx, kw| {
            calls.fetch_add(1, Ordering::SeqCst);
            let x = kw.get("x").and_then(Value::as_i64).unwrap_or(0);
            let leaf = ctx.call("acc.leaf", kwargs! { x: x })?;
            Ok(json!(x + leaf.as_i64().unwrap_or(0)))
        })
        .param("x")
        .cached(true),
    );

    let session = Session::builder().registry(registry).build().unwrap();
    let ctx = Arc::clone(session.context());

    // Same arguments, same value, one execution.
    assert_eq!(ctx.call("acc.leaf", kwargs! { x: 1 }).unwrap(), json!(10));
    assert_eq!(ctx.call("acc.leaf", kwargs! { x: 1 }).unwrap(), json!(10));
    assert_eq!(leaf_calls.load(Ordering::SeqCst), 1);

    // The nested leaf call inside parent is served from the cache too.
    assert_eq!(ctx.call("acc.parent", kwargs! { x: 1 }).unwrap(), json!(11));
    assert_eq!(parent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(leaf_calls.load(Ordering::SeqCst), 1);

    // Different arguments are a different identity.
    assert_eq!(ctx.call("acc.parent", kwargs! { x: 2 }).unwrap(), json!(22));
    assert_eq!(parent_calls.load(Ordering::SeqCst), 2);
    assert_eq!(leaf_calls.load(Ordering::SeqCst), 2);

    // And the repeats still cost nothing.
    ctx.call("acc.parent", kwargs! { x: 1 }).unwrap();
    ctx.call("acc.parent", kwargs! { x: 2 }).unwrap();
    assert_eq!(parent_calls.load(Ordering::SeqCst), 2);

    assert_eq!(
        ctx.count_executions("acc.parent", kwargs! { x: 1 }).unwrap(),
        1
    );
}

#[test]
#[serial]
fn test_configuration_participates_in_identity() {
    let registry = Registry::new();
    let calls = counter();
    let calls_in_body = Arc::clone(&calls);
    registry.register(
        FunctionSpec::new("acc.cfg", move |_, kw| {
            calls_in_body.fetch_add(1, Ordering::SeqCst);
            Ok(kw.get("mode").cloned().unwrap_or(Value::Null))
        })
        .param_with_default("mode", json!("fast"))
        .cached(true),
    );

    let session = Session::builder()
        .registry(registry)
        .globals(kwargs! { mode: "fast" })
        .build()
        .unwrap();
    let ctx = Arc::clone(session.context());

    assert_eq!(ctx.call("acc.cfg", kwargs! {}).unwrap(), json!("fast"));
    {
        let _scope = marmot::configuration(kwargs! { mode: "slow" }).unwrap();
        // A relevant configuration change is a new identity.
        assert_eq!(ctx.call("acc.cfg", kwargs! {}).unwrap(), json!("slow"));
    }
    // Back in the outer scope the original entry is still warm.
    assert_eq!(ctx.call("acc.cfg", kwargs! {}).unwrap(), json!("fast"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // An unrelated configuration change shares the entry.
    {
        let _scope = marmot::configuration(kwargs! { unrelated: 1 }).unwrap();
        assert_eq!(ctx.call("acc.cfg", kwargs! {}).unwrap(), json!("fast"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[serial]
fn test_nested_scope_parameterizes_cached_calls() {
    let registry = Registry::new();
    registry.register(
        FunctionSpec::new("acc.fun_a", |_, kw| {
            Ok(kw.get("a").cloned().unwrap_or(Value::Null))
        })
        .param_with_default("a", Value::Null)
        .cached(true),
    );
    registry.register(
        FunctionSpec::new("acc.fun_b", |ctx, kw| {
            let b = kw.get("b").and_then(Value::as_i64).unwrap_or(0);
            let a = ctx.call("acc.fun_a", kwargs! {})?.as_i64().unwrap_or(0);
            Ok(json!(a + b))
        })
        .param_with_default("b", json!(2))
        .cached(true),
    );

    let session = Session::builder()
        .registry(registry)
        .globals(kwargs! { a: 1 })
        .build()
        .unwrap();
    let ctx = Arc::clone(session.context());

    assert_eq!(ctx.call("acc.fun_b", kwargs! {}).unwrap(), json!(3));
    {
        let _scope = marmot::configuration(kwargs! { a: 2 }).unwrap();
        assert_eq!(ctx.call("acc.fun_b", kwargs! {}).unwrap(), json!(4));
    }
    assert_eq!(ctx.call("acc.fun_b", kwargs! {}).unwrap(), json!(3));
}

#[test]
#[serial]
fn test_arguments_inherit_through_the_call_stack() {
    let registry = Registry::new();
    registry.register(
        FunctionSpec::new("acc.inh_leaf", |_, kw| {
            Ok(kw.get("depth").cloned().unwrap_or(Value::Null))
        })
        .param_with_default("depth", Value::Null),
    );
    registry.register(
        FunctionSpec::new("acc.inh_root", |ctx, _| {
            // No explicit `depth` here; the leaf takes it from this call's
            // own binding.
            Ok(ctx.call("acc.inh_leaf", kwargs! {})?)
        })
        .param_with_default("depth", Value::Null),
    );

    let session = Session::builder().registry(registry).build().unwrap();
    let ctx = Arc::clone(session.context());

    assert_eq!(
        ctx.call("acc.inh_root", kwargs! { depth: 3 }).unwrap(),
        json!(3)
    );
    // Outside any call stack the leaf falls back to its default.
    assert_eq!(ctx.call("acc.inh_leaf", kwargs! {}).unwrap(), Value::Null);
}

#[test]
#[serial]
fn test_failed_executions_are_not_cached() {
    let registry = Registry::new();
    let calls = counter();
    let calls_in_body = Arc::clone(&calls);
    registry.register(
        FunctionSpec::new("acc.flaky", move |_, _| {
            if calls_in_body.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(json!("ok"))
        })
        .cached(true),
    );

    let session = Session::builder().registry(registry).build().unwrap();
    let ctx = Arc::clone(session.context());

    assert!(matches!(
        ctx.call("acc.flaky", kwargs! {}),
        Err(Error::Execution(_))
    ));
    // The failure left no entry behind; the retry runs and succeeds.
    assert_eq!(ctx.call("acc.flaky", kwargs! {}).unwrap(), json!("ok"));
    assert_eq!(ctx.call("acc.flaky", kwargs! {}).unwrap(), json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
#[serial]
fn test_cycles_are_reported_not_run() {
    let registry = Registry::new();
    registry.register(FunctionSpec::new("acc.ping", |ctx, _| {
        Ok(ctx.call("acc.pong", kwargs! {})?)
    }));
    registry.register(FunctionSpec::new("acc.pong", |ctx, _| {
        Ok(ctx.call("acc.ping", kwargs! {})?)
    }));

    let session = Session::builder().registry(registry).build().unwrap();
    let ctx = Arc::clone(session.context());

    match ctx.call("acc.ping", kwargs! {}) {
        Err(Error::CyclicExecution { head, chain }) => {
            assert_eq!(head, "acc.ping");
            assert_eq!(chain.len(), 2);
        }
        other => panic!("expected CyclicExecution, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_handles_require_a_session() {
    let handle = marmot::register(FunctionSpec::new("acc.no_session", |_, _| {
        Ok(Value::Null)
    }));
    assert!(matches!(
        handle.call(kwargs! {}),
        Err(Error::NotInitialized)
    ));
}

#[test]
#[serial]
fn test_positional_arguments_via_handle() {
    let handle = marmot::register(
        FunctionSpec::new("acc.pos", |_, kw| {
            let a = kw.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = kw.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a - b))
        })
        .param("a")
        .param("b"),
    );

    let _session = Session::builder().build().unwrap();
    assert_eq!(
        handle.call_with(&[json!(9), json!(4)], kwargs! {}).unwrap(),
        json!(5)
    );
    assert!(matches!(
        handle.call_with(&[json!(1)], kwargs! { a: 2 }),
        Err(Error::ArgumentConflict { .. })
    ));
    assert!(matches!(
        handle.call_with(&[json!(1), json!(2), json!(3)], kwargs! {}),
        Err(Error::TooManyPositional { .. })
    ));
}
