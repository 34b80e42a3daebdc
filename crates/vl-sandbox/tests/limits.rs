//! Deadlines, heap limits, the host logger and the prelude.

use std::time::{Duration, Instant};

use serde_json::{json, Map};
use vl_sandbox::{Sandbox, SandboxConfig, SandboxError};

#[test]
fn cpu_bound_loop_is_terminated() {
    let mut sandbox = Sandbox::with_config(
        "if (this.spin) { while (true) {} } this.done = true;",
        SandboxConfig {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    )
    .unwrap();

    let mut scope = Map::new();
    scope.insert("spin".into(), json!(true));
    let start = Instant::now();
    let err = sandbox.run(Some(&mut scope)).unwrap_err();
    let elapsed = start.elapsed();

    assert!(
        matches!(err, SandboxError::Timeout { timeout_ms: 200 }),
        "expected timeout, got: {err:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "should complete reasonably fast, took: {elapsed:?}"
    );

    // The isolate accepts work again after termination.
    let mut scope = Map::new();
    scope.insert("spin".into(), json!(false));
    sandbox.run(Some(&mut scope)).unwrap();
    assert_eq!(scope["done"], true);
}

#[test]
fn fast_run_is_not_a_timeout() {
    let mut sandbox = Sandbox::with_config(
        "this.n = 1;",
        SandboxConfig {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        },
    )
    .unwrap();
    let mut scope = Map::new();
    sandbox.run(Some(&mut scope)).unwrap();
    assert_eq!(scope["n"], 1);
}

#[test]
fn heap_limit_prevents_oom() {
    let mut sandbox = Sandbox::with_config(
        r#"
            if (this.grow) {
                const arr = [];
                while (true) {
                    arr.push(new Array(100000).fill("x"));
                }
            }
            this.done = true;
        "#,
        SandboxConfig {
            max_heap_size: 10 * 1024 * 1024,
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        },
    )
    .unwrap();

    for _ in 0..2 {
        let mut scope = Map::new();
        scope.insert("grow".into(), json!(true));
        let err = sandbox.run(Some(&mut scope)).unwrap_err();
        assert!(
            matches!(err, SandboxError::HeapLimitExceeded),
            "expected heap limit, got: {err:?}"
        );
    }

    // The isolate accepts work again, under the original limit.
    let mut scope = Map::new();
    scope.insert("grow".into(), json!(false));
    sandbox.run(Some(&mut scope)).unwrap();
    assert_eq!(scope["done"], true);
}

#[test]
fn logger_is_callable() {
    let mut sandbox =
        Sandbox::new("log('hello from the snippet'); this.kind = typeof log;").unwrap();
    sandbox.expose_logger("log").unwrap();
    let mut scope = Map::new();
    sandbox.run(Some(&mut scope)).unwrap();
    assert_eq!(scope["kind"], "function");
}

#[test]
fn failing_prelude_fails_construction() {
    let err = Sandbox::with_config(
        "this.a = 1;",
        SandboxConfig {
            prelude: Some("throw new Error('bad prelude')".into()),
            ..Default::default()
        },
    )
    .unwrap_err();
    match err {
        SandboxError::Prelude { message } => assert!(message.contains("bad prelude"), "{message}"),
        other => panic!("expected prelude error, got: {other:?}"),
    }
}

#[test]
fn prelude_helper_can_be_exposed() {
    let mut sandbox = Sandbox::with_config(
        "this.out = double(21);",
        SandboxConfig {
            prelude: Some("globalThis.double = (n) => n * 2;".into()),
            ..Default::default()
        },
    )
    .unwrap();
    sandbox.expose_ambient("double").unwrap();
    let mut scope = Map::new();
    sandbox.run(Some(&mut scope)).unwrap();
    assert_eq!(scope["out"], 42);
}
