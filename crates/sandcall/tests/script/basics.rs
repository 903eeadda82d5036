use anyhow::Result;
use serde_json::json;

use super::common::{NO_CAPABILITIES, TestProvider, run};

#[tokio::test]
async fn returns_the_script_value() -> Result<()> {
    let result = run("return 1 + 1;", NO_CAPABILITIES, &TestProvider::default()).await?;

    assert!(result.success(), "{result:?}");
    assert_eq!(result.data(), Some(&json!(2)));
    assert!(result.logs().is_empty());
    assert!(!result.timed_out());
    Ok(())
}

#[tokio::test]
async fn missing_return_value_is_null() -> Result<()> {
    let result = run("const x = 1;", NO_CAPABILITIES, &TestProvider::default()).await?;
    assert_eq!(result.data(), Some(&json!(null)));
    Ok(())
}

#[tokio::test]
async fn structured_values_survive_the_boundary() -> Result<()> {
    let result = run(
        "return { n: 1.5, s: 'x', list: [true, null], nested: { deep: [] } };",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert_eq!(
        result.data(),
        Some(&json!({ "n": 1.5, "s": "x", "list": [true, null], "nested": { "deep": [] } }))
    );
    Ok(())
}

#[tokio::test]
async fn thrown_error_is_a_failure() -> Result<()> {
    let result = run(
        "console.log('start'); throw new Error('boom');",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;

    assert!(!result.success());
    assert!(!result.timed_out());
    let error = result.error().unwrap();
    assert!(error.contains("boom"), "{error}");
    assert_eq!(result.logs(), ["[info] start"]);
    Ok(())
}

#[tokio::test]
async fn thrown_non_error_is_described() -> Result<()> {
    let result = run("throw { code: 7 };", NO_CAPABILITIES, &TestProvider::default()).await?;
    assert!(result.error().unwrap().contains("\"code\":7"));
    Ok(())
}

#[tokio::test]
async fn syntax_error_is_a_failure() -> Result<()> {
    let result = run("return (;", NO_CAPABILITIES, &TestProvider::default()).await?;
    let error = result.error().unwrap();
    assert!(error.contains("SyntaxError"), "{error}");
    Ok(())
}

#[tokio::test]
async fn unserializable_result_is_a_failure() -> Result<()> {
    let result = run("return 10n;", NO_CAPABILITIES, &TestProvider::default()).await?;
    assert!(!result.success());

    let result = run(
        "const a = {}; a.self = a; return a;",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert!(!result.success());
    Ok(())
}

#[tokio::test]
async fn never_settling_promise_fails_without_timing_out() -> Result<()> {
    let result = run(
        "await new Promise(() => {}); return 1;",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert!(!result.success());
    assert!(!result.timed_out());
    Ok(())
}

#[tokio::test]
async fn microtasks_run_before_the_result() -> Result<()> {
    let result = run(
        "let n = 0; await Promise.resolve().then(() => { n += 1; }); \
         await null; return n + 1;",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert_eq!(result.data(), Some(&json!(2)));
    Ok(())
}

#[tokio::test]
async fn console_levels_are_captured_in_order() -> Result<()> {
    let result = run(
        "console.log('a', 1); console.info({ b: [2] }); console.debug('c'); \
         console.warn('d'); console.error('e'); return null;",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert_eq!(
        result.logs(),
        [
            "[info] a 1",
            "[info] {\"b\":[2]}",
            "[debug] c",
            "[warn] d",
            "[error] e"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn scripts_do_not_share_globals() -> Result<()> {
    let provider = TestProvider::default();
    let first = run("globalThis.leak = 1; return 1;", NO_CAPABILITIES, &provider).await?;
    assert!(first.success());

    let second = run("return typeof globalThis.leak;", NO_CAPABILITIES, &provider).await?;
    assert_eq!(second.data(), Some(&json!("undefined")));
    Ok(())
}

#[tokio::test]
async fn host_environment_is_not_reachable() -> Result<()> {
    let result = run(
        "return [typeof require, typeof process, typeof fetch, typeof tools];",
        NO_CAPABILITIES,
        &TestProvider::default(),
    )
    .await?;
    assert_eq!(
        result.data(),
        Some(&json!(["undefined", "undefined", "undefined", "object"]))
    );
    Ok(())
}
