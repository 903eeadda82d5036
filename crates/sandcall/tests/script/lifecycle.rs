use std::time::{Duration, Instant};

use anyhow::Result;
use sandcall::{CancellationToken, ExecuteOptions, Executor, ExecutorConfig};
use serde_json::json;

use super::common::{NO_CAPABILITIES, TestProvider, run_with};

#[tokio::test]
async fn infinite_loop_times_out() -> Result<()> {
    let executor = Executor::default();
    let started = Instant::now();
    let result = run_with(
        &executor,
        "console.log('spinning'); while (true) {}",
        NO_CAPABILITIES,
        &TestProvider::default(),
        ExecuteOptions::default().timeout(Duration::from_millis(50)),
    )
    .await?;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!result.success());
    assert!(result.timed_out());
    assert_eq!(result.error(), Some("timeout"));
    assert_eq!(result.logs(), ["[info] spinning"]);
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn default_timeout_comes_from_config() -> Result<()> {
    let executor =
        Executor::new(ExecutorConfig::default().default_timeout(Duration::from_millis(50)));
    let result = run_with(
        &executor,
        "while (true) {}",
        NO_CAPABILITIES,
        &TestProvider::default(),
        ExecuteOptions::default(),
    )
    .await?;

    assert!(result.timed_out());
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn timeout_while_waiting_on_a_capability() -> Result<()> {
    let executor = Executor::default();
    let result = run_with(
        &executor,
        "return await tools.sleep(5000);",
        &["sleep"],
        &TestProvider::default(),
        ExecuteOptions::default().timeout(Duration::from_millis(50)),
    )
    .await?;

    assert!(result.timed_out());
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_the_execution() -> Result<()> {
    let executor = Executor::default();
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let result = run_with(
        &executor,
        "console.warn('waiting'); return await tools.sleep(5000);",
        &["sleep"],
        &TestProvider::default(),
        ExecuteOptions::default().cancel(token),
    )
    .await?;
    canceller.await?;

    assert!(!result.success());
    assert!(result.timed_out());
    assert_eq!(result.error(), Some("cancelled"));
    assert_eq!(result.logs(), ["[warn] waiting"]);
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn already_cancelled_token_still_reports_a_result() -> Result<()> {
    let token = CancellationToken::new();
    token.cancel();
    let result = run_with(
        &Executor::default(),
        "while (true) {}",
        NO_CAPABILITIES,
        &TestProvider::default(),
        ExecuteOptions::default().cancel(token),
    )
    .await?;
    assert_eq!(result.error(), Some("cancelled"));
    Ok(())
}

#[tokio::test]
async fn concurrent_executions_are_isolated() -> Result<()> {
    let executor = Executor::default();
    let provider = TestProvider::default();
    let script = "globalThis.seen = (globalThis.seen ?? 0) + 1; \
                  const v = await tools.echo(MARK); console.log(v); return [v, globalThis.seen];";

    let script_a = script.replace("MARK", "'a'");
    let script_b = script.replace("MARK", "'b'");

    let (a, b) = tokio::join!(
        run_with(
            &executor,
            &script_a,
            &["echo"],
            &provider,
            ExecuteOptions::default(),
        ),
        run_with(
            &executor,
            &script_b,
            &["echo"],
            &provider,
            ExecuteOptions::default(),
        ),
    );

    let (a, b) = (a?, b?);
    assert_eq!(a.data(), Some(&json!(["a", 1])));
    assert_eq!(a.logs(), ["[info] a"]);
    assert_eq!(b.data(), Some(&json!(["b", 1])));
    assert_eq!(b.logs(), ["[info] b"]);
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn one_timeout_does_not_affect_another_execution() -> Result<()> {
    let executor = Executor::default();
    let provider = TestProvider::default();

    let (spinning, normal) = tokio::join!(
        run_with(
            &executor,
            "while (true) {}",
            NO_CAPABILITIES,
            &provider,
            ExecuteOptions::default().timeout(Duration::from_millis(50)),
        ),
        run_with(
            &executor,
            "return await tools.sleep(150);",
            &["sleep"],
            &provider,
            ExecuteOptions::default(),
        ),
    );

    assert!(spinning?.timed_out());
    assert_eq!(normal?.data(), Some(&json!(150)));
    Ok(())
}

#[tokio::test]
async fn memory_limit_fails_the_execution() -> Result<()> {
    let executor = Executor::new(ExecutorConfig::default().max_memory(16 * 1024 * 1024));
    let result = run_with(
        &executor,
        "const hog = []; while (true) { hog.push(new Array(100000).fill(hog.length)); }",
        NO_CAPABILITIES,
        &TestProvider::default(),
        ExecuteOptions::default().timeout(Duration::from_secs(5)),
    )
    .await?;

    assert!(!result.success());
    assert!(!result.timed_out(), "{result:?}");
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn deep_recursion_is_a_failure() -> Result<()> {
    let result = run_with(
        &Executor::default(),
        "function f(n) { return f(n + 1) + 1; } return f(0);",
        NO_CAPABILITIES,
        &TestProvider::default(),
        ExecuteOptions::default(),
    )
    .await?;

    assert!(!result.success());
    assert!(!result.timed_out());
    Ok(())
}

#[tokio::test]
async fn units_exit_after_every_kind_of_outcome() -> Result<()> {
    let executor = Executor::default();
    let provider = TestProvider::default();
    let short = ExecuteOptions::default().timeout(Duration::from_millis(50));

    for code in [
        "return 1;",
        "throw new Error('x');",
        "await new Promise(() => {});",
        "while (true) {}",
        "return await tools.sleep(5000);",
    ] {
        run_with(&executor, code, &["sleep"], &provider, short.clone()).await?;
    }
    assert_eq!(executor.live_units(), 0);
    Ok(())
}

#[tokio::test]
async fn timed_out_unit_is_gone_when_execute_returns() -> Result<()> {
    let executor = Executor::default();
    let provider = TestProvider::default();

    for code in ["while (true) {}", "return await tools.sleep(5000);"] {
        let result = run_with(
            &executor,
            code,
            &["sleep"],
            &provider,
            ExecuteOptions::default().timeout(Duration::from_millis(50)),
        )
        .await?;
        assert!(result.timed_out(), "{code}");
        assert_eq!(executor.live_units(), 0, "{code}");
    }
    Ok(())
}
