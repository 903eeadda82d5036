use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sandcall::{BoxError, CapabilityProvider, ExecuteOptions, ExecutionResult, Executor};
use serde_json::Value;

pub const NO_CAPABILITIES: &[&str] = &[];

/// Provider backing every integration test.
///
/// - `echo` returns its input
/// - `upper` upper-cases a string input
/// - `fail` always errors with `capability failed`
/// - `sleep` waits the given number of milliseconds and returns it
#[derive(Clone, Default)]
pub struct TestProvider {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TestProvider {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Highest number of `sleep` calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CapabilityProvider for TestProvider {
    async fn call(&self, name: &str, input: Value) -> std::result::Result<Value, BoxError> {
        self.calls.lock().push((name.to_string(), input.clone()));
        match name {
            "echo" => Ok(input),
            "upper" => input
                .as_str()
                .map(|s| Value::String(s.to_uppercase()))
                .ok_or_else(|| std::io::Error::other("upper expects a string").into()),
            "fail" => Err(std::io::Error::other("capability failed").into()),
            "sleep" => {
                let ms = input.as_u64().unwrap_or_default();
                let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak.fetch_max(now, Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Ok(Value::from(ms))
            }
            _ => Err(std::io::Error::other(format!("unsupported capability: {name}")).into()),
        }
    }
}

pub async fn run(
    code: &str,
    capabilities: &[&str],
    provider: &TestProvider,
) -> Result<ExecutionResult> {
    run_with(&Executor::default(), code, capabilities, provider, ExecuteOptions::default()).await
}

pub async fn run_with(
    executor: &Executor,
    code: &str,
    capabilities: &[&str],
    provider: &TestProvider,
    options: ExecuteOptions,
) -> Result<ExecutionResult> {
    let execution = executor.execute(code, capabilities, provider, options);
    tokio::time::timeout(Duration::from_secs(10), execution)
        .await
        .context("execution did not finish within 10s")?
        .context("failed to start isolated runtime")
}
