use std::{
    env::args,
    io::{self, Read},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sandcall::{
    BoxError, CapabilityProvider, ExecuteOptions, Executor, ExecutorConfig,
    provider::parse_text_output,
};
use serde_json::Value;
use tracing::level_filters::LevelFilter;

const CAPABILITIES: &[&str] = &["echo", "fail", "sleep", "upper"];

/// Capabilities available to scripts run from the command line.
struct DemoProvider;

#[async_trait]
impl CapabilityProvider for DemoProvider {
    async fn call(&self, name: &str, input: Value) -> std::result::Result<Value, BoxError> {
        match name {
            "echo" => Ok(input),
            "fail" => Err(io::Error::other(
                input
                    .as_str()
                    .map_or_else(|| "requested failure".to_string(), ToString::to_string),
            )
            .into()),
            "sleep" => {
                let ms = input
                    .as_u64()
                    .ok_or_else(|| io::Error::other("sleep expects milliseconds"))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::from(ms))
            }
            "upper" => {
                let text = input
                    .as_str()
                    .ok_or_else(|| io::Error::other("upper expects a string"))?;
                Ok(parse_text_output(&text.to_uppercase()))
            }
            _ => Err(io::Error::other(format!("unsupported capability: {name}")).into()),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .context("failed to read env filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn read_script(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        let mut code = String::new();
        io::stdin()
            .read_to_string(&mut code)
            .context("failed to read script from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))
    }
}

fn print_help() {
    eprintln!("Usage: sandcall run <script.js|-> [timeout_ms]");
    eprintln!();
    eprintln!("Capabilities: {}", CAPABILITIES.join(", "));
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing()?;

    let args: Vec<String> = args().skip(1).collect();
    let (path, timeout) = match args.as_slice() {
        [task, path] if task == "run" => (path, None),
        [task, path, ms] if task == "run" => {
            let ms = ms
                .parse::<u64>()
                .with_context(|| format!("invalid timeout `{ms}`"))?;
            (path, Some(Duration::from_millis(ms)))
        }
        [] => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        _ => {
            print_help();
            return Err(anyhow!("unknown task"));
        }
    };

    let code = read_script(path)?;
    let executor = Executor::new(ExecutorConfig::from_env()?);
    let mut options = ExecuteOptions::default();
    if let Some(timeout) = timeout {
        options = options.timeout(timeout);
    }

    let result = executor
        .execute(&code, CAPABILITIES, &DemoProvider, options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.success() {
        ExitCode::SUCCESS
    } else if result.timed_out() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    })
}
