//! Host side of an execution.
//!
//! [`Executor::execute`] creates one isolation unit, pumps its messages
//! (routing capability calls to the provider), waits for the terminal result
//! under the timeout and cancellation signal, and tears the unit down on every
//! exit path.

use std::{collections::HashSet, fmt, time::Duration};

use futures::{StreamExt, stream::FuturesUnordered};
use serde_json::Value;
use tracing::{Instrument, debug, field, info_span, warn};

use crate::{
    TRACE_TARGET_SCRIPT,
    completer::{Completer, WaitError},
    config::{ExecuteOptions, ExecutorConfig},
    error::{Error, Result},
    protocol::{CorrelationId, ExecutionResult, HostMessage, RuntimeMessage},
    provider::{BoxError, CapabilityProvider},
    runtime::{HostEndpoint, IsolatedRuntime, LiveUnits, LogBuffer},
};

const TIMEOUT_ERROR: &str = "timeout";
const CANCELLED_ERROR: &str = "cancelled";
const EXITED_ERROR: &str = "isolated runtime exited without reporting a result";

/// Terminal state of one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Runs scripts, one fresh isolation unit per call.
#[derive(Clone, Debug, Default)]
pub struct Executor {
    config: ExecutorConfig,
    live: LiveUnits,
}

impl Executor {
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            live: LiveUnits::default(),
        }
    }

    /// Isolation units created by this executor whose thread is still alive.
    ///
    /// Only executions still in progress count; `execute` returns after its
    /// unit's thread has exited.
    #[must_use]
    pub fn live_units(&self) -> usize {
        self.live.count()
    }

    /// Run `code` as the body of an async function receiving `tools`, a proxy
    /// exposing exactly the capabilities named in `capabilities`.
    ///
    /// Script failures, capability failures, protocol faults, timeouts and
    /// cancellation are all reported inside the returned [`ExecutionResult`].
    ///
    /// # Errors
    /// [`Error::Setup`] if no isolation unit could be started.
    pub async fn execute<P, S>(
        &self,
        code: &str,
        capabilities: &[S],
        provider: &P,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult>
    where
        P: CapabilityProvider + ?Sized,
        S: AsRef<str>,
    {
        let span = info_span!(
            target: TRACE_TARGET_SCRIPT,
            "sandbox.execute",
            capabilities = capabilities.len(),
            terminal = field::Empty,
        );
        self.execute_inner(code, capabilities, provider, options)
            .instrument(span)
            .await
    }

    async fn execute_inner<P, S>(
        &self,
        code: &str,
        capabilities: &[S],
        provider: &P,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult>
    where
        P: CapabilityProvider + ?Sized,
        S: AsRef<str>,
    {
        let capabilities: Vec<String> = capabilities
            .iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);

        let mut unit = IsolatedRuntime::spawn(&self.config, &self.live).await?;
        let terminal = Completer::<ExecutionResult>::new();

        let started = unit.endpoint().send(&HostMessage::Execute {
            code: code.to_string(),
            capabilities: capabilities.clone(),
        });
        if let Err(e) = started {
            unit.shutdown().await;
            return Err(Error::Setup(format!("failed to start execution: {e}")));
        }

        let declared: HashSet<&str> = capabilities.iter().map(String::as_str).collect();
        let logs = unit.logs();
        let result = {
            let pump = pump(unit.endpoint(), provider, &declared, &terminal);
            tokio::pin!(pump);
            let settled = async {
                tokio::select! {
                    outcome = terminal.wait(options.cancel.as_ref()) => outcome,
                    () = &mut pump => terminal.wait(options.cancel.as_ref()).await,
                }
            };
            settle(tokio::time::timeout(timeout, settled).await, timeout, &logs)
        };

        unit.shutdown().await;

        let state = classify(&result);
        tracing::Span::current().record("terminal", field::display(state));
        debug!(target: TRACE_TARGET_SCRIPT, %state, "isolated runtime torn down");
        Ok(result)
    }
}

/// Run with the default [`ExecutorConfig`].
///
/// # Errors
/// [`Error::Setup`] if no isolation unit could be started.
pub async fn execute<P, S>(
    code: &str,
    capabilities: &[S],
    provider: &P,
    options: ExecuteOptions,
) -> Result<ExecutionResult>
where
    P: CapabilityProvider + ?Sized,
    S: AsRef<str>,
{
    Executor::default()
        .execute(code, capabilities, provider, options)
        .await
}

fn settle(
    waited: core::result::Result<
        core::result::Result<ExecutionResult, WaitError<String>>,
        tokio::time::error::Elapsed,
    >,
    timeout: Duration,
    logs: &LogBuffer,
) -> ExecutionResult {
    match waited {
        Ok(Ok(result)) => result,
        Ok(Err(WaitError::Rejected(error))) => ExecutionResult::failed(error, logs.snapshot()),
        Ok(Err(WaitError::Cancelled)) => {
            debug!(target: TRACE_TARGET_SCRIPT, "execution cancelled");
            ExecutionResult::timed_out_with(CANCELLED_ERROR, logs.snapshot())
        }
        Err(_) => {
            warn!(
                target: TRACE_TARGET_SCRIPT,
                ?timeout,
                "execution timed out"
            );
            ExecutionResult::timed_out_with(TIMEOUT_ERROR, logs.snapshot())
        }
    }
}

fn classify(result: &ExecutionResult) -> Terminal {
    match (result.success(), result.timed_out(), result.error()) {
        (true, _, _) => Terminal::Completed,
        (false, true, Some(CANCELLED_ERROR)) => Terminal::Cancelled,
        (false, true, _) => Terminal::TimedOut,
        (false, false, _) => Terminal::Failed,
    }
}

/// Relay messages until the runtime reports its result, settling `terminal`
/// exactly once before returning.
///
/// Capability calls run concurrently and are answered as they complete.
async fn pump<P: CapabilityProvider + ?Sized>(
    endpoint: &mut HostEndpoint,
    provider: &P,
    declared: &HashSet<&str>,
    terminal: &Completer<ExecutionResult>,
) {
    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some((correlation_id, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                reply(endpoint, correlation_id, outcome);
            }
            frame = endpoint.recv() => match frame {
                Some(Ok(RuntimeMessage::ToolUse { correlation_id, name, input })) => {
                    if !declared.contains(name.as_str()) {
                        reply(
                            endpoint,
                            correlation_id,
                            Err(format!("capability `{name}` is not available").into()),
                        );
                        continue;
                    }
                    debug!(target: TRACE_TARGET_SCRIPT, %correlation_id, %name, "capability call");
                    in_flight.push(call(provider, correlation_id, name, input));
                }
                Some(Ok(RuntimeMessage::Result(result))) => {
                    terminal.resolve(result);
                    return;
                }
                Some(Err(fault)) => {
                    warn!(
                        target: TRACE_TARGET_SCRIPT,
                        %fault,
                        "invalid message from isolated runtime"
                    );
                    terminal.reject(fault.to_string());
                    return;
                }
                None => {
                    terminal.reject(EXITED_ERROR.to_string());
                    return;
                }
            },
        }
    }
}

async fn call<P: CapabilityProvider + ?Sized>(
    provider: &P,
    correlation_id: CorrelationId,
    name: String,
    input: Value,
) -> (CorrelationId, core::result::Result<Value, BoxError>) {
    let outcome = provider.call(&name, input).await;
    (correlation_id, outcome)
}

fn reply(
    endpoint: &HostEndpoint,
    correlation_id: CorrelationId,
    outcome: core::result::Result<Value, BoxError>,
) {
    let message = match outcome {
        Ok(result) => HostMessage::ToolResponse {
            correlation_id,
            result,
        },
        Err(error) => {
            debug!(target: TRACE_TARGET_SCRIPT, %correlation_id, %error, "capability failed");
            HostMessage::ToolError {
                correlation_id,
                error: error.to_string(),
            }
        }
    };
    // A closed channel means the runtime is gone; the pump notices on recv.
    let _ = endpoint.send(&message);
}
