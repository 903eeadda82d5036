//! Runtime-side execution: compile the script body, proxy capabilities, drive
//! the resulting promise, report exactly one terminal result.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rquickjs::{Context, Ctx, Exception, Function, Object, Promise, Runtime, Value, function::Opt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    RuntimeEndpoint,
    console::{self, LogBuffer},
    error::{ScriptError, describe},
    value,
};
use crate::{
    TRACE_TARGET_SCRIPT,
    protocol::{CorrelationId, ExecutionResult, HostMessage, Outbox, RuntimeMessage},
};

/// Name of the single parameter the script body receives.
const TOOLS_PARAM: &str = "tools";

pub(super) struct Limits {
    pub(super) max_memory: Option<usize>,
    pub(super) max_stack_size: usize,
}

/// Thread entry point of an isolation unit.
pub(super) fn run(
    limits: &Limits,
    interrupt: Arc<AtomicBool>,
    mut endpoint: RuntimeEndpoint,
    logs: &LogBuffer,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let scope = match Scope::new(limits, Arc::clone(&interrupt)) {
        Ok(scope) => {
            let _ = ready.send(Ok(()));
            scope
        }
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let result = match endpoint.blocking_recv() {
        None => return,
        Some(Err(fault)) => failure(&ScriptError::from_protocol(&fault), Vec::new()),
        Some(Ok(HostMessage::Execute { code, capabilities })) => {
            scope.execute(&code, &capabilities, &mut endpoint, logs, &interrupt)
        }
        Some(Ok(other)) => failure(
            &ScriptError::Protocol(format!("expected `execute`, got {}", kind(&other))),
            Vec::new(),
        ),
    };

    if interrupt.load(Ordering::Acquire) {
        return;
    }
    if endpoint.send(&RuntimeMessage::Result(result)).is_err() {
        debug!(target: TRACE_TARGET_SCRIPT, "host went away before the result was delivered");
    }
}

fn failure(error: &ScriptError, logs: Vec<String>) -> ExecutionResult {
    ExecutionResult::failed(error.to_string(), logs)
}

const fn kind(message: &HostMessage) -> &'static str {
    match message {
        HostMessage::Execute { .. } => "`execute`",
        HostMessage::ToolResponse { .. } => "`tool_response`",
        HostMessage::ToolError { .. } => "`tool_error`",
    }
}

struct Scope {
    context: Context,
    #[allow(dead_code)] // Runtime must be kept alive for the context to function
    runtime: Runtime,
}

impl Scope {
    fn new(limits: &Limits, interrupt: Arc<AtomicBool>) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;
        runtime.set_max_stack_size(limits.max_stack_size);
        if let Some(bytes) = limits.max_memory {
            runtime.set_memory_limit(bytes);
        }
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::Acquire))));

        let context = Context::full(&runtime)?;
        Ok(Self { context, runtime })
    }

    fn execute(
        &self,
        code: &str,
        capabilities: &[String],
        endpoint: &mut RuntimeEndpoint,
        logs: &LogBuffer,
        interrupt: &AtomicBool,
    ) -> ExecutionResult {
        self.context.with(|ctx| {
            let bridge = Rc::new(Bridge::new(endpoint.outbox()));

            let outcome = install(&ctx, capabilities, &bridge, logs)
                .map_err(|_| ScriptError::from_js_catch(&ctx))
                .and_then(|tools| run_script(&ctx, code, tools, &bridge, endpoint, interrupt));

            // Settle functions held by Rust are invisible to the JS GC; release
            // them while the context is still alive.
            bridge.clear();

            match outcome {
                Ok(data) => ExecutionResult::completed(data, logs.take()),
                Err(error) => failure(&error, logs.take()),
            }
        })
    }
}

/// Pair of functions settling one proxied call's promise.
struct Settle<'js> {
    resolve: Function<'js>,
    reject: Function<'js>,
}

/// Pending Call Table plus the outbound half of the boundary.
///
/// Private to one execution; entries are inserted when a capability proxy is
/// invoked and removed exactly once, by the matching response or error.
struct Bridge<'js> {
    pending: RefCell<HashMap<CorrelationId, Settle<'js>>>,
    outbox: Outbox<RuntimeMessage>,
    prefix: u32,
    seq: Cell<u64>,
}

impl<'js> Bridge<'js> {
    fn new(outbox: Outbox<RuntimeMessage>) -> Self {
        Self {
            pending: RefCell::new(HashMap::new()),
            outbox,
            prefix: rand::random(),
            seq: Cell::new(0),
        }
    }

    fn next_id(&self) -> CorrelationId {
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        CorrelationId::new(format!("{:08x}-{seq}", self.prefix))
    }

    fn is_idle(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    fn take(&self, id: &CorrelationId) -> Option<Settle<'js>> {
        self.pending.borrow_mut().remove(id)
    }

    fn clear(&self) {
        self.pending.borrow_mut().clear();
    }

    /// Issue one capability call and return the promise the script awaits.
    fn invoke(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        input: Option<Value<'js>>,
    ) -> rquickjs::Result<Promise<'js>> {
        let input = match input {
            Some(input) => value::to_json(ctx, input)?,
            None => serde_json::Value::Null,
        };

        let (promise, resolve, reject) = Promise::new(ctx)?;
        let correlation_id = self.next_id();
        self.pending
            .borrow_mut()
            .insert(correlation_id.clone(), Settle { resolve, reject });

        let message = RuntimeMessage::ToolUse {
            correlation_id: correlation_id.clone(),
            name: name.to_string(),
            input,
        };
        if let Err(e) = self.outbox.send(&message) {
            self.take(&correlation_id);
            return Err(Exception::throw_internal(
                ctx,
                &format!("capability `{name}` unavailable: {e}"),
            ));
        }
        debug!(target: TRACE_TARGET_SCRIPT, %correlation_id, name, "capability call issued");
        Ok(promise)
    }

    /// Apply one host message to the Pending Call Table.
    fn deliver(&self, ctx: &Ctx<'js>, message: HostMessage) -> Result<(), ScriptError> {
        match message {
            HostMessage::ToolResponse {
                correlation_id,
                result,
            } => {
                let Some(settle) = self.take(&correlation_id) else {
                    debug!(
                        target: TRACE_TARGET_SCRIPT,
                        %correlation_id,
                        "discarding response for unknown call"
                    );
                    return Ok(());
                };
                // A result the engine cannot represent fails this call only.
                let settled = match value::from_json(ctx, &result) {
                    Ok(value) => settle.resolve.call::<_, ()>((value,)),
                    Err(_) => settle.reject.call::<_, ()>((ctx.catch(),)),
                };
                settled.map_err(|_| ScriptError::from_js_catch(ctx))
            }
            HostMessage::ToolError {
                correlation_id,
                error,
            } => {
                let Some(settle) = self.take(&correlation_id) else {
                    debug!(
                        target: TRACE_TARGET_SCRIPT,
                        %correlation_id,
                        "discarding error for unknown call"
                    );
                    return Ok(());
                };
                let reason = Exception::from_message(ctx.clone(), &error)
                    .map_err(|_| ScriptError::from_js_catch(ctx))?;
                settle
                    .reject
                    .call::<_, ()>((Object::clone(&reason).into_value(),))
                    .map_err(|_| ScriptError::from_js_catch(ctx))
            }
            HostMessage::Execute { .. } => Err(ScriptError::Protocol(
                "unexpected `execute` while a script is running".into(),
            )),
        }
    }
}

/// Build the `tools` object: one promise-returning function per declared
/// capability, and nothing else.
fn install<'js>(
    ctx: &Ctx<'js>,
    capabilities: &[String],
    bridge: &Rc<Bridge<'js>>,
    logs: &LogBuffer,
) -> rquickjs::Result<Object<'js>> {
    console::register(ctx, logs)?;

    let tools = Object::new(ctx.clone())?;
    for name in capabilities {
        let bridge = Rc::clone(bridge);
        let capability = name.clone();
        tools.set(
            name.as_str(),
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, input: Opt<Value<'js>>| -> rquickjs::Result<Promise<'js>> {
                    bridge.invoke(&ctx, &capability, input.0)
                },
            )?,
        )?;
    }
    Ok(tools)
}

fn run_script<'js>(
    ctx: &Ctx<'js>,
    code: &str,
    tools: Object<'js>,
    bridge: &Bridge<'js>,
    endpoint: &mut RuntimeEndpoint,
    interrupt: &AtomicBool,
) -> Result<serde_json::Value, ScriptError> {
    // `AsyncFunction(param, body)` compiles the body in global scope, so the
    // script sees the builtins, `console` and its parameter, nothing else.
    let async_function: Function<'js> = ctx
        .eval("(async function () {}).constructor")
        .map_err(|_| ScriptError::from_js_catch(ctx))?;
    let body: Function<'js> = async_function
        .call((TOOLS_PARAM, code))
        .map_err(|_| ScriptError::from_js_catch(ctx))?;

    let returned: Value<'js> = body
        .call((tools,))
        .map_err(|_| ScriptError::from_js_catch(ctx))?;
    let returned = match returned.as_promise() {
        Some(promise) => drive_promise(ctx, promise, bridge, endpoint, interrupt)?,
        None => returned,
    };

    value::to_json(ctx, returned)
        .map_err(|_| ScriptError::Unserializable(describe(ctx, ctx.catch())))
}

/// Run the script's promise to completion.
///
/// 1. Drain the microtask queue.
/// 2. If the promise is still pending, block for the next host message and
///    settle the matching pending call.
/// 3. Repeat.
fn drive_promise<'js>(
    ctx: &Ctx<'js>,
    promise: &Promise<'js>,
    bridge: &Bridge<'js>,
    endpoint: &mut RuntimeEndpoint,
    interrupt: &AtomicBool,
) -> Result<Value<'js>, ScriptError> {
    loop {
        match promise.result::<Value<'js>>() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(_)) => return Err(ScriptError::from_js_catch(ctx)),
            None => {}
        }

        while ctx.execute_pending_job() {
            if promise.result::<Value<'js>>().is_some() {
                break;
            }
        }
        if promise.result::<Value<'js>>().is_some() {
            continue;
        }

        if interrupt.load(Ordering::Acquire) {
            return Err(ScriptError::Terminated);
        }
        if bridge.is_idle() {
            return Err(ScriptError::Unsettled);
        }

        match endpoint.blocking_recv() {
            None => return Err(ScriptError::Terminated),
            Some(Err(fault)) => {
                warn!(target: TRACE_TARGET_SCRIPT, %fault, "invalid message from host");
                return Err(ScriptError::from_protocol(&fault));
            }
            Some(Ok(message)) => bridge.deliver(ctx, message)?,
        }
    }
}
