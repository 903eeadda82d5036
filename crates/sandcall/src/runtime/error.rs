use rquickjs::{Ctx, Value};
use thiserror::Error;

use super::console;

/// Failure of a single script execution, reported in `ExecutionResult::error`.
#[derive(Error, Debug)]
pub(super) enum ScriptError {
    #[error("{0}")]
    Thrown(String),

    #[error("return value is not JSON-serializable: {0}")]
    Unserializable(String),

    #[error("script awaited a promise that can never settle")]
    Unsettled,

    #[error("protocol fault: {0}")]
    Protocol(String),

    #[error("execution terminated by host")]
    Terminated,
}

impl ScriptError {
    pub(super) fn from_js_catch(ctx: &Ctx<'_>) -> Self {
        Self::Thrown(describe(ctx, ctx.catch()))
    }

    pub(super) fn from_protocol(error: &crate::Error) -> Self {
        match error {
            crate::Error::Protocol(reason) => Self::Protocol(reason.clone()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Render a thrown JS value, `String(error)` plus stack for `Error` objects.
pub(super) fn describe<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    let text = if let Some(exc) = value.as_exception() {
        let text = console::coerce(ctx, value.clone());
        match exc.stack() {
            Some(stack) if !stack.trim().is_empty() => format!("{text}\n\n{}", stack.trim_end()),
            _ => text,
        }
    } else {
        console::format_value(ctx, value)
    };
    if text.is_empty() {
        "script threw an empty value".to_string()
    } else {
        text
    }
}
