use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::{Ctx, Function, Object, Value, convert::Coerced, function::Rest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Ordered diagnostic output of one execution.
///
/// Shared by every console method and by the host-side handle, which reads
/// partial output when an execution is cut short.
#[derive(Clone, Debug, Default)]
pub(crate) struct LogBuffer(Arc<Mutex<Vec<String>>>);

impl LogBuffer {
    fn push(&self, level: Level, message: &str) {
        self.0
            .lock()
            .push(format!("[{}] {message}", level.as_str()));
    }

    pub(super) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Install a `console` global whose methods append to `buffer` instead of
/// writing anywhere.
pub(super) fn register<'js>(ctx: &Ctx<'js>, buffer: &LogBuffer) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    for (method, level) in [
        ("log", Level::Info),
        ("info", Level::Info),
        ("debug", Level::Debug),
        ("warn", Level::Warn),
        ("error", Level::Error),
    ] {
        let buffer = buffer.clone();
        console.set(
            method,
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let message = args
                    .0
                    .into_iter()
                    .map(|arg| format_value(&ctx, arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                buffer.push(level, &message);
            })?,
        )?;
    }

    ctx.globals().set("console", console)
}

/// Strings verbatim, objects as JSON, everything else through `String(v)`.
pub(super) fn format_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        if let Ok(s) = s.to_string() {
            return s;
        }
    }

    if value.is_object() && !value.is_function() && value.as_exception().is_none() {
        match ctx.json_stringify(value.clone()) {
            Ok(Some(json)) => {
                if let Ok(json) = json.to_string() {
                    return json;
                }
            }
            Ok(None) => {}
            Err(_) => {
                // Cyclic or BigInt-carrying objects; drop the pending exception.
                let _ = ctx.catch();
            }
        }
    }

    coerce(ctx, value)
}

pub(super) fn coerce<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    value.get::<Coerced<String>>().map_or_else(
        |_| {
            let _ = ctx.catch();
            "<unprintable value>".to_string()
        },
        |coerced| coerced.0,
    )
}
