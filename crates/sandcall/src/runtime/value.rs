use rquickjs::{Ctx, Value};

/// JS → JSON through the engine's own `JSON.stringify`.
///
/// `undefined`, functions and symbols become `null`. Throws (returns `Err`
/// with a pending exception) for values `JSON.stringify` rejects.
pub(super) fn to_json<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> rquickjs::Result<serde_json::Value> {
    let Some(text) = ctx.json_stringify(value)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string()?;
    serde_json::from_str(&text).map_err(|e| {
        rquickjs::Exception::throw_type(ctx, &format!("invalid JSON from engine: {e}"))
    })
}

pub(super) fn from_json<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    ctx.json_parse(value.to_string())
}
