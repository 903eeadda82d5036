use std::sync::Arc;

use serde_json::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Resolves capability names to real implementations.
///
/// A provider is shared by every execution running against it, so
/// implementations must tolerate concurrent calls. A returned error is relayed
/// into the script, where it surfaces as a thrown `Error` at the call site.
#[async_trait::async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn call(&self, name: &str, input: Value) -> core::result::Result<Value, BoxError>;
}

#[async_trait::async_trait]
impl<T: CapabilityProvider + ?Sized> CapabilityProvider for Arc<T> {
    async fn call(&self, name: &str, input: Value) -> core::result::Result<Value, BoxError> {
        (**self).call(name, input).await
    }
}

/// Interpret textual tool output: JSON when it parses, the raw text otherwise.
#[must_use]
pub fn parse_text_output(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
