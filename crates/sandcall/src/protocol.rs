//! Messages exchanged across the isolation boundary.
//!
//! Every message travels as one JSON text frame with a `type` discriminant.
//! Frames are validated on receipt: serde enforces the shape (known `type`,
//! required fields present, no unknown fields) and [`Message::validate`]
//! enforces the remaining invariants. Anything that fails either step is a
//! protocol fault.

use std::{collections::HashSet, fmt, marker::PhantomData};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Token pairing a capability invocation with its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host → runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum HostMessage {
    Execute {
        code: String,
        capabilities: Vec<String>,
    },
    ToolResponse {
        correlation_id: CorrelationId,
        result: Value,
    },
    ToolError {
        correlation_id: CorrelationId,
        error: String,
    },
}

/// Runtime → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum RuntimeMessage {
    ToolUse {
        correlation_id: CorrelationId,
        name: String,
        input: Value,
    },
    Result(ExecutionResult),
}

/// Terminal outcome of one script execution.
///
/// Exactly one of data or error is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawExecutionResult", into = "RawExecutionResult")]
pub struct ExecutionResult {
    outcome: Outcome,
    logs: Vec<String>,
    timed_out: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Data(Value),
    Error(String),
}

impl ExecutionResult {
    #[must_use]
    pub const fn completed(data: Value, logs: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Data(data),
            logs,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Error(error.into()),
            logs,
            timed_out: false,
        }
    }

    pub(crate) fn timed_out_with(reason: &str, logs: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Error(reason.to_string()),
            logs,
            timed_out: true,
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.outcome, Outcome::Data(_))
    }

    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Data(data) => Some(data),
            Outcome::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Data(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }

    #[must_use]
    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    #[must_use]
    pub const fn timed_out(&self) -> bool {
        self.timed_out
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawExecutionResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    logs: Vec<String>,
    #[serde(default)]
    timed_out: bool,
}

impl TryFrom<RawExecutionResult> for ExecutionResult {
    type Error = String;

    fn try_from(raw: RawExecutionResult) -> core::result::Result<Self, Self::Error> {
        let outcome = match (raw.success, raw.data, raw.error) {
            (true, _, Some(_)) => return Err("successful result carries an error".into()),
            (true, _, _) if raw.timed_out => {
                return Err("successful result is flagged as timed out".into());
            }
            (true, data, None) => Outcome::Data(data.unwrap_or(Value::Null)),
            (false, Some(_), _) => return Err("failed result carries data".into()),
            (false, None, Some(error)) if !error.is_empty() => Outcome::Error(error),
            (false, None, _) => return Err("failed result has no error message".into()),
        };
        Ok(Self {
            outcome,
            logs: raw.logs,
            timed_out: raw.timed_out,
        })
    }
}

impl From<ExecutionResult> for RawExecutionResult {
    fn from(value: ExecutionResult) -> Self {
        let (data, error) = match value.outcome {
            Outcome::Data(data) => (Some(data), None),
            Outcome::Error(error) => (None, Some(error)),
        };
        Self {
            success: error.is_none(),
            data,
            error,
            logs: value.logs,
            timed_out: value.timed_out,
        }
    }
}

pub trait Message: Serialize + DeserializeOwned {
    /// Invariants serde cannot express.
    ///
    /// # Errors
    /// [`Error::Protocol`] describing the first violated invariant.
    fn validate(&self) -> Result<()>;

    /// # Errors
    /// [`Error::Protocol`] if the frame is not valid JSON, does not match the
    /// schema, or fails [`Message::validate`].
    fn decode(frame: &str) -> Result<Self> {
        let message: Self =
            serde_json::from_str(frame).map_err(|e| Error::Protocol(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// # Errors
    /// [`Error::Protocol`] if the message cannot be serialized.
    fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }
}

fn require_id(id: &CorrelationId) -> Result<()> {
    if id.as_str().is_empty() {
        return Err(Error::Protocol("empty correlation id".into()));
    }
    Ok(())
}

impl Message for HostMessage {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Execute { capabilities, .. } => {
                let mut seen = HashSet::with_capacity(capabilities.len());
                for name in capabilities {
                    if name.is_empty() {
                        return Err(Error::Protocol("empty capability name".into()));
                    }
                    if !seen.insert(name.as_str()) {
                        return Err(Error::Protocol(format!(
                            "capability `{name}` declared twice"
                        )));
                    }
                }
                Ok(())
            }
            Self::ToolResponse { correlation_id, .. } | Self::ToolError { correlation_id, .. } => {
                require_id(correlation_id)
            }
        }
    }
}

impl Message for RuntimeMessage {
    fn validate(&self) -> Result<()> {
        match self {
            Self::ToolUse {
                correlation_id,
                name,
                ..
            } => {
                require_id(correlation_id)?;
                if name.is_empty() {
                    return Err(Error::Protocol("empty capability name".into()));
                }
                Ok(())
            }
            Self::Result(_) => Ok(()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum SendError {
    #[error(transparent)]
    Encode(#[from] Error),

    #[error("peer disconnected")]
    Disconnected,
}

/// One side of the boundary: sends `S` frames, receives `R` frames.
pub(crate) struct Endpoint<S, R> {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    _marker: PhantomData<fn(S) -> R>,
}

/// Create a connected pair of endpoints.
pub(crate) fn channel<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Endpoint {
            tx: a_tx,
            rx: a_rx,
            _marker: PhantomData,
        },
        Endpoint {
            tx: b_tx,
            rx: b_rx,
            _marker: PhantomData,
        },
    )
}

/// Sending half of an [`Endpoint`], cloneable into callbacks.
pub(crate) struct Outbox<S> {
    tx: mpsc::UnboundedSender<String>,
    _marker: PhantomData<fn(S)>,
}

impl<S> Clone for Outbox<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: Message> Outbox<S> {
    pub(crate) fn send(&self, message: &S) -> core::result::Result<(), SendError> {
        let frame = message.encode()?;
        self.tx.send(frame).map_err(|_| SendError::Disconnected)
    }
}

impl<S: Message, R: Message> Endpoint<S, R> {
    pub(crate) fn send(&self, message: &S) -> core::result::Result<(), SendError> {
        let frame = message.encode()?;
        self.send_frame(frame)
    }

    pub(crate) fn send_frame(&self, frame: String) -> core::result::Result<(), SendError> {
        self.tx.send(frame).map_err(|_| SendError::Disconnected)
    }

    pub(crate) fn outbox(&self) -> Outbox<S> {
        Outbox {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }

    /// `None` once the peer is gone.
    pub(crate) async fn recv(&mut self) -> Option<Result<R>> {
        self.rx.recv().await.map(|frame| R::decode(&frame))
    }

    /// Blocking variant for the runtime thread; must not be called from
    /// within an async context.
    pub(crate) fn blocking_recv(&mut self) -> Option<Result<R>> {
        self.rx.blocking_recv().map(|frame| R::decode(&frame))
    }
}
