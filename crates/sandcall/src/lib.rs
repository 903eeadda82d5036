//! Sandboxed script execution with host capability callbacks.
//!
//! A script body runs inside an isolated QuickJS runtime on its own thread.
//! The only way out of the sandbox is the `tools` parameter, which proxies
//! each declared capability name back to a host [`CapabilityProvider`].
//!
//! ```no_run
//! # async fn run(provider: &impl sandcall::CapabilityProvider) -> sandcall::Result<()> {
//! let result = sandcall::execute(
//!     "const r = await tools.echo({ x: 1 }); return r.x + 1;",
//!     &["echo"],
//!     provider,
//!     sandcall::ExecuteOptions::default(),
//! )
//! .await?;
//! assert!(result.success());
//! # Ok(())
//! # }
//! ```

pub mod completer;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod provider;
mod runtime;

pub const TRACE_TARGET_SCRIPT: &str = "sandcall::script";

pub use completer::{Completer, WaitError};
pub use config::{ExecuteOptions, ExecutorConfig};
pub use controller::{Executor, Terminal, execute};
pub use error::{Error, Result};
pub use protocol::ExecutionResult;
pub use provider::{BoxError, CapabilityProvider};
pub use tokio_util::sync::CancellationToken;
