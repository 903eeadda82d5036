//! Executor defaults and per-call options.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_STACK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

pub const ENV_TIMEOUT_MS: &str = "SANDCALL_TIMEOUT_MS";
pub const ENV_MAX_MEMORY: &str = "SANDCALL_MAX_MEMORY";
pub const ENV_MAX_STACK_SIZE: &str = "SANDCALL_MAX_STACK_SIZE";

/// Settings shared by every execution of an [`Executor`](crate::Executor).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Used when [`ExecuteOptions::timeout`] is unset.
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// QuickJS heap limit in bytes. Unlimited when `None`.
    pub max_memory: Option<usize>,
    /// QuickJS stack limit in bytes.
    pub max_stack_size: usize,
    /// Stack size of the OS thread hosting each runtime. Must exceed
    /// `max_stack_size`.
    pub thread_stack_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_memory: None,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `SANDCALL_*` environment variables.
    ///
    /// # Errors
    /// [`Error::Config`] if a variable is set but not a valid number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_TIMEOUT_MS)? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, ENV_MAX_MEMORY)? {
            config.max_memory = Some(bytes);
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, ENV_MAX_STACK_SIZE)? {
            config.max_stack_size = bytes;
        }
        Ok(config)
    }

    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    #[must_use]
    pub const fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    #[must_use]
    pub const fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| Error::Config {
                key,
                reason: format!("{e} (got {raw:?})"),
            })
        })
        .transpose()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-call options for [`Executor::execute`](crate::Executor::execute).
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
