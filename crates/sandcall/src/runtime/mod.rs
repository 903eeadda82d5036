//! Isolation units.
//!
//! Each unit is one QuickJS runtime living on its own OS thread. The host
//! talks to it exclusively through an [`Endpoint`] pair; the unit has no
//! other reference to host state. Dropping the [`IsolatedRuntime`] handle
//! raises the interrupt flag (aborting running script code) and closes the
//! host → runtime channel (waking a runtime blocked on a capability
//! response), after which the thread exits on its own.
//! [`IsolatedRuntime::shutdown`] does the same and waits for the exit.

mod console;
mod error;
mod value;
mod worker;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::oneshot;

use crate::{
    config::ExecutorConfig,
    error::{Error, Result},
    protocol::{self, Endpoint, HostMessage, RuntimeMessage},
};

pub(crate) use console::LogBuffer;

pub(crate) type HostEndpoint = Endpoint<HostMessage, RuntimeMessage>;
pub(crate) type RuntimeEndpoint = Endpoint<RuntimeMessage, HostMessage>;

const THREAD_NAME: &str = "sandcall-runtime";

/// Count of isolation units whose thread has not exited yet.
#[derive(Clone, Debug, Default)]
pub(crate) struct LiveUnits(Arc<AtomicUsize>);

impl LiveUnits {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> LiveGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        LiveGuard(Arc::clone(&self.0))
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct IsolatedRuntime {
    endpoint: HostEndpoint,
    interrupt: Arc<AtomicBool>,
    logs: LogBuffer,
    exited: Option<oneshot::Receiver<()>>,
}

impl IsolatedRuntime {
    /// Start a fresh unit and wait until its engine is ready.
    ///
    /// # Errors
    /// [`Error::Setup`] if the thread cannot be spawned or the engine cannot
    /// be created.
    pub(crate) async fn spawn(config: &ExecutorConfig, live: &LiveUnits) -> Result<Self> {
        let (endpoint, remote) = protocol::channel::<HostMessage, RuntimeMessage>();
        let interrupt = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        let logs = LogBuffer::default();

        let limits = worker::Limits {
            max_memory: config.max_memory,
            max_stack_size: config.max_stack_size,
        };
        let guard = live.enter();
        let flag = Arc::clone(&interrupt);
        let buffer = logs.clone();
        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .stack_size(config.thread_stack_size)
            .spawn(move || {
                // Dropped in reverse order: the live count drops before the
                // exit signal fires.
                let _exited = exit_tx;
                let _guard = guard;
                worker::run(&limits, flag, remote, &buffer, ready_tx);
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                endpoint,
                interrupt,
                logs,
                exited: Some(exit_rx),
            }),
            Ok(Err(message)) => {
                let _ = exit_rx.await;
                Err(Error::Setup(message))
            }
            Err(_) => Err(Error::Setup("runtime thread exited during startup".into())),
        }
    }

    pub(crate) fn endpoint(&mut self) -> &mut HostEndpoint {
        &mut self.endpoint
    }

    /// Diagnostic output captured so far.
    pub(crate) fn logs(&self) -> LogBuffer {
        self.logs.clone()
    }

    fn terminate(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Terminate the unit and wait until its thread has exited.
    pub(crate) async fn shutdown(mut self) {
        self.terminate();
        let exited = self.exited.take();
        // Closes the host → runtime channel.
        drop(self);
        if let Some(exited) = exited {
            let _ = exited.await;
        }
    }
}

impl Drop for IsolatedRuntime {
    fn drop(&mut self) {
        self.terminate();
    }
}
