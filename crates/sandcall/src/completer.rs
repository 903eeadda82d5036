//! Single-resolution awaitable settled from outside the awaiting code.
//!
//! A [`Completer`] starts empty. The first call to [`Completer::resolve`] or
//! [`Completer::reject`] settles it; every later call is a no-op that reports
//! `false`. [`Completer::wait`] may be called any number of times, from any
//! number of tasks, and yields the settled outcome. Cancelling a wait abandons
//! it without touching the completer, so a completer can still be settled and
//! observed after a cancelled wait.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError<E> {
    #[error("{0}")]
    Rejected(E),

    #[error("wait cancelled")]
    Cancelled,
}

pub struct Completer<T, E = String> {
    slot: Mutex<Option<Result<T, E>>>,
    notify: Notify,
}

impl<T, E> Default for Completer<T, E> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T, E> Completer<T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.notify.notify_waiters();
        true
    }
}

impl<T: Clone, E: Clone> Completer<T, E> {
    /// Wait for the completer to settle.
    ///
    /// An already settled completer always yields its outcome, even when
    /// `cancel` has fired too.
    ///
    /// # Errors
    /// [`WaitError::Rejected`] when settled through [`Completer::reject`],
    /// [`WaitError::Cancelled`] when `cancel` fires first.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<T, WaitError<E>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the slot so a settle racing
            // with this check is not missed.
            notified.as_mut().enable();

            if let Some(outcome) = self.slot.lock().clone() {
                return outcome.map_err(WaitError::Rejected);
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = token.cancelled() => return Err(WaitError::Cancelled),
                    }
                }
                None => notified.await,
            }
        }
    }
}
