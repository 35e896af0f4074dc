//! Per-session cancellation signal.
//!
//! The flag is a `tokio::sync::watch` channel so it can be polled
//! synchronously at call boundaries and awaited inside a `select!` race.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{ShellError, ShellResult};

/// Cancellation flag shared by every object of one session.
#[derive(Debug, Clone)]
pub struct InterruptFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Every pending wrapped call observes it.
    pub fn set(&self) {
        self.tx.send_replace(true);
        log::debug!("interrupt flag set");
    }

    /// Clear the signal so further calls can proceed.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fail with [`ShellError::Interrupted`] if the signal is raised.
    pub fn checkpoint(&self) -> ShellResult<()> {
        if self.is_set() {
            Err(ShellError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal is raised, immediately if it already is.
    pub async fn interrupted(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|raised| *raised).await.is_err() {
            // Sender lives as long as `self`, so this only happens on teardown.
            futures::future::pending::<()>().await;
        }
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}
