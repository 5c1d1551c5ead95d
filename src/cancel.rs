//! Cooperative cancellation for pulls.
//!
//! A [`Cancellation`] is a cheap, cloneable view of a cancel flag backed by a
//! `tokio::sync::watch` channel. Async stages await [`Cancellation::cancelled`];
//! the blocking unpack polls [`Cancellation::check`] between archive entries.
//! A [`CancelScope`] derives a child flag that trips when its parent does or
//! when a deadline expires, and trips unconditionally when dropped so that
//! nothing keeps writing after its owner is gone.

use crate::error::{CancelReason, PullError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl Cancellation {
    /// A flag that never trips.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(PullError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Resolves once the flag trips. Pends forever if it never can.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owner side of a [`Cancellation`].
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<Option<CancelReason>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.trigger(CancelReason::Cancelled);
    }

    /// First reason wins; later triggers are ignored.
    fn trigger(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Child cancellation bound to one pull: parent cancel or deadline trips it.
pub struct CancelScope {
    source: Arc<CancelSource>,
    watcher: JoinHandle<()>,
}

impl CancelScope {
    /// Must be called from within a tokio runtime.
    pub fn new(parent: &Cancellation, deadline: Option<Duration>) -> Self {
        let source = Arc::new(CancelSource::new());
        let child = Arc::clone(&source);
        let parent = parent.clone();

        let watcher = tokio::spawn(async move {
            let reason = match deadline {
                Some(limit) => tokio::select! {
                    reason = parent.cancelled() => reason,
                    _ = tokio::time::sleep(limit) => CancelReason::DeadlineExceeded,
                },
                None => parent.cancelled().await,
            };
            child.trigger(reason);
        });

        Self { source, watcher }
    }

    pub fn token(&self) -> Cancellation {
        self.source.token()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.watcher.abort();
        self.source.cancel();
    }
}
