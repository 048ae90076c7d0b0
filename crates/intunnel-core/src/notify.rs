//! Snapshot broadcast primitive
//!
//! Components publish their full state into a watch channel while holding
//! their own lock; no listener code runs there. Each listener is driven by its
//! own task and always observes the latest snapshot, so a slow or re-entrant
//! listener never stalls the publisher. Thread or UI marshaling is left to
//! the listener itself.

use crate::error::{Error, Result};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Publishes full-state snapshots to any number of subscribers
#[derive(Debug)]
pub struct Notifier<T> {
    tx: watch::Sender<T>,
}

impl<T> Notifier<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the current snapshot and wake every subscriber
    pub fn publish(&self, snapshot: T) {
        self.tx.send_replace(snapshot);
    }

    /// The most recently published snapshot
    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Raw receiver for async consumers
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Invoke `listener` with the full snapshot after every publish
    ///
    /// Requires a tokio runtime. The listener stays attached until the
    /// returned handle is removed or dropped.
    pub fn add_listener<F>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(T) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut rx = self.tx.subscribe();
        let task = runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                listener(snapshot);
            }
            debug!("Notifier closed, listener detached");
        });
        Ok(ListenerHandle { task })
    }

    /// Detach a listener previously added with [`Notifier::add_listener`]
    pub fn remove_listener(&self, handle: ListenerHandle) {
        handle.remove();
    }
}

/// Keeps a listener attached; dropping it detaches the listener
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn remove(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
