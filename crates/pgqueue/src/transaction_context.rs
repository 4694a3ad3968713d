//! The unit of work transport operations enlist in.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::TransportError;

type Item = Arc<dyn Any + Send + Sync>;
type CommittedHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TransportError>> + Send>;
type DisposedHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A unit of work.
///
/// Holds resources keyed by name for the lifetime of the unit and the hooks
/// that run when it is committed and when it ends. Resources are created on
/// first access; concurrent requests for the same key share a single
/// initialization.
#[derive(Default)]
pub struct TransactionContext {
    items: DashMap<&'static str, Arc<OnceCell<Item>>>,
    committed_hooks: Mutex<Vec<CommittedHook>>,
    disposed_hooks: Mutex<Vec<DisposedHook>>,
    completed: AtomicBool,
    disposed: AtomicBool,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the resource stored under `key`, creating it with `factory` if absent.
    ///
    /// A failed factory leaves the key empty, so a later call may retry.
    pub async fn get_or_add<T, F, Fut>(
        &self,
        key: &'static str,
        factory: F,
    ) -> Result<Arc<T>, TransportError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, TransportError>>,
    {
        let cell = self.items.entry(key).or_default().clone();

        let item = cell
            .get_or_try_init(|| async move { factory().await.map(|value| value as Item) })
            .await?;

        Arc::clone(item)
            .downcast::<T>()
            .map_err(|_| TransportError::Persistence {
                reason: format!("context item '{key}' has an unexpected type"),
                source: None,
            })
    }

    /// Whether a resource has been stored under `key`.
    pub fn contains_key(&self, key: &'static str) -> bool {
        self.items
            .get(key)
            .is_some_and(|cell| cell.initialized())
    }

    /// Register a hook that runs when the unit of work is committed.
    pub fn on_committed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.committed_hooks
            .lock()
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Register a hook that runs when the unit of work ends, committed or not.
    pub fn on_disposed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disposed_hooks
            .lock()
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Commit: run committed hooks in registration order, stopping at the
    /// first error. Runs at most once.
    pub async fn complete(&self) -> Result<(), TransportError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let hooks = std::mem::take(&mut *self.committed_hooks.lock());
        for hook in hooks {
            hook().await?;
        }
        Ok(())
    }

    /// End the unit of work: run disposed hooks in registration order.
    /// Runs at most once, whether or not [`complete`](Self::complete) ran or failed.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.disposed_hooks.lock());
        for hook in hooks {
            hook().await;
        }
    }
}
