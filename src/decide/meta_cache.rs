//! Capped, most-recent-first cache of event metadata for diagnostics.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::model::MetaHandle;

/// Callback invoked with the current cache contents, newest first.
pub type MetaObserver = Box<dyn Fn(&[MetaHandle]) + Send + Sync>;

/// Fixed-capacity list of recently processed events' metadata.
///
/// Adding an entry beyond capacity drops the oldest one. Every add and
/// every [`MetaCache::notify_observers`] only marks the cache as changed;
/// [`MetaCache::run_observers`] delivers the changes on the blocking pool,
/// coalescing bursts so observers see the latest contents. A panicking
/// observer is logged and skipped.
pub struct MetaCache {
    capacity: usize,
    entries: Mutex<VecDeque<MetaHandle>>,
    observers: RwLock<Vec<MetaObserver>>,
    changes: watch::Sender<u64>,
}

impl MetaCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            observers: RwLock::new(Vec::new()),
            changes: watch::channel(0).0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add(&self, meta: MetaHandle) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.push_front(meta);
            entries.truncate(self.capacity);
        }
        self.notify_observers();
    }

    /// Adds `meta` unless the same handle is already cached.
    ///
    /// Returns whether it was added.
    pub fn add_if_absent(&self, meta: &MetaHandle) -> bool {
        if self.contains(meta) {
            return false;
        }
        self.add(meta.clone());
        true
    }

    pub fn contains(&self, meta: &MetaHandle) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().any(|m| m.same_as(meta))
    }

    /// Cached handles, newest first.
    pub fn snapshot(&self) -> Vec<MetaHandle> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&[MetaHandle]) + Send + Sync + 'static,
    {
        let mut observers = self.observers.write().unwrap_or_else(|p| p.into_inner());
        observers.push(Box::new(observer));
    }

    /// Marks the cache as changed; never waits for the observers.
    pub fn notify_observers(&self) {
        self.changes
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Delivers change notifications until `cancel` fires, then flushes a
    /// pending change once.
    pub async fn run_observers(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.changes.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            self.clone().deliver_blocking().await;
        }
        if changes.has_changed().unwrap_or(false) {
            self.clone().deliver_blocking().await;
        }
        debug!("Meta cache observers stopped");
    }

    async fn deliver_blocking(self: Arc<Self>) {
        if let Err(e) = tokio::task::spawn_blocking(move || self.deliver()).await {
            error!(error = %e, "Meta cache observer delivery failed");
        }
    }

    fn deliver(&self) {
        let snapshot = self.snapshot();
        let observers = self.observers.read().unwrap_or_else(|p| p.into_inner());
        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(&snapshot))).is_err() {
                error!(observer = index, "Meta cache observer panicked");
            }
        }
    }
}

impl std::fmt::Debug for MetaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
