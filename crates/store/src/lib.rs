//! Vigil store: per-resource stores between the resource watchers and the
//! reconciliation loop.
//!
//! Watchers write from their own task, the orchestrator drains. Every write
//! bumps the shared [`Update`] epoch, so one subscriber can wait on all stores
//! at once, while each store also keeps its own epoch for per-resource waits.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use rustc_hash::FxHashSet;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Signal {
    epoch: u64,
    closed: bool,
}

/// Change broadcast shared by a group of stores.
#[derive(Debug)]
pub struct Update {
    tx: watch::Sender<Signal>,
}

impl Default for Update {
    fn default() -> Self {
        Self::new()
    }
}

impl Update {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Signal::default());
        Self { tx }
    }

    pub fn emit(&self) {
        self.tx.send_modify(|s| s.epoch = s.epoch.wrapping_add(1));
    }

    /// No more writes will come; subscribers observe the end of the stream.
    pub fn close(&self) {
        self.tx.send_modify(|s| s.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    /// Subscribers only see updates emitted after subscribing.
    pub fn subscribe(&self) -> UpdateRx {
        UpdateRx { rx: self.tx.subscribe() }
    }
}

pub struct UpdateRx {
    rx: watch::Receiver<Signal>,
}

impl UpdateRx {
    /// Wait for the next update. `false` once the stream is closed.
    pub async fn next(&mut self) -> bool {
        if self.rx.borrow().closed {
            return false;
        }
        if self.rx.changed().await.is_err() {
            return false;
        }
        !self.rx.borrow_and_update().closed
    }
}

/// Latest-value store (Job, Pod).
pub struct Value<T> {
    latest: ArcSwapOption<T>,
    dirty: AtomicBool,
    epoch: watch::Sender<u64>,
    update: Arc<Update>,
}

impl<T> Value<T> {
    pub fn new(update: Arc<Update>) -> Self {
        let (epoch, _rx) = watch::channel(0);
        Self { latest: ArcSwapOption::empty(), dirty: AtomicBool::new(false), epoch, update }
    }

    pub fn put(&self, value: T) {
        self.latest.store(Some(Arc::new(value)));
        self.dirty.store(true, Ordering::SeqCst);
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
        self.update.emit();
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.latest.load_full()
    }

    /// The latest value, if it changed since the previous drain.
    pub fn drain(&self) -> Option<Arc<T>> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.latest.load_full()
        } else {
            None
        }
    }

    /// Per-store change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

struct Pending<T> {
    items: Vec<T>,
    keys: FxHashSet<String>,
    total: usize,
}

/// Accumulating store (events). Items with an already seen key are dropped.
pub struct List<T> {
    pending: Mutex<Pending<T>>,
    key: KeyFn<T>,
    epoch: watch::Sender<u64>,
    update: Arc<Update>,
}

impl<T> List<T> {
    pub fn new(update: Arc<Update>, key: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        let (epoch, _rx) = watch::channel(0);
        let pending = Pending { items: Vec::new(), keys: FxHashSet::default(), total: 0 };
        Self { pending: Mutex::new(pending), key: Box::new(key), epoch, update }
    }

    fn lock(&self) -> MutexGuard<'_, Pending<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` for a duplicate.
    pub fn put(&self, item: T) -> bool {
        let key = (self.key)(&item);
        {
            let mut p = self.lock();
            if !p.keys.insert(key) {
                return false;
            }
            p.items.push(item);
            p.total += 1;
        }
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
        self.update.emit();
        true
    }

    /// Take everything added since the previous drain, in insertion order.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut self.lock().items)
    }

    /// Distinct items ever accepted.
    pub fn total(&self) -> usize {
        self.lock().total
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}
