//! Single-assignment latch.
//!
//! A `Latch<T>` is set at most once. Readers either peek (`get`, `is_set`) or
//! take an owned [`LatchHandle`] and await the value, which makes it usable as
//! a one-shot promise across tasks.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set the value. Returns `false` (and drops `value`) when already set.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn handle(&self) -> LatchHandle<T> {
        LatchHandle { rx: self.tx.subscribe() }
    }
}

/// Owned, awaitable view of a [`Latch`].
#[derive(Debug, Clone)]
pub struct LatchHandle<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> LatchHandle<T> {
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Resolves with the value once set; `None` if the latch is dropped unset.
    pub async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        }
    }
}
