//! Generic list-then-watch loop over at most one resource (Job, Pod) or one
//! event stream.
//!
//! A cycle lists once with a bounded timeout, then follows with a long-lived
//! watch from the last acknowledged resource version. Unique kinds end the
//! cycle with the `Done` sentinel once a terminal object is observed, whether
//! listed or watched. A clean stream end restarts the watch; failures, and
//! streams closed early without sending anything, back off exponentially.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vigil_core::{CauseToken, Latch, LatchHandle, WatchError, WatcherConfig};

use crate::client::{ClientError, ListOptions, ResourceClient, WatchItem};
use crate::kinds::WatchedKind;

/// Receives every delivered object, in receipt order.
pub type Listener<K> = Arc<dyn Fn(K) + Send + Sync>;

pub struct ResourceWatcher<K: WatchedKind> {
    inner: Arc<Inner<K>>,
}

impl<K: WatchedKind> Clone for ResourceWatcher<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<K: WatchedKind> {
    client: Arc<dyn ResourceClient<K>>,
    cursor: Mutex<Cursor>,
    listener: Listener<K>,
    config: WatcherConfig,
    /// Selector is known.
    ready: Latch<()>,
    /// First read completed.
    started: Latch<()>,
    existed: AtomicBool,
    token: CauseToken,
}

#[derive(Default)]
struct Cursor {
    opts: ListOptions,
    /// Delivery keys already handed to the listener.
    seen: FxHashSet<String>,
}

struct ReadOutcome {
    count: usize,
    /// The resource existed before and is gone now.
    done: bool,
}

enum WatchEnd {
    /// Cancelled or terminal; the token carries the cause.
    Stopped,
    /// Server closed the stream cleanly. `idle` when it sent nothing and
    /// closed before the requested timeout.
    Closed { idle: bool },
    /// Resource version too old to resume from.
    Expired,
    Failed(String),
}

/// Move `current` to `next` unless both are numeric and `next` is older.
pub fn advance_version(current: &mut Option<String>, next: Option<&str>) {
    let Some(next) = next.filter(|v| !v.is_empty()) else { return };
    let cur = current.as_deref().and_then(|c| c.parse::<u64>().ok());
    if let (Some(cur), Ok(n)) = (cur, next.parse::<u64>()) {
        if n < cur {
            return;
        }
    }
    *current = Some(next.to_string());
}

impl<K: WatchedKind> ResourceWatcher<K> {
    /// Start watching `opts` right away.
    pub fn spawn(
        parent: &CauseToken,
        client: Arc<dyn ResourceClient<K>>,
        opts: ListOptions,
        listener: Listener<K>,
        config: WatcherConfig,
    ) -> Self {
        let watcher = Self::build(parent, client, opts, listener, config);
        watcher.inner.ready.set(());
        let inner = Arc::clone(&watcher.inner);
        tokio::spawn(async move { inner.cycle(None).await });
        watcher
    }

    /// Start once `selector` resolves; ends with `Cancelled` if the parent goes first.
    pub fn deferred(
        parent: &CauseToken,
        client: Arc<dyn ResourceClient<K>>,
        selector: LatchHandle<ListOptions>,
        listener: Listener<K>,
        config: WatcherConfig,
    ) -> Self {
        let watcher = Self::build(parent, client, ListOptions::default(), listener, config);
        let inner = Arc::clone(&watcher.inner);
        tokio::spawn(async move { inner.cycle(Some(selector)).await });
        watcher
    }

    fn build(
        parent: &CauseToken,
        client: Arc<dyn ResourceClient<K>>,
        opts: ListOptions,
        listener: Listener<K>,
        config: WatcherConfig,
    ) -> Self {
        let inner = Inner {
            client,
            cursor: Mutex::new(Cursor { opts, seen: FxHashSet::default() }),
            listener,
            config,
            ready: Latch::new(),
            started: Latch::new(),
            existed: AtomicBool::new(false),
            token: parent.child(),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Resolves once the first read completed or the watcher ended.
    pub fn started(&self) -> impl Future<Output = ()> + Send + 'static {
        let started = self.inner.started.handle();
        let done = self.inner.token.done();
        async move {
            tokio::select! {
                _ = started.wait() => {}
                _ = done => {}
            }
        }
    }

    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.token.done()
    }

    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Why the watcher stopped; `None` while running.
    pub fn err(&self) -> Option<WatchError> {
        self.inner.token.cause()
    }

    pub fn cancel(&self) {
        self.inner.token.cancel(WatchError::Cancelled);
    }

    /// Last acknowledged resource version.
    pub async fn resource_version(&self) -> Option<String> {
        self.inner.cursor.lock().await.opts.resource_version.clone()
    }

    /// Re-read the current list to make sure nothing was missed.
    /// Returns how many new items were delivered.
    pub async fn update(&self) -> Result<usize, WatchError> {
        let ready = self.inner.ready.handle();
        tokio::select! {
            _ = ready.wait() => {}
            _ = self.inner.token.cancelled() => {}
        }
        match self.inner.read().await {
            Ok(outcome) => Ok(outcome.count),
            Err(WatchError::Done) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl<K: WatchedKind> Inner<K> {
    fn stop_error(&self) -> WatchError {
        self.token.cause().unwrap_or(WatchError::Cancelled)
    }

    async fn read(&self) -> Result<ReadOutcome, WatchError> {
        let mut cursor = self.cursor.lock().await;
        if self.token.is_cancelled() {
            return Err(self.stop_error());
        }

        let mut params = cursor.opts.clone();
        params.resource_version = None;
        params.timeout_secs.get_or_insert(self.config.list_timeout_secs);
        counter!("watch_list_total", 1u64, "kind" => K::KIND);
        let list = tokio::select! {
            res = self.client.list(&params) => res.map_err(|e| WatchError::Transport(e.to_string()))?,
            _ = self.token.cancelled() => return Err(self.stop_error()),
        };

        if K::UNIQUE && list.items.len() > 1 {
            let names: Vec<&str> = list.items.iter().map(|o| o.meta().name.as_deref().unwrap_or_default()).collect();
            return Err(WatchError::Ambiguous { kind: K::KIND, names: names.join(", ") });
        }

        advance_version(&mut cursor.opts.resource_version, list.resource_version.as_deref());

        if list.items.is_empty() {
            self.started.set(());
            if K::UNIQUE && self.existed.load(Ordering::SeqCst) {
                debug!(kind = K::KIND, "resource disappeared");
                self.token.cancel(WatchError::Done);
                return Ok(ReadOutcome { count: 1, done: true });
            }
            return Ok(ReadOutcome { count: 0, done: false });
        }

        let fresh: Vec<K> = list.items.into_iter().filter(|o| cursor.seen.insert(o.delivery_key())).collect();
        let count = fresh.len();
        let terminal = K::UNIQUE && fresh.iter().any(|o| o.is_terminal());
        if count > 0 {
            self.existed.store(true, Ordering::SeqCst);
            counter!("watch_items_total", count as u64, "kind" => K::KIND);
            for obj in fresh {
                (self.listener)(obj);
            }
        }
        self.started.set(());
        if terminal {
            debug!(kind = K::KIND, "terminal resource listed");
            self.token.cancel(WatchError::Done);
        }
        Ok(ReadOutcome { count, done: terminal })
    }

    async fn watch(&self, failures: &mut u32) -> WatchEnd {
        let mut params = self.cursor.lock().await.opts.clone();
        params.bookmarks = true;
        params.timeout_secs = Some(self.config.watch_timeout_secs);
        let opened_at = Instant::now();
        let timeout = Duration::from_secs(u64::from(self.config.watch_timeout_secs));
        let mut received = false;

        let opened = tokio::select! {
            res = self.client.watch(&params) => res,
            _ = self.token.cancelled() => return WatchEnd::Stopped,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(ClientError::Gone(_)) => return WatchEnd::Expired,
            Err(e) => return WatchEnd::Failed(e.to_string()),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return WatchEnd::Stopped,
                next = stream.next() => next,
            };
            let item = match next {
                None => return WatchEnd::Closed { idle: !received && opened_at.elapsed() < timeout },
                Some(Err(ClientError::Gone(_))) => return WatchEnd::Expired,
                Some(Err(e)) => return WatchEnd::Failed(e.to_string()),
                Some(Ok(item)) => item,
            };
            received = true;

            let mut cursor = self.cursor.lock().await;
            let (mut obj, deleted) = match item {
                WatchItem::Bookmark(version) => {
                    advance_version(&mut cursor.opts.resource_version, Some(&version));
                    continue;
                }
                WatchItem::Added(o) | WatchItem::Modified(o) => (o, false),
                WatchItem::Deleted(o) => (o, true),
            };
            advance_version(&mut cursor.opts.resource_version, obj.resource_version());
            *failures = 0;
            if deleted {
                obj.synthesize_deletion(Utc::now());
            }
            // a revision already delivered by a list still ends the cycle when terminal
            let terminal = K::UNIQUE && obj.is_terminal();
            if cursor.seen.insert(obj.delivery_key()) || deleted {
                self.existed.store(true, Ordering::SeqCst);
                counter!("watch_items_total", 1u64, "kind" => K::KIND);
                (self.listener)(obj);
            }
            drop(cursor);

            if terminal {
                self.token.cancel(WatchError::Done);
                return WatchEnd::Stopped;
            }
        }
    }

    /// Count a failed attempt; returns false once the watcher gave up.
    async fn back_off(&self, failures: &mut u32, last: String) -> bool {
        *failures += 1;
        counter!("watch_failures_total", 1u64, "kind" => K::KIND);
        if *failures >= self.config.backoff.max_failures {
            warn!(kind = K::KIND, failures = *failures, error = %last, "giving up on watch");
            self.token.cancel(WatchError::TooManyFailures { failures: *failures, last });
            return false;
        }
        let delay = self.config.backoff.delay(*failures);
        warn!(kind = K::KIND, failures = *failures, delay_ms = delay.as_millis() as u64, error = %last, "watch failed; retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.token.cancelled() => false,
        }
    }

    async fn cycle(self: Arc<Self>, selector: Option<LatchHandle<ListOptions>>) {
        if let Some(selector) = selector {
            let opts = tokio::select! {
                v = selector.wait() => v,
                _ = self.token.cancelled() => None,
            };
            let Some(mut opts) = opts else {
                self.token.cancel(WatchError::Cancelled);
                self.started.set(());
                return;
            };
            opts.resource_version = None;
            self.cursor.lock().await.opts = opts;
            self.ready.set(());
        }

        let selector = self.cursor.lock().await.opts.describe();
        info!(kind = K::KIND, selector = %selector, "watcher started");

        match self.read().await {
            Ok(outcome) if outcome.done => {}
            Ok(outcome) => {
                debug!(kind = K::KIND, count = outcome.count, "initial read");
                self.follow().await;
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(kind = K::KIND, error = %e, "initial read rejected");
                } else {
                    warn!(kind = K::KIND, error = %e, "initial read failed");
                }
                self.token.cancel(e);
            }
        }

        self.started.set(());
        info!(kind = K::KIND, cause = ?self.token.cause(), "watcher stopped");
    }

    async fn follow(&self) {
        let mut failures = 0u32;
        loop {
            match self.watch(&mut failures).await {
                WatchEnd::Stopped => return,
                WatchEnd::Closed { idle: false } => {
                    counter!("watch_restarts_total", 1u64, "kind" => K::KIND);
                    debug!(kind = K::KIND, "watch closed; resuming");
                    tokio::task::yield_now().await;
                }
                WatchEnd::Closed { idle: true } => {
                    counter!("watch_restarts_total", 1u64, "kind" => K::KIND);
                    if !self.back_off(&mut failures, "watch closed without delivering anything".to_string()).await {
                        return;
                    }
                }
                WatchEnd::Expired => {
                    counter!("watch_restarts_total", 1u64, "kind" => K::KIND);
                    debug!(kind = K::KIND, "resource version expired; relisting");
                    match self.read().await {
                        Ok(outcome) if outcome.done => return,
                        Ok(_) => {}
                        Err(e) if e.is_fatal() || self.token.is_cancelled() => {
                            self.token.cancel(e);
                            return;
                        }
                        Err(e) => {
                            if !self.back_off(&mut failures, e.to_string()).await {
                                return;
                            }
                        }
                    }
                }
                WatchEnd::Failed(msg) => {
                    if !self.back_off(&mut failures, msg).await {
                        return;
                    }
                }
            }
        }
    }
}
