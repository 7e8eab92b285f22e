//! In-memory [`ResourceClient`] with a scripted history, for tests.
//!
//! Every mutation bumps a global version counter and is broadcast to open
//! watches; a watch opened at version `v` first replays the history newer
//! than `v`. Selectors are evaluated against the serialized object with plain
//! `path=value` terms (`metadata.name`, `involvedObject.kind`, labels).

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::stream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::{ClientError, ListOptions, ResourceClient, ResourceList, WatchItem, WatchStream};
use crate::kinds::WatchedKind;

type Sender<K> = mpsc::UnboundedSender<Result<WatchItem<K>, ClientError>>;

pub struct ScriptedClient<K> {
    state: Mutex<Scripted<K>>,
    _kind: PhantomData<fn() -> K>,
}

struct Scripted<K> {
    version: u64,
    items: Vec<K>,
    history: Vec<(u64, WatchItem<K>)>,
    compacted_at: u64,
    watches: Vec<(ListOptions, Sender<K>)>,
    list_calls: usize,
    watch_calls: usize,
    list_failures: VecDeque<ClientError>,
    watch_failures: VecDeque<ClientError>,
}

impl<K: WatchedKind + Serialize> Default for ScriptedClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: WatchedKind + Serialize> ScriptedClient<K> {
    pub fn new() -> Self {
        let state = Scripted {
            version: 0,
            items: Vec::new(),
            history: Vec::new(),
            compacted_at: 0,
            watches: Vec::new(),
            list_calls: 0,
            watch_calls: 0,
            list_failures: VecDeque::new(),
            watch_failures: VecDeque::new(),
        };
        Self { state: Mutex::new(state), _kind: PhantomData }
    }

    fn lock(&self) -> MutexGuard<'_, Scripted<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace the object with the same name. Returns the assigned version.
    pub fn apply(&self, mut obj: K) -> String {
        let mut s = self.lock();
        s.version += 1;
        let version = s.version.to_string();
        obj.meta_mut().resource_version = Some(version.clone());
        let name = obj.meta().name.clone();
        let item = match s.items.iter().position(|o| o.meta().name == name) {
            Some(pos) => {
                s.items[pos] = obj.clone();
                WatchItem::Modified(obj)
            }
            None => {
                s.items.push(obj.clone());
                WatchItem::Added(obj)
            }
        };
        s.record(item);
        version
    }

    /// Remove the object, broadcasting the last known state as deleted.
    pub fn delete(&self, name: &str) {
        let mut s = self.lock();
        let Some(pos) = s.items.iter().position(|o| o.meta().name.as_deref() == Some(name)) else { return };
        let mut obj = s.items.remove(pos);
        s.version += 1;
        obj.meta_mut().resource_version = Some(s.version.to_string());
        s.record(WatchItem::Deleted(obj));
    }

    /// Advance the version without touching objects and tell open watches.
    pub fn bookmark(&self) {
        let mut s = self.lock();
        s.version += 1;
        let item = WatchItem::Bookmark(s.version.to_string());
        s.watches.retain(|(_, tx)| tx.send(Ok(item.clone())).is_ok());
    }

    pub fn fail_next_list(&self, err: ClientError) {
        self.lock().list_failures.push_back(err);
    }

    pub fn fail_next_watch(&self, err: ClientError) {
        self.lock().watch_failures.push_back(err);
    }

    /// Push `err` into every open watch stream and close them.
    pub fn break_watches(&self, err: ClientError) {
        let mut s = self.lock();
        for (_, tx) in s.watches.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// End every open watch stream cleanly.
    pub fn close_watches(&self) {
        self.lock().watches.clear();
    }

    /// Forget history up to now; older resume points then fail with `Gone`.
    pub fn compact(&self) {
        let mut s = self.lock();
        s.history.clear();
        s.compacted_at = s.version;
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    pub fn open_watches(&self) -> usize {
        self.lock().watches.len()
    }
}

impl<K: WatchedKind + Serialize> Scripted<K> {
    fn record(&mut self, item: WatchItem<K>) {
        let version = self.version;
        self.watches.retain(|(opts, tx)| !item_matches(opts, &item) || tx.send(Ok(item.clone())).is_ok());
        self.history.push((version, item));
    }
}

fn item_matches<K: Serialize>(opts: &ListOptions, item: &WatchItem<K>) -> bool {
    match item {
        WatchItem::Added(o) | WatchItem::Modified(o) | WatchItem::Deleted(o) => matches(opts, o),
        WatchItem::Bookmark(_) => true,
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, segment| v.get(segment))
}

fn terms(selector: &Option<String>) -> impl Iterator<Item = (&str, &str)> {
    selector
        .as_deref()
        .into_iter()
        .flat_map(|s| s.split(','))
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Evaluate `opts` selectors against an object.
pub fn matches<K: Serialize>(opts: &ListOptions, obj: &K) -> bool {
    let Ok(v) = serde_json::to_value(obj) else { return false };
    let labels = v.get("metadata").and_then(|m| m.get("labels"));
    let labels_ok = terms(&opts.label_selector)
        .all(|(k, want)| labels.and_then(|l| l.get(k)).and_then(Value::as_str) == Some(want));
    let fields_ok =
        terms(&opts.field_selector).all(|(path, want)| lookup(&v, path).and_then(Value::as_str) == Some(want));
    labels_ok && fields_ok
}

#[async_trait::async_trait]
impl<K: WatchedKind + Serialize> ResourceClient<K> for ScriptedClient<K> {
    async fn list(&self, opts: &ListOptions) -> Result<ResourceList<K>, ClientError> {
        let mut s = self.lock();
        s.list_calls += 1;
        if let Some(err) = s.list_failures.pop_front() {
            return Err(err);
        }
        let items = s.items.iter().filter(|o| matches(opts, *o)).cloned().collect();
        Ok(ResourceList { resource_version: Some(s.version.to_string()), items })
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>, ClientError> {
        let mut s = self.lock();
        s.watch_calls += 1;
        if let Some(err) = s.watch_failures.pop_front() {
            return Err(err);
        }
        let from = opts.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        if opts.resource_version.is_some() && from < s.compacted_at {
            return Err(ClientError::Gone(format!("too old resource version: {from}")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (version, item) in &s.history {
            if *version > from && item_matches(opts, item) {
                let _ = tx.send(Ok(item.clone()));
            }
        }
        s.watches.push((opts.clone(), tx));
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}
