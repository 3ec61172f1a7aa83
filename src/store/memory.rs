use super::{split_path, SignalingStore, SubscriptionId, Watch};
use crate::error::StoreError;
use crate::utils::now_millis;
use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Watcher {
    id: SubscriptionId,
    path: Vec<String>,
    query: Option<(String, Value)>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct Inner {
    root: Value,
    watchers: Vec<Watcher>,
    next_watch: u64,
    push_seq: u64,
    available: bool,
}

/// In-process store. Clones share the same tree, so every client of one process sees
/// the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: Value::Object(Map::new()),
                watchers: Vec::new(),
                next_watch: 1,
                push_seq: 0,
                available: true,
            })),
        }
    }

    /// Simulates an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Synchronous read, bypassing availability.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segs = split_path(path);
        get_at(&self.lock().root, &segs).cloned()
    }

    /// Re-sends the current value to every subscription overlapping `path`, the way an
    /// at-least-once transport may repeat a notification.
    pub fn redeliver(&self, path: &str) {
        let segs = split_path(path);
        self.lock().notify(&segs);
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a poisoned tree is still structurally valid JSON
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.available {
            Ok(inner)
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }
}

impl Inner {
    fn current(&self, watcher: &Watcher) -> Option<Value> {
        let value = get_at(&self.root, &watcher.path)?;
        match &watcher.query {
            None => Some(value.clone()),
            Some((field, equals)) => {
                let filtered: Map<String, Value> = value
                    .as_object()?
                    .iter()
                    .filter(|(_, child)| child.get(field) == Some(equals))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if filtered.is_empty() {
                    None
                } else {
                    Some(Value::Object(filtered))
                }
            }
        }
    }

    fn notify(&mut self, changed: &[String]) {
        let mut dead = Vec::new();
        for watcher in &self.watchers {
            if !overlaps(&watcher.path, changed) {
                continue;
            }
            if watcher.tx.send(self.current(watcher)).is_err() {
                dead.push(watcher.id);
            }
        }
        if !dead.is_empty() {
            self.watchers.retain(|w| !dead.contains(&w.id));
        }
    }

    fn subscribe(&mut self, path: &str, query: Option<(String, Value)>) -> Watch {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_watch);
        self.next_watch += 1;
        let watcher = Watcher {
            id,
            path: split_path(path),
            query,
            tx,
        };
        if let Some(value) = self.current(&watcher) {
            let _ = watcher.tx.send(Some(value));
        }
        self.watchers.push(watcher);
        debug!("store: watch #{} on {}", id.0, path);
        Watch { id, updates: rx }
    }
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn get_at<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter().try_fold(root, |node, seg| node.get(seg.as_str()))
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

fn set_at(root: &mut Value, segs: &[String], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Removes the leaf and prunes parents left empty.
fn remove_at(node: &mut Value, segs: &[String]) {
    let Some((head, rest)) = segs.split_first() else {
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove_at(child, rest);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(head);
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = split_path(path);
        let mut inner = self.guard()?;
        if value.is_null() {
            remove_at(&mut inner.root, &segs);
        } else {
            set_at(&mut inner.root, &segs, value);
        }
        inner.notify(&segs);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = split_path(path);
        let inner = self.guard()?;
        Ok(get_at(&inner.root, &segs).cloned())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let segs = split_path(path);
        let mut inner = self.guard()?;
        remove_at(&mut inner.root, &segs);
        inner.notify(&segs);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let mut inner = self.guard()?;
        inner.push_seq += 1;
        let key = format!("{:012x}{:08x}", now_millis(), inner.push_seq);
        let mut segs = split_path(path);
        segs.push(key.clone());
        set_at(&mut inner.root, &segs, value);
        inner.notify(&segs);
        Ok(key)
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        Ok(self.guard()?.subscribe(path, None))
    }

    async fn watch_query(
        &self,
        path: &str,
        field: &str,
        equals: Value,
    ) -> Result<Watch, StoreError> {
        Ok(self
            .guard()?
            .subscribe(path, Some((field.to_string(), equals))))
    }

    fn unwatch(&self, id: SubscriptionId) {
        let mut inner = self.lock();
        let before = inner.watchers.len();
        inner.watchers.retain(|w| w.id != id);
        if inner.watchers.len() != before {
            debug!("store: unwatch #{}", id.0);
        }
    }
}
