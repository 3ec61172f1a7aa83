//! Keyed store used as the signaling relay.
//!
//! The store is an opaque, eventually-consistent JSON tree with change notification.
//! Paths are `/`-separated. A watch delivers the full current value at its path (never a
//! diff), once immediately when a value exists and again after every change touching the
//! path; `None` means the path is absent. Nothing is ordered across distinct paths.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live subscription. Dropping the receiver or calling
/// [`SignalingStore::unwatch`] ends it.
#[derive(Debug)]
pub struct Watch {
    pub id: SubscriptionId,
    pub updates: mpsc::UnboundedReceiver<Option<Value>>,
}

#[async_trait]
pub trait SignalingStore: Send + Sync + 'static {
    /// Last write wins. Writing `null` removes the path.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Appends under a generated key that sorts after every earlier key at `path`.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    async fn watch(&self, path: &str) -> Result<Watch, StoreError>;

    /// Watches the children of `path` whose `field` equals `equals`. The delivered value
    /// is an object holding only the matching children, or `None` when nothing matches.
    async fn watch_query(&self, path: &str, field: &str, equals: Value)
        -> Result<Watch, StoreError>;

    /// Idempotent.
    fn unwatch(&self, id: SubscriptionId);
}

pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
