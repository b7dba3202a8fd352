//! Server-side session state owned by the routing core.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

/// One session as seen by one application context.
///
/// Attribute access is guarded by a per-session lock so that sessions never
/// contend with each other.
#[derive(Debug)]
pub struct SessionRecord {
    id: String,
    created_at: DateTime<Utc>,
    attributes: RwLock<HashMap<String, Value>>,
    invalidated: AtomicBool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            attributes: RwLock::new(HashMap::new()),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        if self.is_invalidated() {
            return None;
        }
        self.attributes.read().get(name).cloned()
    }

    /// Store an attribute. Writes to an invalidated session are dropped.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        if self.is_invalidated() {
            return;
        }
        self.attributes.write().insert(name.into(), value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.write().remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop all attributes and refuse further writes.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.attributes.write().clear();
    }
}

/// Session id → every holder (application context) that has seen the id.
///
/// Kept apart from the contexts themselves so that a context replaced by a
/// reload can still be reached when its sessions are invalidated.
pub struct SessionIndex<T> {
    holders: scc::HashMap<String, Vec<Arc<T>>>,
}

impl<T> SessionIndex<T> {
    pub fn new() -> Self {
        Self {
            holders: scc::HashMap::new(),
        }
    }

    /// Remember that `holder` has a record for `id`.
    pub async fn record(&self, id: &str, holder: &Arc<T>) {
        let mut entry = self
            .holders
            .entry_async(id.to_string())
            .await
            .or_insert_with(Vec::new);
        let list = entry.get_mut();
        if !list.iter().any(|known| Arc::ptr_eq(known, holder)) {
            list.push(holder.clone());
        }
    }

    pub async fn holders(&self, id: &str) -> Vec<Arc<T>> {
        self.holders
            .read_async(id, |_, list| list.clone())
            .await
            .unwrap_or_default()
    }

    pub async fn holds(&self, id: &str, holder: &Arc<T>) -> bool {
        self.holders
            .read_async(id, |_, list| list.iter().any(|known| Arc::ptr_eq(known, holder)))
            .await
            .unwrap_or(false)
    }

    /// Forget `id`, returning everything that held it.
    pub async fn take(&self, id: &str) -> Vec<Arc<T>> {
        self.holders
            .remove_async(id)
            .await
            .map(|(_, list)| list)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

impl<T> Default for SessionIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}
