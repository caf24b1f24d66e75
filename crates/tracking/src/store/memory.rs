use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::{Map, Value};
use tracing::trace;

use super::{ChangeCallback, LocationStore, StoreError, Subscription, segments};

type SharedCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// In-process [`LocationStore`] backed by a single JSON tree.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    root: Value,
    version: u64,
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

struct Subscriber {
    segments: Vec<String>,
    callback: SharedCallback,
    active: Arc<AtomicBool>,
    last_delivered: Arc<Mutex<Option<u64>>>,
}

/// A notification collected under the tree lock and delivered after it.
struct Delivery {
    callback: SharedCallback,
    active: Arc<AtomicBool>,
    last_delivered: Arc<Mutex<Option<u64>>>,
    version: u64,
    value: Option<Value>,
}

impl Delivery {
    fn new(subscriber: &Subscriber, version: u64, value: Option<Value>) -> Self {
        Self {
            callback: subscriber.callback.clone(),
            active: subscriber.active.clone(),
            last_delivered: subscriber.last_delivered.clone(),
            version,
            value,
        }
    }

    /// Deliver unless the subscriber is gone or already saw a newer version.
    fn deliver(self) {
        let Ok(mut last) = self.last_delivered.lock() else {
            return;
        };
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if last.is_some_and(|seen| self.version <= seen) {
            return;
        }
        *last = Some(self.version);
        (self.callback)(self.value);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tree(Value::Null)
    }

    /// Start from an existing tree, e.g. a seed file.
    pub fn with_tree(root: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root,
                version: 0,
                next_id: 0,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// Clone of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.lock()
            .map(|inner| inner.root.clone())
            .unwrap_or(Value::Null)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .map(|inner| inner.subscribers.len())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn mutate(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let target = segments(path)?;
        let deliveries = {
            let mut guard = self.lock()?;
            let Inner {
                root,
                version,
                subscribers,
                ..
            } = &mut *guard;

            let before: Vec<(u64, Option<Value>)> = subscribers
                .iter()
                .filter(|(_, sub)| related(&sub.segments, &target))
                .map(|(id, sub)| (*id, lookup(root, &sub.segments).cloned()))
                .collect();

            if value.is_null() {
                remove(root, &target);
            } else {
                set(root, &target, value);
            }
            *version += 1;

            before
                .into_iter()
                .filter_map(|(id, old)| {
                    let sub = subscribers.get(&id)?;
                    let new = lookup(root, &sub.segments).cloned();
                    (new != old).then(|| Delivery::new(sub, *version, new))
                })
                .collect::<Vec<_>>()
        };

        trace!(path, notified = deliveries.len(), "store mutation");
        for delivery in deliveries {
            delivery.deliver();
        }
        Ok(())
    }
}

impl LocationStore for MemoryStore {
    fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(path, value)
    }

    fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let target = segments(path)?;
        let inner = self.lock()?;
        Ok(lookup(&inner.root, &target).cloned())
    }

    fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Result<Subscription, StoreError> {
        let target = segments(path)?;
        let active = Arc::new(AtomicBool::new(true));
        let (id, initial) = {
            let mut inner = self.lock()?;
            let id = inner.next_id;
            inner.next_id += 1;
            let subscriber = Subscriber {
                callback: Arc::from(on_change),
                active: active.clone(),
                last_delivered: Arc::new(Mutex::new(None)),
                segments: target,
            };
            let initial = Delivery::new(
                &subscriber,
                inner.version,
                lookup(&inner.root, &subscriber.segments).cloned(),
            );
            inner.subscribers.insert(id, subscriber);
            (id, initial)
        };
        initial.deliver();

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(active, move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.subscribers.remove(&id);
                }
            }
        }))
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.mutate(path, Value::Null)
    }
}

/// A subscriber is affected when its path is an ancestor or descendant of the
/// written path (or the same path).
fn related(subscribed: &[String], written: &[String]) -> bool {
    let shared = subscribed.len().min(written.len());
    subscribed[..shared] == written[..shared]
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    (!node.is_null()).then_some(node)
}

fn set(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => *node = value,
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                set(map.entry(head.clone()).or_insert(Value::Null), rest, value);
            }
        }
    }
}

/// Remove the value at `segments`, pruning parents left empty.
fn remove(node: &mut Value, segments: &[String]) {
    match segments.split_first() {
        None => *node = Value::Null,
        Some((head, rest)) => {
            if let Value::Object(map) = node {
                if rest.is_empty() {
                    map.remove(head);
                } else if let Some(child) = map.get_mut(head) {
                    remove(child, rest);
                    if is_empty(child) {
                        map.remove(head);
                    }
                }
                if map.is_empty() {
                    *node = Value::Null;
                }
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<Option<Value>>>>, ChangeCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Box::new(move |value| sink.lock().unwrap().push(value));
        (seen, callback)
    }

    #[test]
    fn write_then_read_nested_path() {
        let store = MemoryStore::new();
        store.write("drivers/locations/D1", json!({"latitude": 1.0})).unwrap();
        assert_eq!(
            store.read("drivers/locations/D1").unwrap(),
            Some(json!({"latitude": 1.0}))
        );
        assert_eq!(
            store.read("drivers").unwrap(),
            Some(json!({"locations": {"D1": {"latitude": 1.0}}}))
        );
        assert_eq!(store.read("drivers/registered").unwrap(), None);
    }

    #[test]
    fn subscribe_fires_immediately_with_current_value() {
        let store = MemoryStore::with_tree(json!({"drivers": {"a": 1}}));
        let (seen, callback) = recorder();
        let _sub = store.subscribe("drivers", callback).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({"a": 1}))]);
    }

    #[test]
    fn descendant_and_ancestor_writes_notify_with_full_subtree() {
        let store = MemoryStore::new();
        let (seen, callback) = recorder();
        let _sub = store.subscribe("drivers", callback).unwrap();

        store.write("drivers/locations/D1", json!({"latitude": 1.0})).unwrap();
        store.write("", json!({"drivers": {"x": true}})).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1], Some(json!({"locations": {"D1": {"latitude": 1.0}}})));
        assert_eq!(seen[2], Some(json!({"x": true})));
    }

    #[test]
    fn unrelated_or_unchanged_writes_do_not_notify() {
        let store = MemoryStore::new();
        store.write("drivers/registered/D1", json!({"name": "A"})).unwrap();
        let (seen, callback) = recorder();
        let _sub = store.subscribe("drivers/registered/D1", callback).unwrap();

        store.write("buses/7/currentLocation", json!({"latitude": 1.0})).unwrap();
        store.write("drivers/registered/D2", json!({"name": "B"})).unwrap();
        store.write("drivers/registered/D1", json!({"name": "A"})).unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let store = MemoryStore::new();
        let (seen, callback) = recorder();
        let sub = store.subscribe("drivers", callback).unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);

        store.write("drivers/a", json!(1)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn delete_prunes_empty_parents() {
        let store = MemoryStore::new();
        store.write("drivers/usernames/alice", json!("D1")).unwrap();
        store.delete("drivers/usernames/alice").unwrap();
        assert_eq!(store.snapshot(), Value::Null);

        store.write("drivers/usernames/bob", json!("D2")).unwrap();
        store.write("drivers/usernames/bob", Value::Null).unwrap();
        assert_eq!(store.read("drivers").unwrap(), None);
    }

    #[test]
    fn child_write_replaces_scalar_parent() {
        let store = MemoryStore::with_tree(json!({"drivers": 5}));
        store.write("drivers/locations/D1/isOnline", json!(false)).unwrap();
        assert_eq!(
            store.read("drivers/locations/D1").unwrap(),
            Some(json!({"isOnline": false}))
        );
    }
}
