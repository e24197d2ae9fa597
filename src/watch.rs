//! Change notifications and the watch registry.
//!
//! Backends publish a [`ChangeEvent`] for every write on a broadcast channel
//! ([`ChangeSender`]). A [`ChangeStream`] narrows that feed to one key and
//! drops no-op changes, where the old and new values are deep-equal.
//! [`WatchRegistry`] turns streams into callback subscriptions and owns the
//! listener set of one area until it is torn down.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{Result, StateError};

/// Default capacity of a backend's change channel.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Type of change that occurred to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created (did not exist before).
    Created,
    /// Key was overwritten.
    Updated,
    /// Key was removed.
    Deleted,
}

/// A change to one backend key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The backend (local) key that changed.
    pub key: String,
    pub event_type: EventType,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl ChangeEvent {
    /// Build an event from the value before and after a write.
    ///
    /// Returns `None` when the key neither existed before nor exists after.
    pub fn between(key: impl Into<String>, old_value: Option<Value>, new_value: Option<Value>) -> Option<Self> {
        let event_type = match (&old_value, &new_value) {
            (None, None) => return None,
            (None, Some(_)) => EventType::Created,
            (Some(_), Some(_)) => EventType::Updated,
            (Some(_), None) => EventType::Deleted,
        };
        Some(Self {
            key: key.into(),
            event_type,
            old_value,
            new_value,
        })
    }

    /// True when the write left the value unchanged.
    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
    }
}

/// Handle for publishing change events to subscribers.
#[derive(Clone)]
pub struct ChangeSender {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeSender {
    /// Create a new sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeSender {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}

/// A stream of effective changes to a single key.
pub struct ChangeStream {
    inner: Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>,
    key: String,
}

impl ChangeStream {
    /// Narrow a raw backend feed to `key`, dropping no-op changes.
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>, key: impl Into<String>) -> Self {
        let key = key.into();
        let filter_key = key.clone();
        let inner = BroadcastStream::new(receiver).filter_map(move |received| match received {
            Ok(event) if event.key == filter_key && !event.is_noop() => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(key = %filter_key, skipped, "change stream lagged, events dropped");
                None
            }
        });

        Self {
            inner: Box::pin(inner),
            key,
        }
    }

    /// The key this stream is watching.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A boxed watch callback, receiving `(new_value, old_value)`.
pub type WatchCallback = Box<dyn Fn(Option<Value>, Option<Value>) + Send + Sync>;

type Listeners = Mutex<HashMap<u64, JoinHandle<()>>>;

/// Drop listeners whose task has ended: the feed closed or the callback panicked.
fn prune(listeners: &mut HashMap<u64, JoinHandle<()>>) {
    listeners.retain(|_, task| !task.is_finished());
}

/// The listener set of one area.
///
/// Each subscription runs as its own task that forwards matching events to
/// the callback as `(new_value, old_value)`.
pub struct WatchRegistry {
    listeners: Arc<Listeners>,
    next_id: AtomicU64,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe `callback` to `stream` on the ambient Tokio runtime.
    ///
    /// Fails with `RuntimeUnavailable` outside a runtime.
    pub fn register<F>(&self, mut stream: ChangeStream, callback: F) -> Result<WatchHandle>
    where
        F: Fn(Option<Value>, Option<Value>) + Send + Sync + 'static,
    {
        let runtime =
            Handle::try_current().map_err(|err| StateError::RuntimeUnavailable(err.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(key = stream.key(), id, "registering watcher");

        let task = runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                callback(event.new_value, event.old_value);
            }
        });
        let mut listeners = self.listeners.lock();
        prune(&mut listeners);
        listeners.insert(id, task);

        Ok(WatchHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        })
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        let mut listeners = self.listeners.lock();
        prune(&mut listeners);
        listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every subscription, returning how many live ones were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.listeners.lock().drain().collect();
        let mut live = 0;
        for (_, task) in drained {
            if !task.is_finished() {
                live += 1;
            }
            task.abort();
        }
        live
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Unregister handle for one subscription.
///
/// Dropping the handle leaves the subscription in place.
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl WatchHandle {
    /// Remove this subscription. A no-op after a global teardown.
    pub fn unwatch(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Some(task) = listeners.lock().remove(&self.id) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[test]
    fn test_event_type_serialize() {
        let json = serde_json::to_string(&EventType::Created).unwrap();
        assert_eq!(json, "\"Created\"");
    }

    #[test]
    fn test_event_between() {
        let event = ChangeEvent::between("k", None, Some(json!(1))).unwrap();
        assert_eq!(event.event_type, EventType::Created);

        let event = ChangeEvent::between("k", Some(json!(1)), Some(json!(2))).unwrap();
        assert_eq!(event.event_type, EventType::Updated);

        let event = ChangeEvent::between("k", Some(json!(1)), None).unwrap();
        assert_eq!(event.event_type, EventType::Deleted);

        assert!(ChangeEvent::between("k", None, None).is_none());
    }

    #[test]
    fn test_noop_is_deep_equal() {
        let event = ChangeEvent::between("k", Some(json!({"a": [1, 2]})), Some(json!({"a": [1, 2]})))
            .unwrap();
        assert!(event.is_noop());

        let event = ChangeEvent::between("k", Some(json!({"a": [1, 2]})), Some(json!({"a": [2, 1]})))
            .unwrap();
        assert!(!event.is_noop());
    }

    #[tokio::test]
    async fn test_stream_filters_key_and_noops() {
        let sender = ChangeSender::new(16);
        let mut stream = ChangeStream::new(sender.subscribe(), "theme");

        sender.send(ChangeEvent::between("other", None, Some(json!(1))).unwrap());
        sender.send(ChangeEvent::between("theme", Some(json!("dark")), Some(json!("dark"))).unwrap());
        sender.send(ChangeEvent::between("theme", Some(json!("dark")), Some(json!("light"))).unwrap());

        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "theme");
        assert_eq!(event.new_value, Some(json!("light")));
    }

    #[tokio::test]
    async fn test_registry_register_and_unwatch() {
        let sender = ChangeSender::new(16);
        let registry = WatchRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = registry
            .register(ChangeStream::new(sender.subscribe(), "k"), move |new, old| {
                let _ = tx.send((new, old));
            })
            .unwrap();
        assert_eq!(registry.len(), 1);

        sender.send(ChangeEvent::between("k", None, Some(json!(1))).unwrap());
        let (new, old) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(new, Some(json!(1)));
        assert_eq!(old, None);

        handle.unwatch();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_clear() {
        let sender = ChangeSender::new(16);
        let registry = WatchRegistry::new();

        let first = registry
            .register(ChangeStream::new(sender.subscribe(), "a"), |_, _| {})
            .unwrap();
        registry
            .register(ChangeStream::new(sender.subscribe(), "b"), |_, _| {})
            .unwrap();

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        // Unwatching after teardown is harmless.
        first.unwatch();
    }

    #[test]
    fn test_register_outside_runtime_fails() {
        let sender = ChangeSender::new(16);
        let registry = WatchRegistry::new();

        let result = registry.register(ChangeStream::new(sender.subscribe(), "k"), |_, _| {});
        assert!(matches!(result, Err(StateError::RuntimeUnavailable(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_finished_listeners_are_pruned() {
        let sender = ChangeSender::new(16);
        let registry = WatchRegistry::new();

        registry
            .register(ChangeStream::new(sender.subscribe(), "closed"), |_, _| {})
            .unwrap();
        registry
            .register(ChangeStream::new(sender.subscribe(), "k"), |_, _| panic!("callback failed"))
            .unwrap();
        assert_eq!(registry.len(), 2);

        // Panics the second listener's task.
        sender.send(ChangeEvent::between("k", None, Some(json!(1))).unwrap());
        // Closes the feed, ending the first listener's task.
        drop(sender);

        timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.clear(), 0);
    }
}
