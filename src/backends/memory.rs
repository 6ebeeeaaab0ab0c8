//! In-process backend used by the test suite.
//!
//! Implements the same contracts as the Firebase backend against a mutexed
//! map, with injectable failures for driving the rejection paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::backends::{
    AuthBackend, AuthStateSink, SongRecord, SongStore, StoreEvent, StoreEventSink, Subscription,
};

#[derive(Default)]
struct MemoryStoreState {
    records: BTreeMap<String, SongRecord>,
    sinks: Vec<(u64, StoreEventSink)>,
    next_sink_id: u64,
    write_failure: Option<String>,
    remove_failure: Option<String>,
}

impl MemoryStoreState {
    // Sinks run under the state lock and must not call back into the store.
    fn emit(&self, event: StoreEvent) {
        for (_, sink) in &self.sinks {
            sink(event.clone());
        }
    }
}

/// Keyed song store backed by process memory.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryStoreState::default())),
        }
    }

    /// Makes every subsequent put fail with the given message.
    pub fn set_write_failure(&self, message: Option<&str>) {
        let mut state = self.state.lock().expect("store state lock poisoned");
        state.write_failure = message.map(ToOwned::to_owned);
    }

    /// Makes every subsequent remove fail with the given message.
    pub fn set_remove_failure(&self, message: Option<&str>) {
        let mut state = self.state.lock().expect("store state lock poisoned");
        state.remove_failure = message.map(ToOwned::to_owned);
    }

    pub fn record(&self, key: &str) -> Option<SongRecord> {
        let state = self.state.lock().expect("store state lock poisoned");
        state.records.get(key).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SongStore for MemoryStore {
    fn generate_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn put(&self, key: &str, record: &SongRecord) -> Result<(), String> {
        let mut state = self.state.lock().expect("store state lock poisoned");
        if let Some(message) = state.write_failure.clone() {
            return Err(message);
        }
        let replaced = state.records.insert(key.to_string(), record.clone());
        let event = match replaced {
            Some(_) => StoreEvent::Changed {
                key: key.to_string(),
                record: record.clone(),
            },
            None => StoreEvent::Added {
                key: key.to_string(),
                record: record.clone(),
            },
        };
        state.emit(event);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        let mut state = self.state.lock().expect("store state lock poisoned");
        if let Some(message) = state.remove_failure.clone() {
            return Err(message);
        }
        if state.records.remove(key).is_some() {
            state.emit(StoreEvent::Removed {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, sink: StoreEventSink) -> Result<Subscription, String> {
        let mut state = self.state.lock().expect("store state lock poisoned");
        for (key, record) in &state.records {
            sink(StoreEvent::Added {
                key: key.clone(),
                record: record.clone(),
            });
        }
        let sink_id = state.next_sink_id;
        state.next_sink_id += 1;
        state.sinks.push((sink_id, sink));

        let state_handle = Arc::clone(&self.state);
        Ok(Subscription::new(move || {
            let mut state = state_handle.lock().expect("store state lock poisoned");
            state.sinks.retain(|(id, _)| *id != sink_id);
        }))
    }
}

#[derive(Default)]
struct MemoryAuthState {
    signed_in: bool,
    password: String,
    sinks: Vec<(u64, AuthStateSink)>,
    next_sink_id: u64,
}

/// Single-account auth backend backed by process memory.
pub struct MemoryAuth {
    state: Arc<Mutex<MemoryAuthState>>,
}

impl MemoryAuth {
    pub fn new(password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryAuthState {
                password: password.to_string(),
                ..MemoryAuthState::default()
            })),
        }
    }
}

impl AuthBackend for MemoryAuth {
    fn signed_in(&self) -> bool {
        let state = self.state.lock().expect("auth state lock poisoned");
        state.signed_in
    }

    fn sign_in(&self, password: &str) -> Result<(), String> {
        let mut state = self.state.lock().expect("auth state lock poisoned");
        if password != state.password {
            return Err("INVALID_PASSWORD".to_string());
        }
        // Listeners fire on presence transitions only.
        if !state.signed_in {
            state.signed_in = true;
            for (_, sink) in &state.sinks {
                sink(true);
            }
        }
        Ok(())
    }

    fn subscribe(&self, sink: AuthStateSink) -> Result<Subscription, String> {
        let mut state = self.state.lock().expect("auth state lock poisoned");
        let sink_id = state.next_sink_id;
        state.next_sink_id += 1;
        state.sinks.push((sink_id, sink));

        let state_handle = Arc::clone(&self.state);
        Ok(Subscription::new(move || {
            let mut state = state_handle.lock().expect("auth state lock poisoned");
            state.sinks.retain(|(id, _)| *id != sink_id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{MemoryAuth, MemoryStore};
    use crate::backends::{AuthBackend, SongRecord, SongStore, StoreEvent, StoreEventSink};

    fn song(title: &str) -> SongRecord {
        let serde_json::Value::Object(fields) = serde_json::json!({ "title": title }) else {
            panic!("song payload should be an object");
        };
        SongRecord::from(fields)
    }

    fn collecting_sink() -> (StoreEventSink, Arc<Mutex<Vec<StoreEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sink: StoreEventSink = Box::new(move |event| {
            events_clone.lock().expect("event lock poisoned").push(event);
        });
        (sink, events)
    }

    #[test]
    fn test_subscribe_replays_existing_records_in_key_order() {
        let store = MemoryStore::new();
        store
            .put("key-b", &song("Second"))
            .expect("seed write should succeed");
        store
            .put("key-a", &song("First"))
            .expect("seed write should succeed");

        let (sink, events) = collecting_sink();
        let _subscription = store.subscribe(sink).expect("subscribe should succeed");

        let events = events.lock().expect("event lock poisoned");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StoreEvent::Added {
                key: "key-a".to_string(),
                record: song("First"),
            }
        );
        assert_eq!(
            events[1],
            StoreEvent::Added {
                key: "key-b".to_string(),
                record: song("Second"),
            }
        );
    }

    #[test]
    fn test_put_emits_added_then_changed() {
        let store = MemoryStore::new();
        let (sink, events) = collecting_sink();
        let _subscription = store.subscribe(sink).expect("subscribe should succeed");

        store
            .put("key-a", &song("First"))
            .expect("write should succeed");
        store
            .put("key-a", &song("First, revised"))
            .expect("overwrite should succeed");

        let events = events.lock().expect("event lock poisoned");
        assert!(matches!(events[0], StoreEvent::Added { .. }));
        assert_eq!(
            events[1],
            StoreEvent::Changed {
                key: "key-a".to_string(),
                record: song("First, revised"),
            }
        );
        assert_eq!(store.record("key-a"), Some(song("First, revised")));
    }

    #[test]
    fn test_remove_missing_key_succeeds_without_event() {
        let store = MemoryStore::new();
        let (sink, events) = collecting_sink();
        let _subscription = store.subscribe(sink).expect("subscribe should succeed");

        store
            .remove("never-existed")
            .expect("removing an absent key should succeed");

        assert!(events.lock().expect("event lock poisoned").is_empty());
    }

    #[test]
    fn test_fresh_subscription_after_removal_replays_nothing() {
        let store = MemoryStore::new();
        store
            .put("key-a", &song("First"))
            .expect("write should succeed");
        store.remove("key-a").expect("removal should succeed");

        let (sink, events) = collecting_sink();
        let _subscription = store.subscribe(sink).expect("subscribe should succeed");

        assert!(events.lock().expect("event lock poisoned").is_empty());
    }

    #[test]
    fn test_injected_write_failure_leaves_records_untouched() {
        let store = MemoryStore::new();
        let (sink, events) = collecting_sink();
        let _subscription = store.subscribe(sink).expect("subscribe should succeed");

        store.set_write_failure(Some("Permission denied"));
        let result = store.put("key-a", &song("First"));

        assert_eq!(result, Err("Permission denied".to_string()));
        assert!(store.record("key-a").is_none());
        assert!(events.lock().expect("event lock poisoned").is_empty());
    }

    #[test]
    fn test_cancelled_subscription_stops_delivery() {
        let store = MemoryStore::new();
        let (sink, events) = collecting_sink();
        let subscription = store.subscribe(sink).expect("subscribe should succeed");

        subscription.cancel();
        store
            .put("key-a", &song("First"))
            .expect("write should succeed");

        assert!(events.lock().expect("event lock poisoned").is_empty());
    }

    #[test]
    fn test_sign_in_notifies_on_transition_only() {
        let auth = MemoryAuth::new("hunter2");
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let notifications_clone = Arc::clone(&notifications);
        let _subscription = auth
            .subscribe(Box::new(move |signed_in| {
                notifications_clone
                    .lock()
                    .expect("notification lock poisoned")
                    .push(signed_in);
            }))
            .expect("subscribe should succeed");

        assert!(!auth.signed_in());
        auth.sign_in("hunter2").expect("sign-in should succeed");
        auth.sign_in("hunter2")
            .expect("repeat sign-in should succeed");

        assert!(auth.signed_in());
        assert_eq!(
            *notifications.lock().expect("notification lock poisoned"),
            vec![true]
        );
    }

    #[test]
    fn test_wrong_password_fails_without_transition() {
        let auth = MemoryAuth::new("hunter2");
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let notifications_clone = Arc::clone(&notifications);
        let _subscription = auth
            .subscribe(Box::new(move |signed_in| {
                notifications_clone
                    .lock()
                    .expect("notification lock poisoned")
                    .push(signed_in);
            }))
            .expect("subscribe should succeed");

        let result = auth.sign_in("letmein");

        assert_eq!(result, Err("INVALID_PASSWORD".to_string()));
        assert!(!auth.signed_in());
        assert!(notifications
            .lock()
            .expect("notification lock poisoned")
            .is_empty());
    }
}
