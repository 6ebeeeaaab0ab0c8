//! Backend abstractions and concrete implementations.
//!
//! The sync adapter only sees the traits defined here; the Firebase backend
//! implements them against the hosted service, the in-memory backend against
//! process-local state for the test suite.

pub mod firebase;
#[cfg(test)]
pub mod memory;

use serde_json::{Map, Value};

/// Free-form song payload stored in the remote collection.
///
/// Serializes as a bare JSON object so the wire format matches whatever the
/// application put in. The `id` field mirrors the owning collection key and
/// is overwritten by the sync adapter on every outbound record.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct SongRecord {
    fields: Map<String, Value>,
}

impl SongRecord {
    /// The record field mirroring the collection key, when present.
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    /// Overwrites the record's id field with the owning collection key.
    pub fn set_id(&mut self, key: &str) {
        self.fields
            .insert("id".to_string(), Value::String(key.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }
}

impl From<Map<String, Value>> for SongRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Change notification delivered to store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added { key: String, record: SongRecord },
    Changed { key: String, record: SongRecord },
    Removed { key: String },
}

/// Callback receiving store change events.
pub type StoreEventSink = Box<dyn Fn(StoreEvent) + Send + Sync>;

/// Callback receiving authentication presence transitions.
pub type AuthStateSink = Box<dyn Fn(bool) + Send + Sync>;

/// Handle owning an active listener registration.
///
/// Cancelling detaches the listener; dropping the handle has the same effect.
pub struct Subscription {
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(canceller: impl FnOnce() + Send + 'static) -> Self {
        Self {
            canceller: Some(Box::new(canceller)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
        }
    }
}

/// Interface implemented by keyed song-collection backends.
pub trait SongStore: Send + Sync {
    /// Returns a fresh collection key without a network round-trip.
    fn generate_key(&self) -> String;
    fn put(&self, key: &str, record: &SongRecord) -> Result<(), String>;
    /// Removing an absent key succeeds without producing an event.
    fn remove(&self, key: &str) -> Result<(), String>;
    /// Registers a change listener. Existing records are replayed as added
    /// events before live changes arrive.
    fn subscribe(&self, sink: StoreEventSink) -> Result<Subscription, String>;
}

/// Interface implemented by authentication backends.
pub trait AuthBackend: Send + Sync {
    fn signed_in(&self) -> bool;
    fn sign_in(&self, password: &str) -> Result<(), String>;
    /// Registers a listener for future presence transitions only.
    fn subscribe(&self, sink: AuthStateSink) -> Result<Subscription, String>;
}
