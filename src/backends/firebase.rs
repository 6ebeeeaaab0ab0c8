//! Firebase Realtime Database and Identity Toolkit backend.
//!
//! Record writes go over the database's REST surface. Change subscriptions
//! open a streaming request (`text/event-stream`) on a worker thread that
//! mirrors the remote collection and translates `put`/`patch` frames into
//! added/changed/removed events with full-record snapshots.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::backends::{
    AuthBackend, AuthStateSink, SongRecord, SongStore, StoreEvent, StoreEventSink, Subscription,
};

const SIGN_IN_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";

/// Key alphabet used by the database's own client libraries, in ascending
/// ASCII order so generated keys sort chronologically.
const PUSH_ALPHABET: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Session token shared between the database and auth handles.
///
/// The auth handle stores the id token after a successful sign-in; the
/// database handle appends it to every REST call.
#[derive(Default)]
pub struct FirebaseSession {
    id_token: Mutex<Option<String>>,
}

impl FirebaseSession {
    fn token(&self) -> Option<String> {
        self.id_token.lock().expect("session lock poisoned").clone()
    }

    fn set_token(&self, token: String) {
        let mut id_token = self.id_token.lock().expect("session lock poisoned");
        *id_token = Some(token);
    }
}

/// Song store backed by a Realtime Database collection, over `ureq`.
pub struct FirebaseStore {
    http_client: ureq::Agent,
    database_url: String,
    collection: String,
    session: Arc<FirebaseSession>,
}

impl FirebaseStore {
    pub fn new(database_url: &str, collection: &str, session: Arc<FirebaseSession>) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self {
            http_client,
            database_url: database_url.trim().trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            session,
        }
    }

    fn collection_url(
        database_url: &str,
        collection: &str,
        key: Option<&str>,
        token: Option<&str>,
    ) -> String {
        let mut url = match key {
            Some(key) => format!(
                "{database_url}/{collection}/{}.json",
                urlencoding::encode(key)
            ),
            None => format!("{database_url}/{collection}.json"),
        };
        if let Some(token) = token {
            url.push_str("?auth=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    fn record_url(&self, key: &str) -> String {
        Self::collection_url(
            &self.database_url,
            &self.collection,
            Some(key),
            self.session.token().as_deref(),
        )
    }

    /// Extracts the body's `error` field from a rejected database call.
    fn rejection_text(action: &str, err: ureq::Error) -> String {
        match err {
            ureq::Error::Status(status, response) => {
                let detail = response
                    .into_json::<Value>()
                    .ok()
                    .and_then(|body| {
                        body.get("error")
                            .and_then(Value::as_str)
                            .map(ToOwned::to_owned)
                    })
                    .unwrap_or_else(|| format!("HTTP {status}"));
                format!("{action} failed: {detail}")
            }
            other => format!("{action} failed: {other}"),
        }
    }
}

impl SongStore for FirebaseStore {
    fn generate_key(&self) -> String {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        push_key(timestamp_ms)
    }

    fn put(&self, key: &str, record: &SongRecord) -> Result<(), String> {
        let url = self.record_url(key);
        self.http_client
            .put(&url)
            .send_json(record)
            .map_err(|err| Self::rejection_text("song write", err))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        let url = self.record_url(key);
        self.http_client
            .delete(&url)
            .call()
            .map_err(|err| Self::rejection_text("song removal", err))?;
        Ok(())
    }

    fn subscribe(&self, sink: StoreEventSink) -> Result<Subscription, String> {
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);
        let database_url = self.database_url.clone();
        let collection = self.collection.clone();
        let session = Arc::clone(&self.session);
        thread::spawn(move || {
            stream_worker(database_url, collection, session, sink, worker_stopped);
        });
        Ok(Subscription::new(move || {
            stopped.store(true, Ordering::Relaxed);
        }))
    }
}

/// Builds a 20-character collection key: 8 timestamp characters followed by
/// 12 random ones, matching the format the database's clients generate. The
/// timestamp prefix is what lets the key be handed out before any network
/// round-trip.
fn push_key(timestamp_ms: u64) -> String {
    let mut prefix = [0u8; 8];
    let mut remaining = timestamp_ms;
    for slot in prefix.iter_mut().rev() {
        *slot = PUSH_ALPHABET[(remaining % 64) as usize];
        remaining /= 64;
    }
    let mut random = [0u8; 12];
    let _ = getrandom::fill(&mut random);

    let mut key = String::with_capacity(20);
    key.extend(prefix.iter().map(|byte| *byte as char));
    key.extend(
        random
            .iter()
            .map(|byte| PUSH_ALPHABET[(*byte % 64) as usize] as char),
    );
    key
}

/// One streamed change frame from the database.
#[derive(Debug, serde::Deserialize)]
struct StreamPayload {
    path: String,
    data: Value,
}

fn stream_worker(
    database_url: String,
    collection: String,
    session: Arc<FirebaseSession>,
    sink: StoreEventSink,
    stopped: Arc<AtomicBool>,
) {
    // Read timeout sized to outlast the service's 30-second keep-alives.
    let stream_client = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(90))
        .build();
    let mut mirror: BTreeMap<String, SongRecord> = BTreeMap::new();

    while !stopped.load(Ordering::Relaxed) {
        let url = FirebaseStore::collection_url(
            &database_url,
            &collection,
            None,
            session.token().as_deref(),
        );
        match open_stream(&stream_client, &url) {
            Ok(reader) => {
                debug!("Song stream connected: {collection}");
                if let Err(err) = pump_stream(reader, &mut mirror, &sink, &stopped) {
                    if stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("Song stream interrupted: {err}");
                }
            }
            Err(err) => {
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                warn!("Song stream connect failed: {err}");
            }
        }
        if stopped.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(STREAM_RETRY_DELAY);
    }
}

fn open_stream(client: &ureq::Agent, url: &str) -> Result<impl BufRead, String> {
    let response = client
        .get(url)
        .set("Accept", "text/event-stream")
        .call()
        .map_err(|err| err.to_string())?;
    Ok(BufReader::new(response.into_reader()))
}

/// Reads event-stream frames until the connection drops or the subscription
/// is cancelled. The next root frame after a reconnect re-synchronizes the
/// mirror, so returning on error is always safe.
fn pump_stream(
    reader: impl BufRead,
    mirror: &mut BTreeMap<String, SongRecord>,
    sink: &StoreEventSink,
    stopped: &Arc<AtomicBool>,
) -> Result<(), String> {
    let mut event_name = String::new();
    let mut data = String::new();
    for line in reader.lines() {
        if stopped.load(Ordering::Relaxed) {
            return Ok(());
        }
        let line = line.map_err(|err| format!("stream read failed: {err}"))?;
        if line.is_empty() {
            if !event_name.is_empty() {
                handle_stream_frame(&event_name, &data, mirror, sink)?;
            }
            event_name.clear();
            data.clear();
        } else if let Some(value) = line.strip_prefix("event:") {
            event_name = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }
    Err("stream ended".to_string())
}

fn handle_stream_frame(
    event_name: &str,
    data: &str,
    mirror: &mut BTreeMap<String, SongRecord>,
    sink: &StoreEventSink,
) -> Result<(), String> {
    match event_name {
        "put" | "patch" => {
            let payload: StreamPayload = serde_json::from_str(data)
                .map_err(|err| format!("malformed stream payload: {err}"))?;
            let events = if event_name == "put" {
                apply_put(mirror, &payload.path, payload.data)
            } else {
                apply_patch(mirror, &payload.path, payload.data)
            };
            for event in events {
                sink(event);
            }
            Ok(())
        }
        "keep-alive" => Ok(()),
        "cancel" => Err("stream cancelled by server".to_string()),
        "auth_revoked" => Err("stream credential no longer valid".to_string()),
        other => {
            debug!("Ignoring unknown stream event '{other}'");
            Ok(())
        }
    }
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn apply_put(
    mirror: &mut BTreeMap<String, SongRecord>,
    path: &str,
    data: Value,
) -> Vec<StoreEvent> {
    let segments = path_segments(path);
    if segments.is_empty() {
        reconcile_root(mirror, data)
    } else {
        apply_record_change(mirror, &segments, data)
    }
}

/// A patch carries child updates relative to its path; each entry behaves
/// like a put at `path + child`.
fn apply_patch(
    mirror: &mut BTreeMap<String, SongRecord>,
    path: &str,
    data: Value,
) -> Vec<StoreEvent> {
    let segments = path_segments(path);
    let Value::Object(entries) = data else {
        return Vec::new();
    };
    let mut events = Vec::new();
    for (child, value) in entries {
        let mut target = segments.clone();
        target.extend(path_segments(&child));
        if target.is_empty() {
            continue;
        }
        events.extend(apply_record_change(mirror, &target, value));
    }
    events
}

/// Replaces the mirror with a full snapshot and emits the difference. On the
/// first connect the mirror is empty, which makes this the existing-records
/// replay.
fn reconcile_root(mirror: &mut BTreeMap<String, SongRecord>, data: Value) -> Vec<StoreEvent> {
    let incoming: BTreeMap<String, SongRecord> = match data {
        Value::Object(entries) => entries
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Object(fields) => Some((key, SongRecord::from(fields))),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    let mut events = Vec::new();
    for key in mirror.keys() {
        if !incoming.contains_key(key) {
            events.push(StoreEvent::Removed { key: key.clone() });
        }
    }
    for (key, record) in &incoming {
        match mirror.get(key) {
            None => events.push(StoreEvent::Added {
                key: key.clone(),
                record: record.clone(),
            }),
            Some(previous) if previous != record => events.push(StoreEvent::Changed {
                key: key.clone(),
                record: record.clone(),
            }),
            Some(_) => {}
        }
    }
    *mirror = incoming;
    events
}

/// Applies a keyed write. `segments[0]` is the record key; deeper segments
/// address fields inside the record. A record whose last field is deleted is
/// pruned, which is how the service reports it.
fn apply_record_change(
    mirror: &mut BTreeMap<String, SongRecord>,
    segments: &[String],
    data: Value,
) -> Vec<StoreEvent> {
    let key = segments[0].clone();
    if segments.len() == 1 {
        return match data {
            Value::Null => match mirror.remove(&key) {
                Some(_) => vec![StoreEvent::Removed { key }],
                None => Vec::new(),
            },
            Value::Object(fields) => {
                let record = SongRecord::from(fields);
                let replaced = mirror.insert(key.clone(), record.clone());
                match replaced {
                    Some(_) => vec![StoreEvent::Changed { key, record }],
                    None => vec![StoreEvent::Added { key, record }],
                }
            }
            _ => Vec::new(),
        };
    }

    let existed = mirror.contains_key(&key);
    let mut record = mirror.remove(&key).unwrap_or_default();
    set_field_path(record.fields_mut(), &segments[1..], data);
    if record.is_empty() {
        if existed {
            return vec![StoreEvent::Removed { key }];
        }
        return Vec::new();
    }
    mirror.insert(key.clone(), record.clone());
    if existed {
        vec![StoreEvent::Changed { key, record }]
    } else {
        vec![StoreEvent::Added { key, record }]
    }
}

fn set_field_path(fields: &mut Map<String, Value>, segments: &[String], data: Value) {
    let field = &segments[0];
    if segments.len() == 1 {
        if data.is_null() {
            fields.remove(field);
        } else {
            fields.insert(field.clone(), data);
        }
        return;
    }
    let child = fields
        .entry(field.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child_fields) = child {
        set_field_path(child_fields, &segments[1..], data);
        // Empty subtrees are pruned at every level, like the service does.
        if child_fields.is_empty() {
            fields.remove(field);
        }
    }
}

/// Successful password sign-in response from the Identity Toolkit.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
}

#[derive(Default)]
struct AuthListenerRegistry {
    next_listener_id: u64,
    sinks: Vec<(u64, AuthStateSink)>,
}

/// Password auth for the single configured account, over the Identity
/// Toolkit REST endpoint.
pub struct FirebaseAuth {
    http_client: ureq::Agent,
    api_key: String,
    account_email: String,
    session: Arc<FirebaseSession>,
    listeners: Arc<Mutex<AuthListenerRegistry>>,
}

impl FirebaseAuth {
    pub fn new(api_key: &str, account_email: &str, session: Arc<FirebaseSession>) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self {
            http_client,
            api_key: api_key.to_string(),
            account_email: account_email.to_string(),
            session,
            listeners: Arc::new(Mutex::new(AuthListenerRegistry::default())),
        }
    }

    /// Extracts `error.message` (e.g. `INVALID_PASSWORD`) from a rejected
    /// sign-in call.
    fn sign_in_error_text(err: ureq::Error) -> String {
        match err {
            ureq::Error::Status(status, response) => response
                .into_json::<Value>()
                .ok()
                .and_then(|body| {
                    body.get("error")
                        .and_then(|error| error.get("message"))
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned)
                })
                .unwrap_or_else(|| format!("sign-in failed: HTTP {status}")),
            other => format!("sign-in failed: {other}"),
        }
    }

    // Sinks run under the registry lock and must not call back into
    // subscribe.
    fn notify_listeners(&self, signed_in: bool) {
        let listeners = self.listeners.lock().expect("auth listener lock poisoned");
        for (_, sink) in &listeners.sinks {
            sink(signed_in);
        }
    }
}

impl AuthBackend for FirebaseAuth {
    fn signed_in(&self) -> bool {
        self.session.token().is_some()
    }

    fn sign_in(&self, password: &str) -> Result<(), String> {
        let url = format!(
            "{SIGN_IN_ENDPOINT}?key={}",
            urlencoding::encode(&self.api_key)
        );
        let response = self
            .http_client
            .post(&url)
            .send_json(serde_json::json!({
                "email": self.account_email,
                "password": password,
                "returnSecureToken": true,
            }))
            .map_err(Self::sign_in_error_text)?;
        let payload: SignInResponse = response
            .into_json()
            .map_err(|err| format!("sign-in response parse failed: {err}"))?;

        let was_signed_in = self.session.token().is_some();
        self.session.set_token(payload.id_token);
        if !was_signed_in {
            self.notify_listeners(true);
        }
        Ok(())
    }

    fn subscribe(&self, sink: AuthStateSink) -> Result<Subscription, String> {
        let mut listeners = self.listeners.lock().expect("auth listener lock poisoned");
        let listener_id = listeners.next_listener_id;
        listeners.next_listener_id += 1;
        listeners.sinks.push((listener_id, sink));

        let registry = Arc::clone(&self.listeners);
        Ok(Subscription::new(move || {
            let mut listeners = registry.lock().expect("auth listener lock poisoned");
            listeners.sinks.retain(|(id, _)| *id != listener_id);
        }))
    }
}
