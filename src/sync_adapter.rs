//! Bridge between the hosted song store and the application-facing bus.
//!
//! Remote change events are relayed outbound with the collection key attached
//! as the record's `id`; application requests are relayed inbound to the
//! store/auth backends, with failures converted to bus messages.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::backends::{AuthBackend, SongRecord, SongStore, StoreEvent, Subscription};
use crate::protocol::{Message, SessionMessage, SongMessage};

/// User-facing text emitted when a sign-in attempt is rejected.
const SIGN_IN_FAILED_TEXT: &str = "Ogiltigt lösenord";

/// Relays song-collection changes and session state over the event bus.
pub struct SyncAdapter {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    store: Arc<dyn SongStore>,
    auth: Arc<dyn AuthBackend>,
    /// Listener handles cancelled when the adapter shuts down or is dropped.
    subscriptions: Vec<Subscription>,
}

impl SyncAdapter {
    /// Creates an adapter bound to bus channels and injected backends.
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        store: Arc<dyn SongStore>,
        auth: Arc<dyn AuthBackend>,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            store,
            auth,
            subscriptions: Vec::new(),
        }
    }

    /// Registers the store listener that relays change events outbound.
    /// Existing records are replayed as added events, which populates the
    /// application's initial collection view.
    fn attach_store_listener(&mut self) {
        let bus_producer = self.bus_producer.clone();
        let registration = self.store.subscribe(Box::new(move |event| {
            let message = match event {
                StoreEvent::Added { key, mut record } => {
                    debug!("SyncAdapter: relaying added song {}", key);
                    record.set_id(&key);
                    Message::Song(SongMessage::SongAdded(record))
                }
                StoreEvent::Changed { key, mut record } => {
                    debug!("SyncAdapter: relaying changed song {}", key);
                    record.set_id(&key);
                    Message::Song(SongMessage::SongUpdated(record))
                }
                StoreEvent::Removed { key } => {
                    debug!("SyncAdapter: relaying removed song {}", key);
                    Message::Song(SongMessage::SongRemoved(key))
                }
            };
            let _ = bus_producer.send(message);
        }));
        match registration {
            Ok(subscription) => self.subscriptions.push(subscription),
            Err(error) => {
                warn!("SyncAdapter: song stream registration failed: {}", error);
                let _ = self.bus_producer.send(Message::Error(error));
            }
        }
    }

    fn check_session(&self) {
        let signed_in = self.auth.signed_in();
        debug!("SyncAdapter: session check, signed_in={}", signed_in);
        let _ = self
            .bus_producer
            .send(Message::Session(SessionMessage::SignedIn(signed_in)));
    }

    fn create_song(&self, mut record: SongRecord) {
        // Keys are generated client-side, so the id reaches the application
        // before the write lands.
        let key = self.store.generate_key();
        record.set_id(&key);
        let _ = self
            .bus_producer
            .send(Message::Song(SongMessage::IdAssigned(key.clone())));
        if let Err(error) = self.store.put(&key, &record) {
            warn!("SyncAdapter: song creation rejected: {}", error);
            let _ = self
                .bus_producer
                .send(Message::Song(SongMessage::WriteRejected(error)));
        }
    }

    fn update_song(&self, record: SongRecord) {
        let Some(key) = record.id().map(ToOwned::to_owned) else {
            let _ = self
                .bus_producer
                .send(Message::Error("song update is missing an id".to_string()));
            return;
        };
        if let Err(error) = self.store.put(&key, &record) {
            warn!("SyncAdapter: song update rejected: {}", error);
            let _ = self.bus_producer.send(Message::Error(error));
        }
    }

    fn remove_song(&self, key: &str) {
        if let Err(error) = self.store.remove(key) {
            warn!("SyncAdapter: song removal rejected: {}", error);
            let _ = self
                .bus_producer
                .send(Message::Song(SongMessage::RemoveRejected(error)));
        }
    }

    fn sign_in(&mut self, password: &str) {
        // Every sign-in request registers one more auth listener; none are
        // removed until the adapter shuts down, so after N requests each
        // presence transition emits N `SignedIn` messages.
        let bus_producer = self.bus_producer.clone();
        let registration = self.auth.subscribe(Box::new(move |signed_in| {
            let _ = bus_producer.send(Message::Session(SessionMessage::SignedIn(signed_in)));
        }));
        match registration {
            Ok(subscription) => self.subscriptions.push(subscription),
            Err(error) => warn!("SyncAdapter: auth listener registration failed: {}", error),
        }

        // Success is reported by the listener(s) observing the presence
        // transition, not by an explicit send here.
        if let Err(error) = self.auth.sign_in(password) {
            debug!("SyncAdapter: sign-in rejected: {}", error);
            let _ = self
                .bus_producer
                .send(Message::Session(SessionMessage::SignedIn(false)));
            let _ = self
                .bus_producer
                .send(Message::Error(SIGN_IN_FAILED_TEXT.to_string()));
        }
    }

    /// Starts the blocking event loop.
    pub fn run(&mut self) {
        self.attach_store_listener();
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Song(SongMessage::CreateSong(record))) => self.create_song(record),
                Ok(Message::Song(SongMessage::UpdateSong(record))) => self.update_song(record),
                Ok(Message::Song(SongMessage::RemoveSong(key))) => self.remove_song(&key),
                Ok(Message::Session(SessionMessage::CheckSession)) => self.check_session(),
                Ok(Message::Session(SessionMessage::SignIn(password))) => self.sign_in(&password),
                Ok(Message::Song(SongMessage::IdAssigned(_)))
                | Ok(Message::Song(SongMessage::SongAdded(_)))
                | Ok(Message::Song(SongMessage::SongUpdated(_)))
                | Ok(Message::Song(SongMessage::SongRemoved(_)))
                | Ok(Message::Song(SongMessage::WriteRejected(_)))
                | Ok(Message::Song(SongMessage::RemoveRejected(_)))
                | Ok(Message::Session(SessionMessage::SignedIn(_)))
                | Ok(Message::Error(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "SyncAdapter lagged on control bus, skipped {} message(s)",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        // Detach remote listeners before the thread exits.
        for subscription in self.subscriptions.drain(..) {
            subscription.cancel();
        }
    }
}
