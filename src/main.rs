mod backends;
mod config;
mod protocol;
mod sync_adapter;

use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use backends::firebase::{FirebaseAuth, FirebaseSession, FirebaseStore};
use backends::{AuthBackend, SongRecord, SongStore};
use config::{Config, FirebaseConfig};
use log::{info, warn};
use protocol::{Message, SessionMessage, SongMessage};
use sync_adapter::SyncAdapter;
use tokio::sync::broadcast;

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn sanitize_config(config: Config) -> Config {
    let firebase = config.firebase;
    let collection = if firebase.collection.trim().is_empty() {
        FirebaseConfig::default().collection
    } else {
        firebase.collection.trim().to_string()
    };
    Config {
        firebase: FirebaseConfig {
            database_url: firebase.database_url.trim().to_string(),
            api_key: firebase.api_key.trim().to_string(),
            account_email: firebase.account_email.trim().to_string(),
            collection,
        },
    }
}

fn render_record(record: &SongRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| "<unprintable record>".to_string())
}

/// Parses one line of console input into a bus request.
///
/// Commands: `session`, `signin <password>`, `create <json object>`,
/// `update <json object with id>`, `remove <key>`. Blank lines are ignored.
fn parse_command(line: &str) -> Result<Option<Message>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let (verb, argument) = match trimmed.split_once(char::is_whitespace) {
        Some((verb, argument)) => (verb, argument.trim()),
        None => (trimmed, ""),
    };
    match verb {
        "session" => Ok(Some(Message::Session(SessionMessage::CheckSession))),
        "signin" => {
            if argument.is_empty() {
                return Err("usage: signin <password>".to_string());
            }
            Ok(Some(Message::Session(SessionMessage::SignIn(
                argument.to_string(),
            ))))
        }
        "create" => {
            let record = serde_json::from_str::<SongRecord>(argument)
                .map_err(|error| format!("create expects a JSON object: {}", error))?;
            Ok(Some(Message::Song(SongMessage::CreateSong(record))))
        }
        "update" => {
            let record = serde_json::from_str::<SongRecord>(argument)
                .map_err(|error| format!("update expects a JSON object: {}", error))?;
            Ok(Some(Message::Song(SongMessage::UpdateSong(record))))
        }
        "remove" => {
            if argument.is_empty() {
                return Err("usage: remove <key>".to_string());
            }
            Ok(Some(Message::Song(SongMessage::RemoveSong(
                argument.to_string(),
            ))))
        }
        other => Err(format!(
            "unknown command '{}' (commands: session, signin, create, update, remove)",
            other
        )),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_dir = dirs::config_dir().ok_or("could not resolve a config directory")?;
    let config_file = config_dir.join("chordsync.toml");

    if !config_file.exists() {
        let default_config = Config::default();

        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        std::fs::write(config_file.clone(), toml::to_string(&default_config)?)?;
    }

    let config_content = std::fs::read_to_string(config_file.clone())?;
    let config = sanitize_config(toml::from_str::<Config>(&config_content).unwrap_or_default());

    if config.firebase.database_url.is_empty() {
        log::error!(
            "No database_url configured. Fill in the [firebase] section of {} and restart.",
            config_file.display()
        );
        return Ok(());
    }

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);

    // One session shared between the store and auth handles, mirroring the
    // hosted SDK's implicit session.
    let session = Arc::new(FirebaseSession::default());
    let store: Arc<dyn SongStore> = Arc::new(FirebaseStore::new(
        &config.firebase.database_url,
        &config.firebase.collection,
        Arc::clone(&session),
    ));
    let auth: Arc<dyn AuthBackend> = Arc::new(FirebaseAuth::new(
        &config.firebase.api_key,
        &config.firebase.account_email,
        session,
    ));

    // Stand-in for the embedding application: subscribed before the adapter
    // starts so the initial record replay is not missed.
    let mut app_receiver = bus_sender.subscribe();

    // Setup sync adapter
    let adapter_bus_receiver = bus_sender.subscribe();
    let adapter_bus_sender = bus_sender.clone();
    thread::spawn(move || {
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut sync_adapter =
                SyncAdapter::new(adapter_bus_receiver, adapter_bus_sender, store, auth);
            sync_adapter.run();
        }));
        if let Err(payload) = run_result {
            log::error!(
                "SyncAdapter thread terminated due to panic: {}",
                panic_payload_to_string(payload.as_ref())
            );
        }
    });

    // Setup console input
    let command_bus_sender = bus_sender.clone();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_command(&line) {
                Ok(Some(message)) => {
                    let _ = command_bus_sender.send(message);
                }
                Ok(None) => {}
                Err(usage) => warn!("{}", usage),
            }
        }
    });

    info!(
        "chordsync bridging {}/{}",
        config.firebase.database_url, config.firebase.collection
    );
    let _ = bus_sender.send(Message::Session(SessionMessage::CheckSession));

    loop {
        match app_receiver.blocking_recv() {
            Ok(Message::Song(SongMessage::IdAssigned(key))) => {
                info!("Assigned id {} to a new song", key);
            }
            Ok(Message::Song(SongMessage::SongAdded(record))) => {
                info!("Song added: {}", render_record(&record));
            }
            Ok(Message::Song(SongMessage::SongUpdated(record))) => {
                info!("Song updated: {}", render_record(&record));
            }
            Ok(Message::Song(SongMessage::SongRemoved(key))) => {
                info!("Song removed: {}", key);
            }
            Ok(Message::Song(SongMessage::WriteRejected(message))) => {
                warn!("Song creation rejected: {}", message);
            }
            Ok(Message::Song(SongMessage::RemoveRejected(message))) => {
                warn!("Song removal rejected: {}", message);
            }
            Ok(Message::Session(SessionMessage::SignedIn(signed_in))) => {
                info!("Signed in: {}", signed_in);
            }
            Ok(Message::Error(message)) => {
                warn!("Bridge error: {}", message);
            }
            Ok(Message::Song(SongMessage::CreateSong(_)))
            | Ok(Message::Song(SongMessage::UpdateSong(_)))
            | Ok(Message::Song(SongMessage::RemoveSong(_)))
            | Ok(Message::Session(SessionMessage::CheckSession))
            | Ok(Message::Session(SessionMessage::SignIn(_))) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Application loop lagged on bus, skipped {} message(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    info!("Application exiting");
    Ok(())
}
