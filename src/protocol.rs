//! Event-bus protocol shared by all runtime components.
//!
//! This module defines the message payloads exchanged between the sync
//! adapter and the embedding application (the console and log loops in
//! `main`).

use crate::backends::SongRecord;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Song(SongMessage),
    Session(SessionMessage),
    /// Human-readable failure text relayed to the application.
    Error(String),
}

/// Song-collection commands and notifications.
#[derive(Debug, Clone)]
pub enum SongMessage {
    CreateSong(SongRecord),
    UpdateSong(SongRecord),
    RemoveSong(String),
    /// Key assigned to a creation request, emitted before the write lands.
    IdAssigned(String),
    SongAdded(SongRecord),
    SongUpdated(SongRecord),
    SongRemoved(String),
    WriteRejected(String),
    RemoveRejected(String),
}

/// Session commands and notifications.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    CheckSession,
    SignIn(String),
    SignedIn(bool),
}
