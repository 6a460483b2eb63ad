//! Wire events. Every frame is a JSON object `{"event": ..., "data": ...}`.

use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};

use super::registry::DisplayName;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    TryName(String),
    /// Carries the client's own name, which the server already knows.
    RequestCurrentlyOnline(String),
    SendMessage(Draft),
}

impl ClientEvent {
    pub fn from_frame(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// An authored message as the client sends it. `user` is whatever the client
/// claims; the relay replaces it with the registered name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub user: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthoredMessage {
    pub user: DisplayName,
    pub message: Arc<str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Rejection {
    AlreadyNamed,
    NotInRoom,
    PayloadTooLarge,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NameValid,
    NameAgain(String),
    CurrentlyOnline(BTreeSet<DisplayName>),
    UserJoined(DisplayName),
    UserLeft(DisplayName),
    // sic, the deployed client listens for this spelling
    RecieveMessage(AuthoredMessage),
    RequestRejected(Rejection),
}

impl ServerEvent {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NameValid => "nameValid",
            Self::NameAgain(_) => "nameAgain",
            Self::CurrentlyOnline(_) => "currentlyOnline",
            Self::UserJoined(_) => "userJoined",
            Self::UserLeft(_) => "userLeft",
            Self::RecieveMessage(_) => "recieveMessage",
            Self::RequestRejected(_) => "requestRejected",
        }
    }
}
