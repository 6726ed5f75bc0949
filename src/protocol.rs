//! Push-channel messages exchanged with the browser extension.
//!
//! Server → client:
//! `{"type":"state","blocked":bool,"sessions":n,"working":n,"waitingForInput":n}`
//! or `{"type":"pong"}`.
//!
//! Client → server: `{"type":"ping"}` or `{"type":"subscribe"}`.

use serde::{Deserialize, Serialize};

use crate::registry::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    State(Snapshot),
    Pong,
}

impl From<Snapshot> for ServerMessage {
    fn from(snapshot: Snapshot) -> Self {
        ServerMessage::State(snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    /// Accepted for compatibility; every connection is subscribed already.
    Subscribe,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Infallible for these variants.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
