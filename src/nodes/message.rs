//! Frames pushed by a node over its control socket.
//!
//! Every text frame is decoded exactly once, at the socket boundary, into
//! [`IncomingMessage`]. Anything that doesn't fit is reported as a node error
//! and dropped.

use serde::Deserialize;
use serde_json::Value;

use super::stats::NodeStats;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready(Ready),
    Stats(NodeStats),
    PlayerUpdate(PlayerUpdate),
    Event(PlayerEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: String,
    pub state: PlayerState,
}

/// Estado del player según el nodo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Track position in milliseconds.
    #[serde(default)]
    pub position: u64,
    pub connected: bool,
    /// Voice gateway ping in milliseconds, -1 when not connected.
    #[serde(default = "default_ping")]
    pub ping: i64,
}

fn default_ping() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEvent {
    pub guild_id: String,
    #[serde(flatten)]
    pub kind: TrackEventKind,
}

/// Track lifecycle events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum TrackEventKind {
    TrackStartEvent {
        #[serde(default)]
        track: Value,
    },
    TrackEndEvent {
        #[serde(default)]
        track: Value,
        reason: TrackEndReason,
    },
    TrackExceptionEvent {
        #[serde(default)]
        track: Value,
        exception: TrackException,
    },
    #[serde(rename_all = "camelCase")]
    TrackStuckEvent {
        #[serde(default)]
        track: Value,
        threshold_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketClosedEvent {
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the queue should advance after this end.
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

impl IncomingMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Guild the frame belongs to, if it targets a single player.
    pub fn guild_id(&self) -> Option<&str> {
        match self {
            IncomingMessage::PlayerUpdate(update) => Some(&update.guild_id),
            IncomingMessage::Event(event) => Some(&event.guild_id),
            _ => None,
        }
    }
}
