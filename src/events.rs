//! Notifications published by the [`Manager`](crate::Manager).
//!
//! Node faults and track faults never surface as errors to whoever happened
//! to trigger them; they are published here instead. Subscribe with
//! [`Manager::subscribe`](crate::Manager::subscribe). Slow subscribers lag
//! and lose the oldest notifications, they never block a node.

use crate::nodes::message::{TrackEndReason, TrackException};
use crate::sources::Track;

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Socket handshake completed.
    NodeConnect { node: String },
    /// A retry is scheduled after an unexpected close.
    NodeReconnect { node: String, attempt: u32 },
    /// The socket closed, deliberately or not.
    NodeDisconnect { node: String, code: Option<u16> },
    /// Something went wrong with a node. `fatal` is set once retries are
    /// exhausted and the node stops reconnecting on its own.
    NodeError {
        node: String,
        error: String,
        fatal: bool,
    },

    PlayerCreate { guild_id: String, node: String },
    PlayerDestroy { guild_id: String },
    PlayerMove {
        guild_id: String,
        from: String,
        to: String,
    },
    /// No node serves the requested region, the global best was used.
    RegionFallback {
        guild_id: String,
        region: String,
        node: String,
    },

    TrackStart {
        guild_id: String,
        track: Option<Track>,
    },
    TrackEnd {
        guild_id: String,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    QueueEnd { guild_id: String },
    TrackStuck {
        guild_id: String,
        track: Option<Track>,
        threshold_ms: u64,
    },
    TrackException {
        guild_id: String,
        track: Option<Track>,
        exception: TrackException,
    },
    /// The node lost its voice connection for this guild.
    SocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

impl ManagerEvent {
    pub fn guild_id(&self) -> Option<&str> {
        match self {
            ManagerEvent::PlayerCreate { guild_id, .. }
            | ManagerEvent::PlayerDestroy { guild_id }
            | ManagerEvent::PlayerMove { guild_id, .. }
            | ManagerEvent::RegionFallback { guild_id, .. }
            | ManagerEvent::TrackStart { guild_id, .. }
            | ManagerEvent::TrackEnd { guild_id, .. }
            | ManagerEvent::QueueEnd { guild_id }
            | ManagerEvent::TrackStuck { guild_id, .. }
            | ManagerEvent::TrackException { guild_id, .. }
            | ManagerEvent::SocketClosed { guild_id, .. } => Some(guild_id),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            ManagerEvent::NodeConnect { node }
            | ManagerEvent::NodeReconnect { node, .. }
            | ManagerEvent::NodeDisconnect { node, .. }
            | ManagerEvent::NodeError { node, .. }
            | ManagerEvent::PlayerCreate { node, .. }
            | ManagerEvent::RegionFallback { node, .. } => Some(node),
            ManagerEvent::PlayerMove { to, .. } => Some(to),
            _ => None,
        }
    }
}
