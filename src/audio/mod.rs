//! # Audio Module
//!
//! Per-guild playback on top of the node pool.
//!
//! ### [`player`] - Player
//! - Playback state machine driven by the node's track events
//! - Voice channel membership and node failover
//!
//! ### [`queue`] - Queue Management
//! - FIFO of pending tracks with `current` / `previous` slots
//! - Shuffle and loop modes
//!
//! ### [`effects`] - Filters
//! - Filter payload understood by the nodes (equalizer, timescale, ...)
//!
//! ### [`voice`] - Voice Signaling
//! - Merges voice server and voice state updates into the descriptor the
//!   node needs to open its voice connection

pub mod effects;
pub mod player;
pub mod queue;
pub mod voice;

pub use player::{PlaybackState, Player, PlayerOptions};
