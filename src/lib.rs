//! # Open Music Nodes
//!
//! Client side of a pool of Lavalink v4 audio nodes.
//!
//! - [`Manager`] keeps one control socket per node, ranks the nodes by load
//!   and creates one [`Player`] per guild on the least loaded one.
//! - Voice gateway packets go in through [`Manager::route_voice_packet`];
//!   join/leave frames come out through the [`VoiceGateway`] you provide.
//! - Everything that happens asynchronously (node reconnects, track
//!   starts and ends, failover) is published as a [`ManagerEvent`].
//!
//! ```rust,no_run
//! use open_music_nodes::{Config, Manager, PlayerOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> open_music_nodes::Result<()> {
//! let gateway = Arc::new(|guild_id: &str, payload: serde_json::Value| {
//!     println!("send to shard of {}: {}", guild_id, payload);
//! });
//! let manager = Manager::new(Config::load()?, "123456789", gateway);
//! manager.init()?;
//!
//! let player = manager.create(PlayerOptions::new("42", "1001")).await?;
//! let found = manager.resolve("never gonna give you up", None, None, None).await?;
//! if let Some(track) = found.tracks.into_iter().next() {
//!     player.queue().await.add(track);
//!     player.play().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod nodes;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::effects::Filters;
pub use audio::queue::{LoopMode, Queue};
pub use audio::voice::{VoiceGateway, VoicePacket};
pub use audio::{PlaybackState, Player, PlayerOptions};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use events::ManagerEvent;
pub use manager::{Manager, NodeLookup};
pub use nodes::{Node, NodeDescriptor, NodeState};
pub use sources::{SearchSource, Track, TrackInfo};
