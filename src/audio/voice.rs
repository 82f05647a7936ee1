//! Voice signaling.
//!
//! The voice gateway tells us two things about a guild: which voice server
//! to talk to (`VOICE_SERVER_UPDATE`) and which voice session and channel
//! the bot is in (`VOICE_STATE_UPDATE`). Both halves are merged into a
//! [`VoiceState`]; once token, endpoint and session id are all known the
//! descriptor is forwarded to the node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::nodes::rest::VoiceUpdate;

/// Outbound side of the voice gateway.
///
/// Receives op 4 (voice state) frames, ready to be written to the gateway
/// shard that owns `guild_id`.
pub trait VoiceGateway: Send + Sync {
    fn send(&self, guild_id: &str, payload: Value);
}

impl<F> VoiceGateway for F
where
    F: Fn(&str, Value) + Send + Sync,
{
    fn send(&self, guild_id: &str, payload: Value) {
        self(guild_id, payload)
    }
}

/// Packets delivered by the voice gateway, in gateway dispatch shape.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "t", content = "d")]
pub enum VoicePacket {
    #[serde(rename = "VOICE_SERVER_UPDATE")]
    ServerUpdate(VoiceServerUpdate),
    #[serde(rename = "VOICE_STATE_UPDATE")]
    StateUpdate(VoiceStateUpdate),
}

impl VoicePacket {
    pub fn guild_id(&self) -> &str {
        match self {
            VoicePacket::ServerUpdate(update) => &update.guild_id,
            VoicePacket::StateUpdate(update) => &update.guild_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VoiceServerUpdate {
    pub guild_id: String,
    #[serde(default)]
    pub token: String,
    /// `None` while the voice server is being reallocated.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub user_id: String,
    /// `None` when the user left voice.
    #[serde(default)]
    pub channel_id: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
}

/// Estado de voz de un player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceState {
    pub session_id: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceState {
    /// Merged descriptor, once every part is known.
    pub fn descriptor(&self) -> Option<VoiceUpdate> {
        Some(VoiceUpdate {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.token.is_some() && self.endpoint.is_some() && self.session_id.is_some()
    }

    /// Records the voice server. Leaves the state untouched on error.
    pub fn set_server_update(&mut self, endpoint: &str, token: &str) -> Result<()> {
        if endpoint.trim().is_empty() {
            return Err(Error::EmptyEndpoint);
        }

        self.region = region_of(endpoint);
        self.endpoint = Some(endpoint.to_string());
        self.token = Some(token.to_string());
        Ok(())
    }

    /// Records the voice session. Returns whether the descriptor became
    /// complete with this update.
    pub fn set_state_update(
        &mut self,
        session_id: &str,
        channel_id: &str,
        self_deaf: bool,
        self_mute: bool,
    ) -> bool {
        let was_complete = self.is_complete();

        self.session_id = Some(session_id.to_string());
        self.channel_id = Some(channel_id.to_string());
        self.self_deaf = self_deaf;
        self.self_mute = self_mute;

        !was_complete && self.is_complete()
    }
}

/// `rotterdam123.discord.media:443` -> `rotterdam`.
pub fn region_of(endpoint: &str) -> Option<String> {
    let label = endpoint.split('.').next()?;
    let region: String = label.chars().filter(|c| !c.is_ascii_digit()).collect();
    if region.is_empty() {
        None
    } else {
        Some(region.to_lowercase())
    }
}
