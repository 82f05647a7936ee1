use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, MappedMutexGuard, MutexGuard};
use tracing::{debug, info, warn};

use crate::audio::effects::Filters;
use crate::audio::queue::{LoopMode, Queue};
use crate::audio::voice::{VoiceGateway, VoiceState, VoiceStateUpdate};
use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::manager::WeakManager;
use crate::nodes::message::{PlayerState, TrackEndReason, TrackEventKind};
use crate::nodes::rest::UpdatePlayer;
use crate::nodes::Node;
use crate::sources::Track;

/// Voice close codes after which the gateway join is sent again.
const REJOIN_CLOSE_CODES: [u16; 2] = [4015, 4009];

/// Opciones para crear un player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub guild_id: String,
    pub voice_channel: String,
    pub text_channel: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Preferred voice region, matched against the nodes' regions.
    pub region: Option<String>,
}

impl PlayerOptions {
    pub fn new(guild_id: impl Into<String>, voice_channel: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            voice_channel: voice_channel.into(),
            text_channel: None,
            self_deaf: true,
            self_mute: false,
            region: None,
        }
    }

    pub fn text_channel(mut self, channel: impl Into<String>) -> Self {
        self.text_channel = Some(channel.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Local mirror of what the node is doing for one guild.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub queue: Queue,
    pub is_playing: bool,
    pub is_paused: bool,
    pub is_connected: bool,
    pub loop_mode: LoopMode,
    /// Last reported position in milliseconds.
    pub position: u64,
    pub ping: i64,
    /// Node clock of the last `playerUpdate`.
    pub timestamp: Option<u64>,
    pub volume: u16,
    pub voice_channel: Option<String>,
    pub text_channel: Option<String>,
    pub filters: Filters,
    paused_by_voice_drop: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            queue: Queue::new(),
            is_playing: false,
            is_paused: false,
            is_connected: false,
            loop_mode: LoopMode::None,
            position: 0,
            ping: -1,
            timestamp: None,
            volume: 100,
            voice_channel: None,
            text_channel: None,
            filters: Filters::default(),
            paused_by_voice_drop: false,
        }
    }
}

/// Player de un guild.
///
/// Commands travel through whichever node the player is bound to at the
/// moment. A failed command does not fail the call; it is published as
/// [`ManagerEvent::NodeError`] so the caller's flow is not interrupted by a
/// node hiccup. Validation errors are returned as usual.
pub struct Player {
    guild_id: String,
    manager: WeakManager,
    events: broadcast::Sender<ManagerEvent>,
    gateway: Arc<dyn VoiceGateway>,
    node: RwLock<Arc<Node>>,
    state: tokio::sync::Mutex<PlaybackState>,
    voice: Mutex<VoiceState>,
    destroyed: AtomicBool,
}

impl Player {
    pub(crate) fn new(
        options: &PlayerOptions,
        node: Arc<Node>,
        manager: WeakManager,
        events: broadcast::Sender<ManagerEvent>,
        gateway: Arc<dyn VoiceGateway>,
    ) -> Self {
        let state = PlaybackState {
            voice_channel: Some(options.voice_channel.clone()),
            text_channel: options.text_channel.clone(),
            ..Default::default()
        };
        let voice = VoiceState {
            self_deaf: options.self_deaf,
            self_mute: options.self_mute,
            ..Default::default()
        };

        Self {
            guild_id: options.guild_id.clone(),
            manager,
            events,
            gateway,
            node: RwLock::new(node),
            state: tokio::sync::Mutex::new(state),
            voice: Mutex::new(voice),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    /// Node currently serving this player.
    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node.read())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn voice(&self) -> VoiceState {
        self.voice.lock().clone()
    }

    /// Snapshot of the playback state.
    pub async fn status(&self) -> PlaybackState {
        self.state.lock().await.clone()
    }

    /// Locks the queue for editing.
    ///
    /// ```rust,no_run
    /// # async fn example(player: &open_music_nodes::Player, track: open_music_nodes::Track) {
    /// player.queue().await.add(track);
    /// # }
    /// ```
    pub async fn queue(&self) -> MappedMutexGuard<'_, Queue> {
        MutexGuard::map(self.state.lock().await, |state| &mut state.queue)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed(self.guild_id.clone()));
        }
        Ok(())
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// Sends one update to the current node, reporting failures as node
    /// errors.
    async fn send(&self, update: UpdatePlayer) {
        let node = self.node();
        if let Err(e) = node.update_player(&self.guild_id, &update).await {
            node.report_error(
                format!("update for guild {} failed: {}", self.guild_id, e),
                false,
            );
        }
    }

    fn send_gateway(&self, channel_id: Option<&str>, self_mute: bool, self_deaf: bool) {
        self.gateway.send(
            &self.guild_id,
            json!({
                "op": 4,
                "d": {
                    "guild_id": self.guild_id,
                    "channel_id": channel_id,
                    "self_mute": self_mute,
                    "self_deaf": self_deaf,
                }
            }),
        );
    }

    // ---- Voz ----

    /// Joins the configured voice channel.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_alive()?;

        let mut state = self.state.lock().await;
        let channel = state
            .voice_channel
            .clone()
            .ok_or_else(|| Error::Configuration("player has no voice channel".into()))?;

        let (self_mute, self_deaf) = {
            let voice = self.voice.lock();
            (voice.self_mute, voice.self_deaf)
        };
        self.send_gateway(Some(&channel), self_mute, self_deaf);
        state.is_connected = true;

        debug!("Joining channel {} in guild {}", channel, self.guild_id);
        Ok(())
    }

    /// Leaves voice, pausing playback first.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.leave_voice().await;
        Ok(())
    }

    async fn leave_voice(&self) {
        let mut state = self.state.lock().await;
        if state.voice_channel.is_none() {
            return;
        }

        self.pause_locked(&mut state, true).await;
        state.is_connected = false;
        state.voice_channel = None;
        drop(state);

        self.send_gateway(None, false, false);
        info!("Desconectado del guild {}", self.guild_id);
    }

    pub async fn set_voice_channel(
        &self,
        channel: impl Into<String>,
        self_mute: Option<bool>,
        self_deaf: Option<bool>,
    ) -> Result<()> {
        self.ensure_alive()?;
        let channel = channel.into();

        {
            let mut state = self.state.lock().await;
            if state.is_connected && state.voice_channel.as_deref() == Some(channel.as_str()) {
                return Err(Error::Configuration(format!(
                    "player is already connected to {}",
                    channel
                )));
            }
            state.voice_channel = Some(channel);
        }

        {
            let mut voice = self.voice.lock();
            if let Some(mute) = self_mute {
                voice.self_mute = mute;
            }
            if let Some(deaf) = self_deaf {
                voice.self_deaf = deaf;
            }
        }

        self.connect().await
    }

    pub async fn set_text_channel(&self, channel: impl Into<String>) {
        self.state.lock().await.text_channel = Some(channel.into());
    }

    /// Pushes the voice descriptor to the current node, if complete.
    pub(crate) async fn refresh_voice(&self) {
        let descriptor = self.voice.lock().descriptor();
        if let Some(descriptor) = descriptor {
            self.send(UpdatePlayer::voice(descriptor)).await;
        }
    }

    pub(crate) async fn handle_voice_server(&self, endpoint: Option<&str>, token: &str) -> Result<()> {
        let descriptor = {
            let mut voice = self.voice.lock();
            voice.set_server_update(endpoint.unwrap_or_default(), token)?;
            voice.descriptor()
        };

        if let Some(region) = self.voice.lock().region.clone() {
            debug!("Guild {} voice region: {}", self.guild_id, region);
        }
        if let Some(descriptor) = descriptor {
            self.send(UpdatePlayer::voice(descriptor)).await;
        }
        Ok(())
    }

    pub(crate) async fn handle_voice_state(&self, update: &VoiceStateUpdate) {
        let Some(channel) = update.channel_id.as_deref() else {
            debug!("Guild {} left voice, destroying player", self.guild_id);
            self.destroy().await;
            return;
        };

        let completed = {
            let mut voice = self.voice.lock();
            voice
                .set_state_update(&update.session_id, channel, update.self_deaf, update.self_mute)
                .then(|| voice.descriptor())
                .flatten()
        };
        if let Some(descriptor) = completed {
            self.send(UpdatePlayer::voice(descriptor)).await;
        }

        let mut state = self.state.lock().await;
        state.voice_channel = Some(channel.to_string());
        if state.is_paused && state.paused_by_voice_drop {
            self.pause_locked(&mut state, false).await;
        }
    }

    // ---- Reproducción ----

    /// Starts the next queued track. Does nothing on an empty queue.
    pub async fn play(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        self.play_next(&mut state).await
    }

    async fn play_next(&self, state: &mut PlaybackState) -> Result<()> {
        if state.queue.advance().is_none() {
            return Ok(());
        }

        if let Some(track) = state.queue.current_mut() {
            if !track.is_resolved() {
                let manager = self.manager.upgrade().ok_or(Error::NotInitialized)?;
                track.resolve(&manager).await?;
            }
        }

        let (encoded, title) = match state.queue.current() {
            Some(track) => (
                track.encoded().map(str::to_string),
                track.to_string(),
            ),
            None => return Ok(()),
        };
        let encoded = encoded.ok_or_else(|| Error::TrackNotResolved(title.clone()))?;

        self.send(UpdatePlayer::play(encoded)).await;
        state.position = 0;
        state.is_playing = true;

        info!("🎵 Reproduciendo en {}: {}", self.guild_id, title);
        Ok(())
    }

    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        self.pause_locked(&mut state, paused).await;
        Ok(())
    }

    async fn pause_locked(&self, state: &mut PlaybackState, paused: bool) {
        self.send(UpdatePlayer::paused(paused)).await;
        state.is_paused = paused;
        state.is_playing = !paused && state.queue.current().is_some();
        state.paused_by_voice_drop = false;
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await;
        Ok(())
    }

    async fn stop_locked(&self, state: &mut PlaybackState) {
        self.send(UpdatePlayer::stop()).await;
        state.position = 0;
        state.is_playing = false;
    }

    /// Seeks by `offset` milliseconds from the last reported position.
    ///
    /// The target is clamped to the track bounds.
    pub async fn seek_to(&self, offset: i64) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;

        let track = state.queue.current().ok_or(Error::NothingPlaying)?;
        if !track.info().is_seekable {
            return Err(Error::NotSeekable(track.to_string()));
        }

        let length = i64::try_from(track.length()).unwrap_or(i64::MAX);
        let current = i64::try_from(state.position).unwrap_or(i64::MAX);
        let target = current.saturating_add(offset).clamp(0, length) as u64;

        self.send(UpdatePlayer::position(target)).await;
        state.position = target;
        Ok(())
    }

    /// Sets the volume, 0 to 100.
    pub async fn set_volume(&self, volume: i32) -> Result<()> {
        self.ensure_alive()?;
        let volume = u16::try_from(volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or(Error::InvalidVolume(volume))?;

        let mut state = self.state.lock().await;
        self.send(UpdatePlayer::volume(volume)).await;
        state.volume = volume;
        Ok(())
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<()> {
        self.ensure_alive()?;
        self.state.lock().await.loop_mode = mode;
        Ok(())
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        self.send(UpdatePlayer::filters(filters.clone())).await;
        state.filters = filters;
        Ok(())
    }

    /// Re-issues the current track at the last known position.
    ///
    /// Without a current track the next queued one is started instead.
    pub async fn restart(&self) {
        if self.is_destroyed() {
            return;
        }
        let mut state = self.state.lock().await;

        let encoded = state
            .queue
            .current()
            .and_then(|track| track.encoded())
            .map(str::to_string);

        let Some(encoded) = encoded else {
            if !state.queue.is_empty() {
                if let Err(e) = self.play_next(&mut state).await {
                    warn!("Guild {} could not restart: {}", self.guild_id, e);
                }
            }
            return;
        };

        let update = UpdatePlayer {
            encoded_track: Some(Some(encoded)),
            position: Some(state.position),
            volume: Some(state.volume),
            paused: Some(state.is_paused),
            filters: (!state.filters.is_empty()).then(|| state.filters.clone()),
            ..Default::default()
        };
        self.send(update).await;
    }

    // ---- Nodos ----

    /// Moves the player to the node called `name`.
    pub async fn move_node(&self, name: &str) -> Result<()> {
        self.ensure_alive()?;
        let manager = self.manager.upgrade().ok_or(Error::NotInitialized)?;
        let target = manager
            .node(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;

        let current = self.node();
        if Arc::ptr_eq(&current, &target) {
            return Ok(());
        }
        if !target.is_connected() {
            return Err(Error::NodeUnavailable(name.to_string()));
        }

        if current.session_id().is_some() {
            if let Err(e) = current.destroy_player(&self.guild_id).await {
                debug!("Old node {} kept guild {}: {}", current.name(), self.guild_id, e);
            }
        }

        *self.node.write() = Arc::clone(&target);
        self.refresh_voice().await;
        self.restart().await;

        info!(
            "Guild {} movido de {} a {}",
            self.guild_id,
            current.name(),
            target.name()
        );
        self.emit(ManagerEvent::PlayerMove {
            guild_id: self.guild_id.clone(),
            from: current.name().to_string(),
            to: target.name().to_string(),
        });
        Ok(())
    }

    /// Moves to the best other connected node, or destroys the player when
    /// there is none.
    pub async fn auto_move_node(&self) {
        if self.is_destroyed() {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        let current = self.node();
        let next = manager
            .least_used_nodes()
            .into_iter()
            .find(|node| !Arc::ptr_eq(node, &current));

        match next {
            Some(node) => {
                if let Err(e) = self.move_node(node.name()).await {
                    warn!("Guild {} could not move to {}: {}", self.guild_id, node.name(), e);
                }
            }
            None => {
                warn!("No node left for guild {}, destroying player", self.guild_id);
                self.destroy().await;
            }
        }
    }

    /// Unregisters, leaves voice and drops the node-side player. Final.
    ///
    /// The guild is free for a new player as soon as this is called.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.unregister_player(self);
        }

        self.leave_voice().await;

        let node = self.node();
        if node.session_id().is_some() {
            if let Err(e) = node.destroy_player(&self.guild_id).await {
                node.report_error(
                    format!("destroy for guild {} failed: {}", self.guild_id, e),
                    false,
                );
            }
        }

        info!("Player del guild {} destruido", self.guild_id);
        self.emit(ManagerEvent::PlayerDestroy {
            guild_id: self.guild_id.clone(),
        });
    }

    // ---- Eventos del nodo ----

    pub(crate) async fn handle_update(&self, update: PlayerState) {
        let mut state = self.state.lock().await;
        state.is_connected = update.connected;
        state.position = update.position;
        state.ping = update.ping;
        state.timestamp = Some(update.time);
    }

    pub(crate) async fn handle_event(&self, event: TrackEventKind) {
        let mut state = self.state.lock().await;
        let guild_id = self.guild_id.clone();

        match event {
            TrackEventKind::TrackStartEvent { .. } => {
                state.is_playing = true;
                self.emit(ManagerEvent::TrackStart {
                    guild_id,
                    track: state.queue.current().cloned(),
                });
            }
            TrackEventKind::TrackEndEvent { reason, .. } => {
                self.on_track_end(&mut state, reason).await;
            }
            TrackEventKind::TrackStuckEvent { threshold_ms, .. } => {
                warn!("Track atascado en {} ({}ms)", guild_id, threshold_ms);
                self.emit(ManagerEvent::TrackStuck {
                    guild_id,
                    track: state.queue.current().cloned(),
                    threshold_ms,
                });
                self.stop_locked(&mut state).await;
            }
            TrackEventKind::TrackExceptionEvent { exception, .. } => {
                warn!(
                    "Error reproduciendo en {}: {}",
                    guild_id,
                    exception.message.as_deref().unwrap_or(&exception.cause)
                );
                self.emit(ManagerEvent::TrackException {
                    guild_id,
                    track: state.queue.current().cloned(),
                    exception,
                });
                self.stop_locked(&mut state).await;
            }
            TrackEventKind::WebSocketClosedEvent {
                code,
                reason,
                by_remote,
            } => {
                if REJOIN_CLOSE_CODES.contains(&code) {
                    let (self_mute, self_deaf) = {
                        let voice = self.voice.lock();
                        (voice.self_mute, voice.self_deaf)
                    };
                    self.send_gateway(state.voice_channel.as_deref(), self_mute, self_deaf);
                }
                self.emit(ManagerEvent::SocketClosed {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                });
                self.pause_locked(&mut state, true).await;
                state.paused_by_voice_drop = true;
            }
        }
    }

    async fn on_track_end(&self, state: &mut PlaybackState, reason: TrackEndReason) {
        // The replacing track is already current and `previous` was set
        // when it was dequeued.
        if reason == TrackEndReason::Replaced {
            return;
        }

        let finished = state.queue.finish_current();

        if !reason.may_start_next() {
            state.is_playing = false;
            self.emit_track_end(finished, reason);
            return;
        }

        // A track that failed to load is never looped back in.
        let loop_mode = match reason {
            TrackEndReason::LoadFailed => LoopMode::None,
            _ => state.loop_mode,
        };

        match (loop_mode, finished) {
            (LoopMode::Track, Some(track)) => {
                state.queue.push_front(track.clone());
                self.emit_track_end(Some(track), reason);
            }
            (LoopMode::Queue, Some(track)) => {
                state.queue.add(track.clone());
                self.emit_track_end(Some(track), reason);
            }
            (_, finished) => {
                if state.queue.is_empty() {
                    state.is_playing = false;
                    info!("Cola terminada en {}", self.guild_id);
                    self.emit(ManagerEvent::QueueEnd {
                        guild_id: self.guild_id.clone(),
                    });
                    return;
                }
                self.emit_track_end(finished, reason);
            }
        }

        if let Err(e) = self.play_next(state).await {
            warn!("Guild {} could not start the next track: {}", self.guild_id, e);
        }
    }

    fn emit_track_end(&self, track: Option<Track>, reason: TrackEndReason) {
        self.emit(ManagerEvent::TrackEnd {
            guild_id: self.guild_id.clone(),
            track,
            reason,
        });
    }

    #[cfg(test)]
    pub(crate) async fn mark_paused_by_voice_drop(&self) {
        let mut state = self.state.lock().await;
        state.is_paused = true;
        state.paused_by_voice_drop = true;
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node().name())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
