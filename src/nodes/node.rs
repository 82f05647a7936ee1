use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::IncomingMessage;
use super::message::Ready;
use super::rest::{CommandChannel, NodeInfo, RemotePlayer, ResumeConfig, UpdatePlayer};
use super::socket;
use super::stats::NodeStats;
use super::{NodeDescriptor, NodeState};
use crate::audio::Player;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::manager::WeakManager;
use crate::sources::TrackData;

/// Connection settings shared by every node of a manager.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub user_id: String,
    pub client_name: String,
    pub reconnect_timeout: Duration,
    pub reconnect_tries: u32,
    pub resume: bool,
    pub resume_key: Option<String>,
    pub resume_timeout_secs: u64,
    pub inbound_capacity: usize,
}

impl NodeOptions {
    pub fn from_config(config: &Config, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_name: config.client_name.clone(),
            reconnect_timeout: config.reconnect_timeout(),
            reconnect_tries: config.reconnect_tries,
            resume: config.resume,
            resume_key: config.resume_key.clone(),
            resume_timeout_secs: config.resume_timeout_secs,
            inbound_capacity: config.inbound_capacity,
        }
    }
}

/// Un nodo de audio.
///
/// The node owns two tasks while it is connecting or connected: the socket
/// task, which reads frames and drives reconnection, and a dispatcher that
/// handles decoded frames one at a time in arrival order.
pub struct Node {
    descriptor: NodeDescriptor,
    options: NodeOptions,
    rest: Arc<dyn CommandChannel>,
    manager: WeakManager,
    events: broadcast::Sender<ManagerEvent>,

    state: RwLock<NodeState>,
    stats: RwLock<Option<NodeStats>>,
    session_id: RwLock<Option<String>>,

    attempts: AtomicU32,
    /// Set after the first `ready`; later ones are reconnections.
    established: AtomicBool,
    /// Set by `disconnect()`, the node is never selected again.
    retired: AtomicBool,

    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub(crate) fn new(
        descriptor: NodeDescriptor,
        options: NodeOptions,
        rest: Arc<dyn CommandChannel>,
        manager: WeakManager,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            descriptor,
            options,
            rest,
            manager,
            events,
            state: RwLock::new(NodeState::Disconnected),
            stats: RwLock::new(None),
            session_id: RwLock::new(None),
            attempts: AtomicU32::new(0),
            established: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub(crate) fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    /// Connected and still part of the pool.
    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected && !self.retired.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.read().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Load score, recomputed from the latest stats on every call.
    ///
    /// A node that is not connected scores 0; callers filter on state first.
    /// A connected node that has not sent stats yet also scores 0, see
    /// [`Node::ranking`] for how selection orders those.
    pub fn penalty(&self) -> i64 {
        if self.state() != NodeState::Connected {
            return 0;
        }
        self.stats
            .read()
            .as_ref()
            .map(NodeStats::penalty)
            .unwrap_or(0)
    }

    /// Sort key used for selection: nodes without a stats snapshot go
    /// after every node that has one, then lower penalty first.
    pub(crate) fn ranking(&self) -> (bool, i64) {
        match self.stats.read().as_ref() {
            Some(stats) => (false, stats.penalty()),
            None => (true, 0),
        }
    }

    /// Starts connecting in the background.
    ///
    /// No-op while connecting or connected. Socket failures never surface
    /// here, they are published as [`ManagerEvent::NodeError`].
    pub fn connect(self: &Arc<Self>) {
        if self.retired.load(Ordering::SeqCst) {
            warn!("Node {} was disconnected and removed, not reconnecting", self.name());
            return;
        }

        {
            let mut state = self.state.write();
            if *state != NodeState::Disconnected {
                debug!("Node {} is already {:?}", self.name(), *state);
                return;
            }
            *state = NodeState::Connecting;
        }

        self.attempts.store(0, Ordering::SeqCst);

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let (tx, rx) = mpsc::channel(self.options.inbound_capacity);
        tokio::spawn(dispatch(Arc::downgrade(self), rx));
        let handle = tokio::spawn(socket::run(Arc::clone(self), tx, token));

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }

        info!("🔌 Conectando al nodo {} ({})", self.name(), self.descriptor.socket_url());
    }

    /// Removes the node from service.
    ///
    /// Bound players are moved elsewhere first, then the socket is closed
    /// with code 1000 and the node leaves the pool. Calling it again does
    /// nothing.
    pub async fn disconnect(self: &Arc<Self>) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Desconectando nodo {}", self.name());
        self.fail_over().await;

        self.cancel.lock().cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Socket task of node {} panicked: {}", self.name(), e);
                }
            }
        }

        self.set_state(NodeState::Disconnected);
        *self.session_id.write() = None;

        if let Some(manager) = self.manager.upgrade() {
            manager.unregister_node(self);
        }

        self.emit(ManagerEvent::NodeDisconnect {
            node: self.name().to_string(),
            code: Some(1000),
        });
    }

    /// Stops the socket without moving players. Used on shutdown.
    pub(crate) fn close(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.cancel.lock().cancel();
    }

    /// Moves every player bound to this node to the best other node.
    pub(crate) async fn fail_over(self: &Arc<Self>) {
        let players = self.players();
        if players.is_empty() {
            return;
        }

        info!("Moviendo {} players fuera del nodo {}", players.len(), self.name());
        join_all(players.iter().map(|player| player.auto_move_node())).await;
    }

    fn players(self: &Arc<Self>) -> Vec<Arc<Player>> {
        self.manager
            .upgrade()
            .map(|manager| manager.players_on(self))
            .unwrap_or_default()
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn report_error(&self, error: impl Into<String>, fatal: bool) {
        let error = error.into();
        if fatal {
            error!("❌ Nodo {}: {}", self.name(), error);
        } else {
            warn!("Nodo {}: {}", self.name(), error);
        }
        self.emit(ManagerEvent::NodeError {
            node: self.name().to_string(),
            error,
            fatal,
        });
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn on_open(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(NodeState::Connected);
        info!("✅ Conectado al nodo {}", self.name());
        self.emit(ManagerEvent::NodeConnect {
            node: self.name().to_string(),
        });
    }

    /// Handles one decoded frame.
    pub(crate) async fn handle_message(self: &Arc<Self>, message: IncomingMessage) {
        match message {
            IncomingMessage::Stats(stats) => {
                *self.stats.write() = Some(stats);
            }
            IncomingMessage::Ready(ready) => self.on_ready(ready).await,
            IncomingMessage::PlayerUpdate(update) => {
                if let Some(player) = self.bound_player(&update.guild_id) {
                    player.handle_update(update.state).await;
                }
            }
            IncomingMessage::Event(event) => {
                if let Some(player) = self.bound_player(&event.guild_id) {
                    player.handle_event(event.kind).await;
                }
            }
        }
    }

    fn bound_player(self: &Arc<Self>, guild_id: &str) -> Option<Arc<Player>> {
        let player = self.manager.upgrade()?.get(guild_id)?;
        if Arc::ptr_eq(&player.node(), self) {
            Some(player)
        } else {
            debug!("Frame for guild {} ignored, player lives elsewhere", guild_id);
            None
        }
    }

    async fn on_ready(self: &Arc<Self>, ready: Ready) {
        info!(
            "Nodo {} listo (session {}, resumed: {})",
            self.name(),
            ready.session_id,
            ready.resumed
        );
        *self.session_id.write() = Some(ready.session_id.clone());

        if self.options.resume {
            if let Err(e) = self.configure_resume(&ready.session_id).await {
                self.report_error(format!("could not configure resuming: {}", e), false);
            }
        }

        if self.established.swap(true, Ordering::SeqCst) {
            let players = self.players();
            debug!("Restarting {} players on {}", players.len(), self.name());
            join_all(players.iter().map(|player| async move {
                player.refresh_voice().await;
                player.restart().await;
            }))
            .await;
        }
    }

    async fn configure_resume(&self, session_id: &str) -> Result<()> {
        let body = ResumeConfig {
            resuming: true,
            resuming_key: self.options.resume_key.clone(),
            timeout: self.options.resume_timeout_secs,
        };
        self.rest
            .patch(
                &format!("/v4/sessions/{}", session_id),
                serde_json::to_value(body)?,
            )
            .await?;
        Ok(())
    }

    fn session_path(&self) -> Result<String> {
        self.session_id
            .read()
            .as_ref()
            .map(|id| format!("/v4/sessions/{}", id))
            .ok_or_else(|| Error::SessionNotReady(self.name().to_string()))
    }

    pub async fn update_player(&self, guild_id: &str, update: &UpdatePlayer) -> Result<Value> {
        let path = format!(
            "{}/players/{}?noReplace=false",
            self.session_path()?,
            guild_id
        );
        self.rest.patch(&path, serde_json::to_value(update)?).await
    }

    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = format!("{}/players/{}", self.session_path()?, guild_id);
        self.rest.delete(&path).await?;
        Ok(())
    }

    /// Players the backend currently holds for this session.
    pub async fn fetch_players(&self) -> Result<Vec<RemotePlayer>> {
        let path = format!("{}/players", self.session_path()?);
        let body = self.rest.get(&path).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<Value> {
        self.rest
            .get(&format!(
                "/v4/loadtracks?identifier={}",
                urlencoding::encode(identifier)
            ))
            .await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackData> {
        let body = self
            .rest
            .get(&format!(
                "/v4/decodetrack?encodedTrack={}",
                urlencoding::encode(encoded)
            ))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackData>> {
        let body = self.rest.post("/v4/decodetracks", json!(encoded)).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        Ok(serde_json::from_value(self.rest.get("/v4/info").await?)?)
    }

    /// Stats straight from the REST endpoint; the socket snapshot is left
    /// untouched.
    pub async fn fetch_stats(&self) -> Result<NodeStats> {
        Ok(serde_json::from_value(self.rest.get("/v4/stats").await?)?)
    }

    #[cfg(test)]
    pub(crate) fn mark_connected(&self, session_id: &str, stats: impl Into<Option<NodeStats>>) {
        self.set_state(NodeState::Connected);
        *self.session_id.write() = Some(session_id.to_string());
        *self.stats.write() = stats.into();
    }

    #[cfg(test)]
    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.descriptor.name)
            .field("state", &self.state())
            .field("penalty", &self.penalty())
            .finish()
    }
}

async fn dispatch(node: Weak<Node>, mut inbound: mpsc::Receiver<IncomingMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        node.handle_message(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PlayerOptions;
    use crate::nodes::message::{
        PlayerEvent, PlayerState, PlayerUpdate, TrackEndReason, TrackEventKind,
    };
    use crate::nodes::rest::MockCommandChannel;
    use crate::nodes::stats::tests::stats;
    use crate::sources::tests::track;
    use crate::testing::{drain, fake_manager, FakeNode, RecordingChannel};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_penalty_is_zero_until_connected() {
        let (_manager, nodes) = fake_manager(vec![FakeNode::new("a", 5).disconnected()]).await;
        assert_eq!(nodes[0].penalty(), 0);

        nodes[0].mark_connected("s", stats(5, 0.0, 0, 0));
        assert_eq!(nodes[0].penalty(), 5);
    }

    #[tokio::test]
    async fn test_stats_frames_replace_the_snapshot() {
        let (_manager, nodes) = fake_manager(vec![FakeNode::new("a", 1)]).await;

        nodes[0]
            .handle_message(IncomingMessage::Stats(stats(7, 0.0, 0, 0)))
            .await;
        assert_eq!(nodes[0].stats().unwrap().players, 7);
        assert_eq!(nodes[0].penalty(), 7);
    }

    #[tokio::test]
    async fn test_ready_stores_session_and_configures_resume() {
        let mut rest = MockCommandChannel::new();
        rest.expect_patch()
            .withf(|path, body| {
                path == "/v4/sessions/abc"
                    && body == &json!({ "resuming": true, "resumingKey": "key", "timeout": 60 })
            })
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let (_manager, nodes) = fake_manager(vec![FakeNode::new("a", 1)
            .disconnected()
            .with_rest(rest)
            .resuming(Some("key"))])
        .await;

        nodes[0]
            .handle_message(IncomingMessage::Ready(Ready {
                resumed: false,
                session_id: "abc".into(),
            }))
            .await;

        assert_eq!(nodes[0].session_id().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_frames_for_unknown_guilds_are_dropped() {
        let on_a = Arc::new(RecordingChannel::default());
        let on_b = Arc::new(RecordingChannel::default());
        let (manager, nodes) = fake_manager(vec![
            FakeNode::new("a", 1).recording(&on_a),
            FakeNode::new("b", 5).recording(&on_b),
        ])
        .await;
        let player = manager
            .create(PlayerOptions::new("42", "100"))
            .await
            .unwrap();
        player.queue().await.add(track("a")).add(track("b"));
        player.play().await.unwrap();
        on_a.clear();
        let mut events = manager.subscribe();

        nodes[0]
            .handle_message(IncomingMessage::PlayerUpdate(PlayerUpdate {
                guild_id: "nobody".into(),
                state: PlayerState::default(),
            }))
            .await;
        nodes[0]
            .handle_message(IncomingMessage::Event(PlayerEvent {
                guild_id: "nobody".into(),
                kind: TrackEventKind::TrackEndEvent {
                    track: Value::Null,
                    reason: TrackEndReason::Finished,
                },
            }))
            .await;
        // Guild 42 lives on "a", so "b" has no say over it.
        nodes[1]
            .handle_message(IncomingMessage::PlayerUpdate(PlayerUpdate {
                guild_id: "42".into(),
                state: PlayerState {
                    time: 1,
                    position: 9_000,
                    connected: true,
                    ping: 3,
                },
            }))
            .await;
        nodes[1]
            .handle_message(IncomingMessage::Event(PlayerEvent {
                guild_id: "42".into(),
                kind: TrackEventKind::TrackEndEvent {
                    track: Value::Null,
                    reason: TrackEndReason::Finished,
                },
            }))
            .await;

        assert!(on_a.calls().is_empty());
        assert!(on_b.calls().is_empty());
        assert!(drain(&mut events).is_empty());
        let status = player.status().await;
        assert_eq!(status.position, 0);
        assert_eq!(status.queue.current().map(|t| t.title()), Some("a"));
        assert!(manager.get("nobody").is_none());
    }

    #[tokio::test]
    async fn test_rest_paths() {
        let mut rest = MockCommandChannel::new();
        rest.expect_get()
            .withf(|path| path == "/v4/loadtracks?identifier=dzsearch%3Aa%20b")
            .returning(|_| Ok(json!({ "loadType": "empty", "data": {} })));
        rest.expect_get()
            .withf(|path| path == "/v4/sessions/s/players")
            .returning(|_| Ok(json!([])));
        rest.expect_delete()
            .withf(|path| path == "/v4/sessions/s/players/42")
            .times(1)
            .returning(|_| Ok(Value::Null));

        let (_manager, nodes) = fake_manager(vec![FakeNode::new("a", 1).with_rest(rest)]).await;
        let node = &nodes[0];

        node.load_tracks("dzsearch:a b").await.unwrap();
        assert!(node.fetch_players().await.unwrap().is_empty());
        node.destroy_player("42").await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_tracks() {
        let decoded = json!({
            "encoded": "QAAA+/x",
            "info": {
                "identifier": "x", "isSeekable": true, "author": "A",
                "length": 1000, "isStream": false, "position": 0,
                "title": "One", "uri": null, "sourceName": "deezer"
            },
            "pluginInfo": {}
        });
        let single = decoded.clone();
        let many = json!([decoded]);

        let mut rest = MockCommandChannel::new();
        rest.expect_get()
            .withf(|path| path == "/v4/decodetrack?encodedTrack=QAAA%2B%2Fx")
            .times(1)
            .returning(move |_| Ok(single.clone()));
        rest.expect_post()
            .withf(|path, body| path == "/v4/decodetracks" && body == &json!(["QAAA+/x"]))
            .times(1)
            .returning(move |_, _| Ok(many.clone()));

        let (manager, _nodes) = fake_manager(vec![FakeNode::new("a", 1).with_rest(rest)]).await;

        let one = manager.decode_track("QAAA+/x", None).await.unwrap();
        assert_eq!(one.info.title, "One");

        let all = manager
            .decode_tracks(&["QAAA+/x".to_string()], None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].encoded, "QAAA+/x");
    }

    #[tokio::test]
    async fn test_session_commands_need_a_session() {
        let (_manager, nodes) = fake_manager(vec![FakeNode::new("a", 1).disconnected()]).await;

        let err = nodes[0]
            .update_player("1", &UpdatePlayer::paused(true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotReady(name) if name == "a"));
    }
}
