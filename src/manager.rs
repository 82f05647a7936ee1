//! # Manager
//!
//! Owns the node pool and the per-guild players.
//!
//! Nodes are ranked by [`Node::penalty`] on every selection; a player is
//! created on the least loaded connected node (optionally restricted to a
//! voice region) and moved elsewhere when that node goes away.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::audio::voice::{VoiceGateway, VoicePacket};
use crate::audio::{Player, PlayerOptions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::nodes::rest::{NodeInfo, RestClient};
use crate::nodes::stats::NodeStats;
use crate::nodes::{Node, NodeDescriptor, NodeOptions};
use crate::sources::{ResolveResult, SearchSource, Track, TrackData, TrackResolver};

/// Result of [`Manager::get_node`].
#[derive(Debug, Clone)]
pub enum NodeLookup {
    /// `"auto"`: every connected node, least loaded first.
    Ranked(Vec<Arc<Node>>),
    Single(Arc<Node>),
}

/// Manager de nodos y players. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    user_id: String,
    gateway: Arc<dyn VoiceGateway>,
    nodes: DashMap<String, Arc<Node>>,
    players: DashMap<String, Arc<Player>>,
    events: broadcast::Sender<ManagerEvent>,
    initialized: AtomicBool,
}

/// Non-owning handle held by nodes and players.
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<Manager> {
        self.0.upgrade().map(|inner| Manager { inner })
    }
}

impl Manager {
    /// Creates a manager for the bot user `user_id`.
    ///
    /// Nothing connects until [`Manager::init`] is called.
    pub fn new(config: Config, user_id: impl Into<String>, gateway: Arc<dyn VoiceGateway>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                user_id: user_id.into(),
                gateway,
                nodes: DashMap::new(),
                players: DashMap::new(),
                events,
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Registers and connects every configured node.
    pub fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        self.inner.config.validate()?;
        for descriptor in self.inner.config.nodes.clone() {
            self.add_node(descriptor)?;
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        info!(
            "🎼 Manager iniciado con {} nodos",
            self.inner.nodes.len()
        );
        Ok(())
    }

    /// Events published by nodes and players.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    // ---- Nodos ----

    /// Validates, registers and starts connecting a node.
    pub fn add_node(&self, descriptor: NodeDescriptor) -> Result<Arc<Node>> {
        let descriptor = descriptor.normalized()?;
        let config = &self.inner.config;

        match self.inner.nodes.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(Error::Configuration(format!(
                "a node named `{}` already exists",
                descriptor.name
            ))),
            Entry::Vacant(entry) => {
                let rest = RestClient::new(
                    &descriptor.name,
                    &descriptor.rest_url(),
                    &descriptor.password,
                    config.request_timeout(),
                )?;
                let node = Arc::new(Node::new(
                    descriptor,
                    NodeOptions::from_config(config, self.inner.user_id.clone()),
                    Arc::new(rest),
                    self.downgrade(),
                    self.inner.events.clone(),
                ));
                entry.insert(Arc::clone(&node));
                node.connect();
                Ok(node)
            }
        }
    }

    /// Disconnects and forgets a node. Unknown names are ignored.
    pub async fn remove_node(&self, name: &str) {
        let Some(node) = self.node(name) else {
            return;
        };
        node.disconnect().await;
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.nodes.get(name).map(|node| Arc::clone(node.value()))
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner
            .nodes
            .iter()
            .map(|node| Arc::clone(node.value()))
            .collect()
    }

    /// Connected nodes, least loaded first.
    ///
    /// Each node is scored once per call, so stats frames landing while
    /// sorting cannot reorder the result. Nodes that have not reported
    /// stats yet come last.
    pub fn least_used_nodes(&self) -> Vec<Arc<Node>> {
        let mut ranked: Vec<Arc<Node>> = self
            .inner
            .nodes
            .iter()
            .filter(|node| node.is_connected())
            .map(|node| Arc::clone(node.value()))
            .collect();
        ranked.sort_by_cached_key(|node| node.ranking());
        ranked
    }

    /// Looks a node up by name, or ranks every node for `"auto"`.
    ///
    /// A named node that is not connected is asked to reconnect and still
    /// returned.
    pub fn get_node(&self, identifier: &str) -> Result<NodeLookup> {
        if self.inner.nodes.is_empty() {
            return Err(Error::NoNodesAvailable);
        }
        if identifier == "auto" {
            return Ok(NodeLookup::Ranked(self.least_used_nodes()));
        }

        let node = self
            .node(identifier)
            .ok_or_else(|| Error::NodeNotFound(identifier.to_string()))?;
        if !node.is_connected() {
            node.connect();
        }
        Ok(NodeLookup::Single(node))
    }

    pub(crate) fn unregister_node(&self, node: &Node) {
        self.inner
            .nodes
            .remove_if(node.name(), |_, registered| std::ptr::eq(registered.as_ref(), node));
    }

    fn best_node(&self) -> Result<Arc<Node>> {
        self.least_used_nodes()
            .into_iter()
            .next()
            .ok_or(Error::NoNodesAvailable)
    }

    /// Best node for `region`, falling back to the global best. The second
    /// value is the region that could not be honoured.
    fn select_node(&self, region: Option<&str>) -> Result<(Arc<Node>, Option<String>)> {
        let ranked = self.least_used_nodes();
        let best = ranked.first().cloned().ok_or(Error::NoNodesAvailable)?;

        let Some(region) = region.map(str::to_lowercase) else {
            return Ok((best, None));
        };

        match ranked.into_iter().find(|node| node.descriptor().serves(&region)) {
            Some(node) => Ok((node, None)),
            None => {
                debug!(
                    "No node serves region {}, falling back to {}",
                    region,
                    best.name()
                );
                Ok((best, Some(region)))
            }
        }
    }

    // ---- Players ----

    /// Returns the guild's player, creating it and joining voice when it
    /// does not exist yet.
    pub async fn create(&self, options: PlayerOptions) -> Result<Arc<Player>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if let Some(player) = self.get(&options.guild_id) {
            if !player.is_destroyed() {
                return Ok(player);
            }
        }

        let (node, fallback) = self.select_node(options.region.as_deref())?;
        let build = || {
            Arc::new(Player::new(
                &options,
                Arc::clone(&node),
                self.downgrade(),
                self.inner.events.clone(),
                Arc::clone(&self.inner.gateway),
            ))
        };

        // A destroyed player still registered is on its way out.
        let (player, created) = match self.inner.players.entry(options.guild_id.clone()) {
            Entry::Occupied(mut entry) if entry.get().is_destroyed() => {
                let player = build();
                entry.insert(Arc::clone(&player));
                (player, true)
            }
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let player = build();
                entry.insert(Arc::clone(&player));
                (player, true)
            }
        };

        if created {
            if let Some(region) = fallback {
                self.emit(ManagerEvent::RegionFallback {
                    guild_id: options.guild_id.clone(),
                    region,
                    node: node.name().to_string(),
                });
            }
            info!(
                "Player creado para guild {} en nodo {}",
                options.guild_id,
                node.name()
            );
            self.emit(ManagerEvent::PlayerCreate {
                guild_id: options.guild_id.clone(),
                node: node.name().to_string(),
            });
            player.connect().await?;
        }

        Ok(player)
    }

    pub fn get(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.inner
            .players
            .get(guild_id)
            .map(|player| Arc::clone(player.value()))
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner
            .players
            .iter()
            .map(|player| Arc::clone(player.value()))
            .collect()
    }

    /// Players currently bound to `node`.
    pub fn players_on(&self, node: &Arc<Node>) -> Vec<Arc<Player>> {
        self.inner
            .players
            .iter()
            .filter(|player| Arc::ptr_eq(&player.node(), node))
            .map(|player| Arc::clone(player.value()))
            .collect()
    }

    pub(crate) fn unregister_player(&self, player: &Player) {
        self.inner
            .players
            .remove_if(player.guild_id(), |_, registered| {
                std::ptr::eq(registered.as_ref(), player)
            });
    }

    /// Feeds a voice gateway packet to the owning player.
    ///
    /// Packets for guilds without a player, and state updates about other
    /// users, are ignored.
    pub async fn route_voice_packet(&self, packet: VoicePacket) -> Result<()> {
        let Some(player) = self.get(packet.guild_id()) else {
            return Ok(());
        };

        match packet {
            VoicePacket::ServerUpdate(update) => {
                player
                    .handle_voice_server(update.endpoint.as_deref(), &update.token)
                    .await
            }
            VoicePacket::StateUpdate(update) => {
                if update.user_id != self.inner.user_id {
                    return Ok(());
                }
                player.handle_voice_state(&update).await;
                Ok(())
            }
        }
    }

    /// Same as [`Manager::route_voice_packet`] for a raw gateway dispatch.
    /// Anything that is not a voice packet is ignored.
    pub async fn route_raw(&self, payload: Value) -> Result<()> {
        let is_voice = matches!(
            payload.get("t").and_then(Value::as_str),
            Some("VOICE_SERVER_UPDATE" | "VOICE_STATE_UPDATE")
        );
        if !is_voice {
            return Ok(());
        }
        self.route_voice_packet(serde_json::from_value(payload)?).await
    }

    // ---- Búsqueda y REST ----

    /// Searches or loads `query` on `node` (the least loaded one by default).
    pub async fn resolve(
        &self,
        query: &str,
        source: Option<SearchSource>,
        requester: Option<Value>,
        node: Option<Arc<Node>>,
    ) -> Result<ResolveResult> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let node = match node {
            Some(node) => node,
            None => self.best_node()?,
        };

        let source = source.unwrap_or(self.inner.config.default_search_source);
        let identifier = source.identifier_for(query);
        debug!("Resolviendo {} en {}", identifier, node.name());

        let body = node.load_tracks(&identifier).await?;
        ResolveResult::from_response(body, requester)
    }

    pub async fn decode_track(&self, encoded: &str, node: Option<Arc<Node>>) -> Result<TrackData> {
        let node = match node {
            Some(node) => node,
            None => self.best_node()?,
        };
        node.decode_track(encoded).await
    }

    pub async fn decode_tracks(
        &self,
        encoded: &[String],
        node: Option<Arc<Node>>,
    ) -> Result<Vec<TrackData>> {
        let node = match node {
            Some(node) => node,
            None => self.best_node()?,
        };
        node.decode_tracks(encoded).await
    }

    pub async fn get_node_info(&self, name: &str) -> Result<NodeInfo> {
        let node = self
            .node(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        node.info().await
    }

    pub async fn get_node_status(&self, name: &str) -> Result<NodeStats> {
        let node = self
            .node(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        node.fetch_stats().await
    }

    /// Destroys every player and closes every node.
    pub async fn shutdown(&self) {
        info!("⚠️ Cerrando manager...");
        join_all(self.players().iter().map(|player| player.destroy())).await;

        for node in self.nodes() {
            node.close();
        }
        self.inner.nodes.clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }

    #[cfg(test)]
    pub(crate) fn events_sender(&self) -> broadcast::Sender<ManagerEvent> {
        self.inner.events.clone()
    }

    #[cfg(test)]
    pub(crate) fn insert_node(&self, node: Arc<Node>) {
        self.inner.nodes.insert(node.name().to_string(), node);
    }

    #[cfg(test)]
    pub(crate) fn mark_initialized(&self) {
        self.inner.initialized.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrackResolver for Manager {
    async fn search(&self, query: &str) -> Result<Vec<Track>> {
        Ok(self.resolve(query, None, None, None).await?.tracks)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("user_id", &self.inner.user_id)
            .field("nodes", &self.inner.nodes.len())
            .field("players", &self.inner.players.len())
            .finish()
    }
}

impl Drop for ManagerInner {
    /// Stops every node socket once the last handle is gone.
    fn drop(&mut self) {
        if !self.nodes.is_empty() {
            debug!("Closing {} nodes", self.nodes.len());
        }
        for node in self.nodes.iter() {
            node.close();
        }
    }
}
