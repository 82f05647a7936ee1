//! In-memory doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::audio::voice::VoiceGateway;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::ManagerEvent;
use crate::manager::Manager;
use crate::nodes::rest::CommandChannel;
use crate::nodes::stats::tests::stats;
use crate::nodes::{Node, NodeDescriptor, NodeOptions};

pub(crate) const USER_ID: &str = "900000000000000001";

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub method: &'static str,
    pub path: String,
    pub body: Value,
}

/// Command channel that answers `null` to everything and remembers what it
/// was asked.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    calls: Mutex<Vec<Call>>,
    failing: Option<String>,
}

impl RecordingChannel {
    /// Answers 500 to every path containing `fragment`, still recording it.
    pub(crate) fn failing_on(fragment: &str) -> Self {
        Self {
            failing: Some(fragment.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Bodies of every player update, in order.
    pub(crate) fn updates(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == "PATCH" && call.path.contains("/players/"))
            .map(|call| call.body)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, method: &'static str, path: &str, body: Value) -> Result<Value> {
        self.calls.lock().push(Call {
            method,
            path: path.to_string(),
            body,
        });
        match &self.failing {
            Some(fragment) if path.contains(fragment.as_str()) => Err(Error::Rest {
                node: "fake".to_string(),
                status: 500,
                message: "internal error".to_string(),
            }),
            _ => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn get(&self, path: &str) -> Result<Value> {
        self.record("GET", path, Value::Null)
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.record("PATCH", path, body)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.record("POST", path, body)
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.record("DELETE", path, Value::Null)
    }
}

/// Gateway that keeps every op 4 frame.
#[derive(Default)]
pub(crate) struct RecordingGateway {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingGateway {
    pub(crate) fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }
}

impl VoiceGateway for RecordingGateway {
    fn send(&self, guild_id: &str, payload: Value) {
        self.sent.lock().push((guild_id.to_string(), payload));
    }
}

/// Blueprint of a node registered straight into a test manager.
pub(crate) struct FakeNode {
    name: String,
    players: u32,
    system_load: f64,
    reported: bool,
    connected: bool,
    port: u16,
    regions: Vec<String>,
    rest: Arc<dyn CommandChannel>,
    resume_key: Option<Option<String>>,
    retries: Option<(u32, Duration)>,
}

impl FakeNode {
    /// A connected node whose penalty is `players`.
    pub(crate) fn new(name: &str, players: u32) -> Self {
        Self {
            name: name.to_string(),
            players,
            system_load: 0.0,
            reported: true,
            connected: true,
            port: 2333,
            regions: Vec::new(),
            rest: Arc::new(RecordingChannel::default()),
            resume_key: None,
            retries: None,
        }
    }

    pub(crate) fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    /// Connected, but no stats frame has arrived yet.
    pub(crate) fn without_stats(mut self) -> Self {
        self.reported = false;
        self
    }

    pub(crate) fn loaded(mut self, system_load: f64) -> Self {
        self.system_load = system_load;
        self
    }

    pub(crate) fn at_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub(crate) fn in_regions(mut self, regions: &[&str]) -> Self {
        self.regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub(crate) fn with_rest(mut self, rest: impl CommandChannel + 'static) -> Self {
        self.rest = Arc::new(rest);
        self
    }

    pub(crate) fn recording(mut self, recorder: &Arc<RecordingChannel>) -> Self {
        self.rest = Arc::clone(recorder) as Arc<dyn CommandChannel>;
        self
    }

    pub(crate) fn resuming(mut self, key: Option<&str>) -> Self {
        self.resume_key = Some(key.map(str::to_string));
        self
    }

    pub(crate) fn retries(mut self, tries: u32, timeout: Duration) -> Self {
        self.retries = Some((tries, timeout));
        self
    }
}

/// Initialized manager over fake nodes, returned in the order given.
pub(crate) async fn fake_manager(nodes: Vec<FakeNode>) -> (Manager, Vec<Arc<Node>>) {
    fake_manager_with(nodes, Arc::new(RecordingGateway::default())).await
}

pub(crate) async fn fake_manager_with(
    nodes: Vec<FakeNode>,
    gateway: Arc<RecordingGateway>,
) -> (Manager, Vec<Arc<Node>>) {
    let manager = Manager::new(Config::default(), USER_ID, gateway);
    let mut built = Vec::new();

    for fake in nodes {
        let mut options = NodeOptions::from_config(manager.config(), USER_ID);
        if let Some(key) = fake.resume_key {
            options.resume = true;
            options.resume_key = key;
        }
        if let Some((tries, timeout)) = fake.retries {
            options.reconnect_tries = tries;
            options.reconnect_timeout = timeout;
        }

        let descriptor = NodeDescriptor::new(&fake.name, "127.0.0.1", fake.port, "youshallnotpass")
            .with_regions(fake.regions);
        let node = Arc::new(Node::new(
            descriptor,
            options,
            fake.rest,
            manager.downgrade(),
            manager.events_sender(),
        ));
        if fake.connected {
            node.mark_connected(
                &format!("session-{}", fake.name),
                fake.reported
                    .then(|| stats(fake.players, fake.system_load, 0, 0)),
            );
            node.mark_established();
        }

        manager.insert_node(Arc::clone(&node));
        built.push(node);
    }

    manager.mark_initialized();
    (manager, built)
}

/// Everything published so far, without waiting.
pub(crate) fn drain(events: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
