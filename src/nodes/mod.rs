//! # Nodes
//!
//! One [`Node`] per audio backend. A node owns its control socket, keeps the
//! latest statistics the backend pushed and exposes the backend's REST
//! surface through a [`CommandChannel`](rest::CommandChannel).

pub mod message;
pub mod rest;
pub mod stats;

mod node;
mod socket;

pub use node::{Node, NodeOptions};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Identity and credentials of an audio node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    /// Voice regions this node serves, e.g. `rotterdam`.
    #[serde(default, alias = "region")]
    pub regions: Vec<String>,
}

fn default_password() -> String {
    "youshallnotpass".to_string()
}

impl NodeDescriptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            password: password.into(),
            secure: false,
            regions: Vec::new(),
        }
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Rejects descriptors no node could be reached with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("node name cannot be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "node `{}` has an empty host",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(Error::Configuration(format!(
                "node `{}` has port 0",
                self.name
            )));
        }
        Url::parse(&self.rest_url()).map_err(|e| {
            Error::Configuration(format!("node `{}` has an invalid address: {}", self.name, e))
        })?;
        Ok(())
    }

    pub(crate) fn normalized(mut self) -> Result<Self> {
        self.validate()?;
        self.regions = self
            .regions
            .iter()
            .map(|region| region.trim().to_lowercase())
            .filter(|region| !region.is_empty())
            .collect();
        Ok(self)
    }

    pub fn serves(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}
