use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::message::PlayerState;
use crate::audio::effects::Filters;
use crate::error::{Error, Result};
use crate::sources::TrackData;

/// Control commands sent to a node.
///
/// Every call resolves to parsed JSON (or `Value::Null` for empty bodies)
/// or to an error; nothing panics past this boundary. Implementations must
/// bound how long a call may take.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value>;
    async fn patch(&self, path: &str, body: Value) -> Result<Value>;
    async fn post(&self, path: &str, body: Value) -> Result<Value>;
    async fn delete(&self, path: &str) -> Result<Value>;
}

/// Cliente REST de un nodo.
pub struct RestClient {
    http: Client,
    base_url: String,
    password: String,
    node: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RestClient {
    pub fn new(node: &str, base_url: &str, password: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            password: password.to_string(),
            node: node.to_string(),
            timeout,
        })
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {} -> {}", method, path, self.node);

        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", &self.password);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let text = response.text().await.map_err(|e| self.map_error(e))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|body| body.message.or(body.error))
                .unwrap_or(text);
            warn!("Node {} answered {} for {}: {}", self.node, status, path, message);
            return Err(Error::Rest {
                node: self.node.clone(),
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn map_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            warn!("Request to {} timed out after {:?}", self.node, self.timeout);
            Error::Timeout(self.node.clone())
        } else {
            Error::Http(err)
        }
    }
}

#[async_trait]
impl CommandChannel for RestClient {
    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }
}

/// Voice descriptor forwarded to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Cuerpo de `PATCH /v4/sessions/{session}/players/{guild}`.
///
/// Only the fields that are set are sent. `encoded_track: Some(None)`
/// serializes as `null`, which stops the current track.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdate>,
}

impl UpdatePlayer {
    pub fn play(encoded: impl Into<String>) -> Self {
        Self {
            encoded_track: Some(Some(encoded.into())),
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded_track: Some(None),
            ..Default::default()
        }
    }

    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }

    pub fn position(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn filters(filters: Filters) -> Self {
        Self {
            filters: Some(filters),
            ..Default::default()
        }
    }

    pub fn voice(voice: VoiceUpdate) -> Self {
        Self {
            voice: Some(voice),
            ..Default::default()
        }
    }
}

/// A player as the node reports it in `GET /v4/sessions/{session}/players`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<TrackData>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerState,
}

/// Body of `PATCH /v4/sessions/{session}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConfig {
    pub resuming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resuming_key: Option<String>,
    /// Seconds the node keeps the session alive after the socket drops.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(default)]
    pub pre_release: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub name: String,
    pub version: String,
}

/// Respuesta de `GET /v4/info`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: Version,
    pub build_time: u64,
    pub jvm: String,
    pub lavaplayer: String,
    #[serde(default)]
    pub source_managers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<SourceInfo>,
}
