//! # Sources
//!
//! Track model shared by the queue, the players and the node REST surface.
//!
//! A [`Track`] is what a node hands back from `/v4/loadtracks`: an opaque
//! `encoded` payload that only the node understands, plus descriptive
//! [`TrackInfo`]. Tracks that come from somewhere else (another backend, a
//! playlist import) may carry info without a payload; those are re-resolved
//! against the node right before they are played, see [`Track::resolve`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Tolerance used when matching a replacement track by duration.
const DURATION_TOLERANCE_MS: u64 = 2_000;

/// Search prefixes understood by the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    #[default]
    Deezer,
    Spotify,
    SoundCloud,
    YouTube,
    YouTubeMusic,
}

impl SearchSource {
    pub fn prefix(&self) -> &'static str {
        match self {
            SearchSource::Deezer => "dzsearch",
            SearchSource::Spotify => "spsearch",
            SearchSource::SoundCloud => "scsearch",
            SearchSource::YouTube => "ytsearch",
            SearchSource::YouTubeMusic => "ytmsearch",
        }
    }

    /// Construye el identificador para `/v4/loadtracks`.
    ///
    /// URLs are passed through untouched, anything else becomes a search.
    pub fn identifier_for(&self, query: &str) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}:{}", self.prefix(), query)
        }
    }
}

impl FromStr for SearchSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dzsearch" | "deezer" => Ok(SearchSource::Deezer),
            "spsearch" | "spotify" => Ok(SearchSource::Spotify),
            "scsearch" | "soundcloud" => Ok(SearchSource::SoundCloud),
            "ytsearch" | "youtube" => Ok(SearchSource::YouTube),
            "ytmsearch" | "youtubemusic" => Ok(SearchSource::YouTubeMusic),
            other => Err(Error::Configuration(format!(
                "unknown search source `{}`",
                other
            ))),
        }
    }
}

/// Información descriptiva de un track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Length in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Track as returned by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackData {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default, rename = "pluginInfo")]
    pub plugin_info: Value,
}

/// Un track listo para la cola.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    encoded: Option<String>,
    info: TrackInfo,
    requester: Option<Value>,
}

impl Track {
    pub fn new(data: TrackData, requester: Option<Value>) -> Self {
        Self {
            encoded: Some(data.encoded),
            info: data.info,
            requester,
        }
    }

    /// Track known only by its metadata; it is resolved before playback.
    pub fn unresolved(info: TrackInfo, requester: Option<Value>) -> Self {
        Self {
            encoded: None,
            info,
            requester,
        }
    }

    pub fn encoded(&self) -> Option<&str> {
        self.encoded.as_deref()
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn author(&self) -> &str {
        &self.info.author
    }

    pub fn length(&self) -> u64 {
        self.info.length
    }

    pub fn requester(&self) -> Option<&Value> {
        self.requester.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.encoded.is_some()
    }

    /// Query used to find this track again on a node.
    pub fn search_query(&self) -> String {
        [self.info.author.as_str(), self.info.title.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" - ")
    }

    /// Replaces the payload with the best candidate returned by `resolver`.
    ///
    /// Candidates are ranked as: exact author or title match (ignoring
    /// case), then a track whose length is within two seconds of ours, then
    /// whatever the node ranked first.
    pub async fn resolve(&mut self, resolver: &dyn TrackResolver) -> Result<()> {
        let query = self.search_query();
        let candidates = resolver.search(&query).await?;

        let Some((best, by_name)) = self.best_match(&candidates) else {
            warn!("No replacement found for `{}`", query);
            return Err(Error::TrackNotResolved(query));
        };

        debug!(
            "Resolved `{}` to {} ({})",
            query, best.info.identifier, best.info.source_name
        );

        self.encoded = best.encoded.clone();
        self.info.identifier = best.info.identifier.clone();
        self.info.artwork_url = best.info.artwork_url.clone();
        // Same recording under another backend, trust its length.
        if by_name {
            self.info.length = best.info.length;
        }
        Ok(())
    }

    /// Returns the chosen candidate and whether it matched by name.
    fn best_match<'a>(&self, candidates: &'a [Track]) -> Option<(&'a Track, bool)> {
        let resolved = || candidates.iter().filter(|t| t.is_resolved());
        let author = self.info.author.to_lowercase();
        let title = self.info.title.to_lowercase();

        let same_name = resolved().find(|candidate| {
            (!author.is_empty() && candidate.info.author.to_lowercase() == author)
                || (!title.is_empty() && candidate.info.title.to_lowercase() == title)
        });
        if let Some(found) = same_name {
            return Some((found, true));
        }

        resolved()
            .find(|candidate| {
                candidate.info.length + DURATION_TOLERANCE_MS >= self.info.length
                    && candidate.info.length <= self.info.length + DURATION_TOLERANCE_MS
            })
            .or_else(|| resolved().next())
            .map(|found| (found, false))
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.info.author, self.info.title)
    }
}

/// Anything able to turn a free-text query into playable tracks.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Track>>;
}

/// Load types reported by `/v4/loadtracks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default)]
    pub selected_track: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadException {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: LoadType,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawPlaylist {
    info: PlaylistInfo,
    tracks: Vec<TrackData>,
}

/// Resultado de una búsqueda ya mapeado a [`Track`].
#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub load_type: LoadType,
    pub tracks: Vec<Track>,
    pub playlist: Option<PlaylistInfo>,
    pub exception: Option<LoadException>,
}

impl ResolveResult {
    /// Maps a raw `/v4/loadtracks` body, tagging every track with `requester`.
    pub fn from_response(body: Value, requester: Option<Value>) -> Result<Self> {
        let raw: RawLoadResult = serde_json::from_value(body)?;
        let mut result = ResolveResult {
            load_type: raw.load_type,
            tracks: Vec::new(),
            playlist: None,
            exception: None,
        };

        match raw.load_type {
            LoadType::Track => {
                let data: TrackData = serde_json::from_value(raw.data)?;
                result.tracks.push(Track::new(data, requester));
            }
            LoadType::Playlist => {
                let playlist: RawPlaylist = serde_json::from_value(raw.data)?;
                result.tracks = playlist
                    .tracks
                    .into_iter()
                    .map(|data| Track::new(data, requester.clone()))
                    .collect();
                result.playlist = Some(playlist.info);
            }
            LoadType::Search => {
                let found: Vec<TrackData> = serde_json::from_value(raw.data)?;
                result.tracks = found
                    .into_iter()
                    .map(|data| Track::new(data, requester.clone()))
                    .collect();
            }
            LoadType::Error => {
                result.exception = serde_json::from_value(raw.data).ok();
            }
            LoadType::Empty => {}
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn info(title: &str, author: &str, length: u64) -> TrackInfo {
        TrackInfo {
            identifier: format!("id-{}", title),
            is_seekable: true,
            author: author.to_string(),
            length,
            is_stream: false,
            position: 0,
            title: title.to_string(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "deezer".to_string(),
        }
    }

    pub(crate) fn track(title: &str) -> Track {
        Track::new(
            TrackData {
                encoded: format!("enc-{}", title),
                info: info(title, "artist", 180_000),
                plugin_info: Value::Null,
            },
            None,
        )
    }

    struct FixedResolver(Vec<Track>);

    #[async_trait]
    impl TrackResolver for FixedResolver {
        async fn search(&self, _query: &str) -> Result<Vec<Track>> {
            Ok(self.0.clone())
        }
    }

    fn candidate(title: &str, author: &str, length: u64) -> Track {
        Track::new(
            TrackData {
                encoded: format!("enc-{}-{}", author, title),
                info: info(title, author, length),
                plugin_info: Value::Null,
            },
            None,
        )
    }

    #[test]
    fn test_identifier_for_urls_and_queries() {
        assert_eq!(
            SearchSource::Deezer.identifier_for("never gonna"),
            "dzsearch:never gonna"
        );
        assert_eq!(
            SearchSource::SoundCloud.identifier_for("https://soundcloud.com/x"),
            "https://soundcloud.com/x"
        );
        assert!("bandcamp".parse::<SearchSource>().is_err());
        assert_eq!("spsearch".parse::<SearchSource>().unwrap(), SearchSource::Spotify);
    }

    #[tokio::test]
    async fn test_resolve_prefers_exact_author() {
        let mut track = Track::unresolved(info("Song", "Band", 200_000), None);
        let resolver = FixedResolver(vec![
            candidate("Song (cover)", "Someone", 200_500),
            candidate("Song (live)", "band", 320_000),
        ]);

        track.resolve(&resolver).await.unwrap();

        assert_eq!(track.encoded(), Some("enc-band-Song (live)"));
        assert_eq!(track.length(), 320_000);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_duration_then_first() {
        let mut track = Track::unresolved(info("Song", "Band", 200_000), None);
        let resolver = FixedResolver(vec![
            candidate("Other", "Else", 90_000),
            candidate("Another", "Else", 201_500),
        ]);
        track.resolve(&resolver).await.unwrap();
        assert_eq!(track.encoded(), Some("enc-Else-Another"));

        let mut track = Track::unresolved(info("Song", "Band", 200_000), None);
        let resolver = FixedResolver(vec![candidate("Other", "Else", 90_000)]);
        track.resolve(&resolver).await.unwrap();
        assert_eq!(track.encoded(), Some("enc-Else-Other"));
        assert_eq!(track.length(), 200_000);
    }

    #[tokio::test]
    async fn test_resolve_without_candidates_fails() {
        let mut track = Track::unresolved(info("Song", "Band", 200_000), None);
        let err = track.resolve(&FixedResolver(Vec::new())).await.unwrap_err();
        assert!(matches!(err, Error::TrackNotResolved(q) if q == "Band - Song"));
        assert!(!track.is_resolved());
    }

    #[test]
    fn test_load_result_mapping() {
        let body = json!({
            "loadType": "playlist",
            "data": {
                "info": { "name": "Mix", "selectedTrack": -1 },
                "pluginInfo": {},
                "tracks": [
                    { "encoded": "QAAA1", "info": {
                        "identifier": "a", "isSeekable": true, "author": "A",
                        "length": 1000, "isStream": false, "position": 0,
                        "title": "One", "uri": null, "sourceName": "youtube" } },
                    { "encoded": "QAAA2", "info": {
                        "identifier": "b", "isSeekable": true, "author": "B",
                        "length": 2000, "isStream": false, "position": 0,
                        "title": "Two", "uri": null, "sourceName": "youtube" } }
                ]
            }
        });

        let result = ResolveResult::from_response(body, Some(json!("user-1"))).unwrap();
        assert_eq!(result.load_type, LoadType::Playlist);
        assert_eq!(result.tracks.len(), 2);
        assert_eq!(result.playlist.unwrap().name, "Mix");
        assert_eq!(result.tracks[1].requester(), Some(&json!("user-1")));

        let empty = ResolveResult::from_response(json!({"loadType": "empty", "data": {}}), None)
            .unwrap();
        assert!(empty.tracks.is_empty());

        let failed = ResolveResult::from_response(
            json!({"loadType": "error", "data": {"message": "boom", "severity": "common", "cause": "x"}}),
            None,
        )
        .unwrap();
        assert_eq!(failed.exception.unwrap().message.as_deref(), Some("boom"));
    }
}
