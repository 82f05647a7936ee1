use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errores de la capa de nodos y reproducción.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("the manager has not been initialized, call `Manager::init` first")]
    NotInitialized,

    #[error("there aren't any connected nodes available")]
    NoNodesAvailable,

    #[error("couldn't find a node named `{0}`")]
    NodeNotFound(String),

    #[error("node `{0}` is not connected")]
    NodeUnavailable(String),

    #[error("node `{0}` has not announced a session yet")]
    SessionNotReady(String),

    #[error("volume must be between 0 and 100, got {0}")]
    InvalidVolume(i32),

    #[error("unknown loop mode `{0}`, expected none, track or queue")]
    InvalidLoopMode(String),

    #[error("voice server update carried an empty endpoint")]
    EmptyEndpoint,

    #[error("no track is currently playing")]
    NothingPlaying,

    #[error("track `{0}` is not seekable")]
    NotSeekable(String),

    #[error("couldn't resolve a playable track for `{0}`")]
    TrackNotResolved(String),

    #[error("player for guild {0} has been destroyed")]
    PlayerDestroyed(String),

    #[error("node `{node}` answered {status}: {message}")]
    Rest {
        node: String,
        status: u16,
        message: String,
    },

    #[error("request to node `{0}` timed out")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Broad classes used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed options, reported to the caller that introduced them.
    Configuration,
    /// Network hiccups, recovered locally or surfaced as notifications.
    Transient,
    /// No connected node can take the request.
    Capacity,
    /// A single session's track misbehaved.
    Playback,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::NotInitialized
            | Error::InvalidVolume(_)
            | Error::InvalidLoopMode(_)
            | Error::EmptyEndpoint
            | Error::NodeNotFound(_)
            | Error::PlayerDestroyed(_) => ErrorKind::Configuration,
            Error::NoNodesAvailable | Error::NodeUnavailable(_) => ErrorKind::Capacity,
            Error::NothingPlaying | Error::NotSeekable(_) | Error::TrackNotResolved(_) => {
                ErrorKind::Playback
            }
            Error::SessionNotReady(_)
            | Error::Rest { .. }
            | Error::Timeout(_)
            | Error::Http(_)
            | Error::WebSocket(_)
            | Error::Json(_) => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::InvalidVolume(150).kind(), ErrorKind::Configuration);
        assert_eq!(Error::NoNodesAvailable.kind(), ErrorKind::Capacity);
        assert_eq!(Error::NothingPlaying.kind(), ErrorKind::Playback);
        assert!(Error::Timeout("main".into()).is_transient());
        assert!(!Error::EmptyEndpoint.is_transient());
    }
}
