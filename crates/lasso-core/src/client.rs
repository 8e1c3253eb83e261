//! Boundary contracts for the two external collaborators: where plays are
//! read from (the target's history) and where scrobbles are written to (the
//! follower's account).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lasso_proto::protocol::ErrorKind;
use thiserror::Error;

/// Case-normalized identity of a track: artist, title and album.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(artist: &str, title: &str, album: Option<&str>) -> Self {
        let key = [artist, title, album.unwrap_or("")]
            .iter()
            .map(|part| normalize(part))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.replace('\u{1f}', " / "))
    }
}

fn normalize(part: &str) -> String {
    part.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One play observed on the source.  `played_at` is `None` while the track
/// is still playing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRecord {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub played_at: Option<DateTime<Utc>>,
}

impl PlayRecord {
    pub fn played(
        artist: impl Into<String>,
        title: impl Into<String>,
        album: Option<String>,
        played_at: DateTime<Utc>,
    ) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            album,
            played_at: Some(played_at),
        }
    }

    pub fn now_playing(
        artist: impl Into<String>,
        title: impl Into<String>,
        album: Option<String>,
    ) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            album,
            played_at: None,
        }
    }

    pub fn track_id(&self) -> TrackId {
        TrackId::new(&self.artist, &self.title, self.album.as_deref())
    }

    pub fn is_now_playing(&self) -> bool {
        self.played_at.is_none()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("user {0:?} does not exist")]
    UnknownUser(String),
    #[error("rate limited by the source service")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::UnknownUser(_) => ErrorKind::UnknownUser,
            SourceError::RateLimited => ErrorKind::RateLimited,
            SourceError::Network(_) => ErrorKind::NetworkError,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    #[error("rate limited by the scrobble service")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    /// The service refused this particular scrobble; retrying will not help.
    #[error("scrobble rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Session-level classification.  `None` for a rejection, which only
    /// concerns the one scrobble.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SinkError::RateLimited => Some(ErrorKind::RateLimited),
            SinkError::Network(_) => Some(ErrorKind::NetworkError),
            SinkError::Unauthorized(_) => Some(ErrorKind::Unauthorized),
            SinkError::Rejected(_) => None,
        }
    }
}

/// Reads a user's listening history.
#[async_trait]
pub trait ScrobbleSource: Send + Sync {
    /// Succeeds when `username` names an existing account.
    async fn resolve_user(&self, username: &str) -> Result<(), SourceError>;

    /// Plays by `username` at or after `since`, in any order.  May include a
    /// now-playing entry.
    async fn fetch_recent_plays(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PlayRecord>, SourceError>;
}

/// Writes scrobbles for the authenticated follower.  Credentials live entirely
/// inside the implementation.
#[async_trait]
pub trait ScrobbleSink: Send + Sync {
    async fn submit_scrobble(
        &self,
        title: &str,
        artist: &str,
        album: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}
