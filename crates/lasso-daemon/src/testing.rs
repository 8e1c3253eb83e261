//! In-process doubles for exercising the daemon without Last.fm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lasso_core::{
    EngineConfig, PlayRecord, ScrobbleSink, ScrobbleSource, SessionEngine, SinkError, SourceError,
};

struct KnownUsers(Vec<String>);

#[async_trait]
impl ScrobbleSource for KnownUsers {
    async fn resolve_user(&self, username: &str) -> Result<(), SourceError> {
        if self.0.iter().any(|u| u == username) {
            Ok(())
        } else {
            Err(SourceError::UnknownUser(username.to_string()))
        }
    }

    async fn fetch_recent_plays(
        &self,
        _username: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<PlayRecord>, SourceError> {
        Ok(Vec::new())
    }
}

struct DiscardSink;

#[async_trait]
impl ScrobbleSink for DiscardSink {
    async fn submit_scrobble(
        &self,
        _title: &str,
        _artist: &str,
        _album: Option<&str>,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

pub fn engine_with_users(users: &[&str]) -> SessionEngine {
    let config = EngineConfig {
        poll_interval: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    };
    SessionEngine::new(
        Arc::new(KnownUsers(users.iter().map(|u| u.to_string()).collect())),
        Arc::new(DiscardSink),
        config,
    )
}
