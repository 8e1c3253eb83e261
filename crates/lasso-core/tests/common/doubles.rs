#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lasso_core::{
    EngineConfig, PlayRecord, ScrobbleSink, ScrobbleSource, SessionEngine, SinkError, SourceError,
};
use lasso_proto::protocol::SessionSnapshot;

pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        dedup_tolerance: Duration::from_secs(60),
        dedup_capacity: 100,
        dedup_max_age: Duration::from_secs(2 * 3600),
        feed_capacity: 50,
    }
}

pub fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    base + TimeDelta::seconds(secs)
}

pub fn play(title: &str, played_at: DateTime<Utc>) -> PlayRecord {
    PlayRecord::played("Artist", title, None, played_at)
}

#[derive(Default)]
struct SourceScript {
    known_users: Vec<String>,
    history: Vec<PlayRecord>,
    failures: VecDeque<SourceError>,
    stall_next: bool,
    fetches: Vec<DateTime<Utc>>,
    lookups: usize,
}

/// Source double.  Every fetch returns the whole history newest first,
/// unless a failure is queued.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<SourceScript>,
}

impl ScriptedSource {
    pub fn with_users(users: &[&str]) -> Arc<Self> {
        let source = Self::default();
        source.script.lock().unwrap().known_users = users.iter().map(|u| u.to_string()).collect();
        Arc::new(source)
    }

    pub fn push_play(&self, play: PlayRecord) {
        self.script.lock().unwrap().history.push(play);
    }

    pub fn replace_history(&self, plays: Vec<PlayRecord>) {
        self.script.lock().unwrap().history = plays;
    }

    pub fn fail_next(&self, error: SourceError) {
        self.script.lock().unwrap().failures.push_back(error);
    }

    /// The next fetch never answers.
    pub fn stall_next(&self) {
        self.script.lock().unwrap().stall_next = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.script.lock().unwrap().fetches.len()
    }

    pub fn fetch_sinces(&self) -> Vec<DateTime<Utc>> {
        self.script.lock().unwrap().fetches.clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.script.lock().unwrap().lookups
    }
}

#[async_trait]
impl ScrobbleSource for ScriptedSource {
    async fn resolve_user(&self, username: &str) -> Result<(), SourceError> {
        let mut script = self.script.lock().unwrap();
        script.lookups += 1;
        if script.known_users.iter().any(|u| u == username) {
            Ok(())
        } else {
            Err(SourceError::UnknownUser(username.to_string()))
        }
    }

    async fn fetch_recent_plays(
        &self,
        _username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PlayRecord>, SourceError> {
        let stall = {
            let mut script = self.script.lock().unwrap();
            script.fetches.push(since);
            std::mem::take(&mut script.stall_next)
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(error) = script.failures.pop_front() {
            return Err(error);
        }
        let mut plays = script.history.clone();
        plays.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        Ok(plays)
    }
}

#[derive(Default)]
struct SinkScript {
    outcomes: VecDeque<Result<(), SinkError>>,
    hold_next: Option<Duration>,
    attempts: Vec<String>,
    accepted: Vec<(String, DateTime<Utc>)>,
}

/// Sink double.  Outcomes are consumed one per submission; once the queue
/// is empty every submission succeeds.
#[derive(Default)]
pub struct RecordingSink {
    script: Mutex<SinkScript>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, outcomes: Vec<Result<(), SinkError>>) {
        self.script.lock().unwrap().outcomes.extend(outcomes);
    }

    /// The next submission takes `delay` to answer.
    pub fn hold_next(&self, delay: Duration) {
        self.script.lock().unwrap().hold_next = Some(delay);
    }

    pub fn accepted_titles(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .accepted
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn attempts(&self) -> Vec<String> {
        self.script.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl ScrobbleSink for RecordingSink {
    async fn submit_scrobble(
        &self,
        title: &str,
        _artist: &str,
        _album: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let hold = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(title.to_string());
            script.hold_next.take()
        };
        if let Some(delay) = hold {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        let outcome = script.outcomes.pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            script.accepted.push((title.to_string(), timestamp));
        }
        outcome
    }
}

pub fn engine(source: &Arc<ScriptedSource>, sink: &Arc<RecordingSink>) -> SessionEngine {
    SessionEngine::new(source.clone(), sink.clone(), test_config())
}

/// Poll the engine until `pred` holds.  Panics after about 100s of
/// (virtual) time.
pub async fn wait_for(
    engine: &SessionEngine,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..2000 {
        let snapshot = engine.snapshot().await;
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}: {:?}", engine.snapshot().await);
}

pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn feed_titles(snapshot: &SessionSnapshot) -> Vec<String> {
    snapshot
        .feed
        .as_ref()
        .map(|f| f.iter().map(|e| e.title.clone()).collect())
        .unwrap_or_default()
}
