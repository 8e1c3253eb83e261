//! Session lifecycle.
//!
//! [`SessionMachine`] owns the current [`Session`] and is the only place its
//! state changes.  Every transition goes through [`next_state`]; anything not
//! in that table is refused with [`EngineError::InvalidTransition`] and leaves
//! the session untouched.  The coordinator reads cycle context from here and
//! commits its results back, keyed by session id so a cycle that outlives
//! its session cannot write into a newer one.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lasso_proto::protocol::{ScrobbleEvent, SessionError, SessionSnapshot, SessionState};
use regex::Regex;
use tracing::{debug, info};

use crate::client::{PlayRecord, TrackId};
use crate::error::EngineError;
use crate::feed::ActivityFeed;
use crate::ledger::DedupLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Stop,
    CycleFailed { fatal: bool },
    CycleRecovered,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Stop => "stop",
            Transition::CycleFailed { .. } => "report an error on",
            Transition::CycleRecovered => "recover",
        }
    }
}

/// The full transition table.  `None` means the transition is illegal.
pub fn next_state(from: SessionState, op: Transition) -> Option<SessionState> {
    use SessionState::*;
    match (from, op) {
        (NotStarted | Stopped, Transition::Start) => Some(Active),
        (Active, Transition::Pause) => Some(Paused),
        (Paused, Transition::Resume) => Some(Active),
        (Active | Paused | Errored, Transition::Stop) => Some(Stopped),
        (Active | Errored, Transition::CycleFailed { .. }) => Some(Errored),
        // A transient error from a cycle that drained after pause keeps the
        // session paused; a fatal one does not.
        (Paused, Transition::CycleFailed { fatal: true }) => Some(Errored),
        (Paused, Transition::CycleFailed { fatal: false }) => Some(Paused),
        (Errored, Transition::CycleRecovered) => Some(Active),
        (Active | Paused, Transition::CycleRecovered) => Some(from),
        _ => None,
    }
}

/// How far before it was first seen a now-playing track may have started.
const NOW_PLAYING_WINDOW_SECS: i64 = 30 * 60;

fn now_playing_window() -> TimeDelta {
    TimeDelta::seconds(NOW_PLAYING_WINDOW_SECS)
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("username pattern is valid")
    })
}

/// Trim and check `raw` against the service's username rules: 2 to 15
/// characters, a leading letter, then letters, digits, `_` or `-`.
pub fn validate_username(raw: &str) -> Result<String, EngineError> {
    let username = raw.trim();
    let invalid = |reason| EngineError::InvalidUsername {
        username: username.to_string(),
        reason,
    };

    if username.is_empty() {
        return Err(invalid("must not be empty"));
    }
    let len = username.chars().count();
    if !(2..=15).contains(&len) {
        return Err(invalid("must be 2 to 15 characters"));
    }
    if !username_pattern().is_match(username) {
        return Err(invalid(
            "must start with a letter and contain only letters, digits, '_' or '-'",
        ));
    }
    Ok(username.to_string())
}

/// Sizing for the per-session ledger and feed.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub dedup_tolerance: Duration,
    pub dedup_capacity: usize,
    pub dedup_max_age: Duration,
    pub feed_capacity: usize,
}

/// Everything a session accumulates while it relays.  Dropped on stop.
#[derive(Debug, Clone)]
pub struct RelayState {
    pub ledger: DedupLedger,
    pub feed: ActivityFeed,
    /// Latest play timestamp through which the source has been processed.
    pub high_water: DateTime<Utc>,
    /// Tracks seen playing and not yet relayed, with when each was first
    /// seen.  Their finished play is stamped with its start time, which can
    /// be behind the high-water mark.
    pub in_progress: Vec<(TrackId, DateTime<Utc>)>,
    pub scrobble_count: u64,
}

impl RelayState {
    /// The in-progress entry a finished play at `played_at` completes.
    fn completes(&self, id: &TrackId, played_at: DateTime<Utc>) -> Option<usize> {
        self.in_progress.iter().position(|(seen_id, seen_at)| {
            seen_id == id && played_at >= *seen_at - now_playing_window()
        })
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    target_username: String,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_transition_at: DateTime<Utc>,
    error: Option<SessionError>,
    relay: Option<RelayState>,
}

impl Session {
    fn new(target_username: String, settings: &RelaySettings, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            target_username,
            state: SessionState::Active,
            created_at: now,
            last_transition_at: now,
            error: None,
            relay: Some(RelayState {
                ledger: DedupLedger::new(
                    settings.dedup_tolerance,
                    settings.dedup_capacity,
                    settings.dedup_max_age,
                ),
                feed: ActivityFeed::new(settings.feed_capacity),
                high_water: now,
                in_progress: Vec::new(),
                scrobble_count: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_username(&self) -> &str {
        &self.target_username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn relay(&self) -> Option<&RelayState> {
        self.relay.as_ref()
    }

    fn set_state(&mut self, to: SessionState, now: DateTime<Utc>) {
        if self.state != to {
            info!(
                "session {} ({}): {} -> {}",
                self.id, self.target_username, self.state, to
            );
            self.state = to;
            self.last_transition_at = now;
        }
    }
}

/// Inputs for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleContext {
    pub target_username: String,
    pub since: DateTime<Utc>,
}

/// Whether the coordinator may run a cycle right now.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleStart {
    Run(CycleContext),
    /// Paused: wait for resume.
    Hold,
    /// The session is gone, stopped or fatally errored.
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Relayed,
    /// Refused by the sink for good; remembered so it is not retried.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The session this cycle belonged to no longer exists.
    Stale,
    Recorded,
    Relayed(ScrobbleEvent),
}

#[derive(Debug)]
pub struct SessionMachine {
    session: Option<Session>,
    rev: u64,
    settings: RelaySettings,
}

impl SessionMachine {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            session: None,
            rev: 1,
            settings,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::NotStarted)
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn ensure_can(&self, op: Transition) -> Result<SessionState, EngineError> {
        let from = self.state();
        next_state(from, op).ok_or(EngineError::InvalidTransition {
            from,
            op: op.name(),
        })
    }

    /// Replace any previous session with a fresh one for `username` and make
    /// it active.  Returns the new session id.
    pub fn start(&mut self, username: String, now: DateTime<Utc>) -> Result<String, EngineError> {
        self.ensure_can(Transition::Start)?;
        let session = Session::new(username, &self.settings, now);
        let id = session.id.clone();
        info!(
            "session {} started following {}",
            session.id, session.target_username
        );
        self.session = Some(session);
        self.rev += 1;
        Ok(id)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.apply(Transition::Pause, now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.apply(Transition::Resume, now)
    }

    /// Stop the session and discard its ledger and feed.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.apply(Transition::Stop, now)?;
        if let Some(session) = self.session.as_mut() {
            session.relay = None;
            session.error = None;
        }
        Ok(())
    }

    fn apply(&mut self, op: Transition, now: DateTime<Utc>) -> Result<(), EngineError> {
        let to = self.ensure_can(op)?;
        let from = self.state();
        let session = self
            .session
            .as_mut()
            .ok_or(EngineError::InvalidTransition {
                from,
                op: op.name(),
            })?;
        session.set_state(to, now);
        self.rev += 1;
        Ok(())
    }

    fn live_session_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|s| s.id == session_id && s.relay.is_some())
    }

    fn live_session(&self, session_id: &str) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|s| s.id == session_id && s.relay.is_some())
    }

    /// Attach a cycle failure to the session.  Returns false when the
    /// session is gone or the error was not applied.
    pub fn report_cycle_error(
        &mut self,
        session_id: &str,
        error: SessionError,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(session) = self.live_session_mut(session_id) else {
            return false;
        };
        if session
            .error
            .as_ref()
            .is_some_and(|e| e.kind.is_fatal_to_session())
        {
            return false;
        }
        let fatal = error.kind.is_fatal_to_session();
        let Some(to) = next_state(session.state, Transition::CycleFailed { fatal }) else {
            return false;
        };
        session.error = Some(error);
        session.set_state(to, now);
        self.rev += 1;
        true
    }

    /// Clear a transient error after a good cycle.  Fatal errors stay until
    /// the session is stopped.
    pub fn report_cycle_recovered(&mut self, session_id: &str, now: DateTime<Utc>) -> bool {
        let Some(session) = self.live_session_mut(session_id) else {
            return false;
        };
        match &session.error {
            None => return false,
            Some(e) if e.kind.is_fatal_to_session() => return false,
            Some(_) => {}
        }
        let Some(to) = next_state(session.state, Transition::CycleRecovered) else {
            return false;
        };
        session.error = None;
        session.set_state(to, now);
        self.rev += 1;
        true
    }

    pub fn cycle_start(&self, session_id: &str) -> CycleStart {
        let Some(session) = self.live_session(session_id) else {
            return CycleStart::Halt;
        };
        if session
            .error
            .as_ref()
            .is_some_and(|e| e.kind.is_fatal_to_session())
        {
            return CycleStart::Halt;
        }
        if session.state == SessionState::Paused {
            return CycleStart::Hold;
        }
        match &session.relay {
            Some(relay) => {
                // Reach back far enough to see in-progress tracks finish.
                let since = relay
                    .in_progress
                    .iter()
                    .map(|(_, seen_at)| *seen_at - now_playing_window())
                    .fold(relay.high_water, |since, t| since.min(t));
                CycleStart::Run(CycleContext {
                    target_username: session.target_username.clone(),
                    since,
                })
            }
            None => CycleStart::Halt,
        }
    }

    /// Remember tracks the target is playing right now, and forget ones
    /// that never finished within the window.
    pub fn observe_now_playing(
        &mut self,
        session_id: &str,
        plays: &[PlayRecord],
        now: DateTime<Utc>,
    ) {
        let Some(relay) = self
            .live_session_mut(session_id)
            .and_then(|s| s.relay.as_mut())
        else {
            return;
        };
        relay
            .in_progress
            .retain(|(_, seen_at)| now - *seen_at <= now_playing_window());
        for play in plays.iter().filter(|p| p.is_now_playing()) {
            let id = play.track_id();
            if !relay.in_progress.iter().any(|(seen_id, _)| *seen_id == id) {
                debug!("now playing: {}", id);
                relay.in_progress.push((id, now));
            }
        }
    }

    /// Reduce a fetched batch to the plays that still need relaying, oldest
    /// first: resolved plays only, nothing the ledger has seen, nothing
    /// duplicated within the batch, nothing behind the high-water mark
    /// unless it finishes a track seen playing.
    pub fn pending_plays(&self, session_id: &str, plays: Vec<PlayRecord>) -> Vec<PlayRecord> {
        let Some(relay) = self.live_session(session_id).and_then(|s| s.relay.as_ref()) else {
            return Vec::new();
        };
        let tolerance = relay.ledger.tolerance();
        let floor = relay.high_water.checked_sub_signed(tolerance);

        let mut resolved: Vec<(DateTime<Utc>, PlayRecord)> = plays
            .into_iter()
            .filter_map(|p| p.played_at.map(|t| (t, p)))
            .collect();
        resolved.sort_by_key(|(t, _)| *t);

        // Only the newest play of an in-progress track may come from behind
        // the floor.
        let mut finishing: Vec<(TrackId, DateTime<Utc>)> = Vec::new();
        for (played_at, play) in resolved.iter().rev() {
            let id = play.track_id();
            if relay.completes(&id, *played_at).is_some()
                && !finishing.iter().any(|(f, _)| *f == id)
            {
                finishing.push((id, *played_at));
            }
        }

        let mut batch: Vec<(TrackId, DateTime<Utc>)> = Vec::new();
        let mut pending = Vec::new();
        for (played_at, play) in resolved {
            let id = play.track_id();
            let above_floor = floor.map_or(true, |floor| played_at >= floor);
            if !above_floor && !finishing.iter().any(|(f, t)| *f == id && *t == played_at) {
                continue;
            }
            if relay.ledger.seen(&id, played_at) {
                continue;
            }
            if batch
                .iter()
                .any(|(b, t)| *b == id && (*t - played_at).abs() < tolerance)
            {
                continue;
            }
            batch.push((id, played_at));
            pending.push(play);
        }
        pending
    }

    /// Record the outcome of one submission.  The ledger entry, feed append
    /// and high-water advance happen together or not at all.
    pub fn commit(
        &mut self,
        session_id: &str,
        play: &PlayRecord,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> CommitOutcome {
        let Some(played_at) = play.played_at else {
            return CommitOutcome::Stale;
        };
        let Some(relay) = self
            .live_session_mut(session_id)
            .and_then(|s| s.relay.as_mut())
        else {
            return CommitOutcome::Stale;
        };

        let track_id = play.track_id();
        if let Some(index) = relay.completes(&track_id, played_at) {
            relay.in_progress.remove(index);
        }
        relay.ledger.record(track_id.clone(), played_at);
        if played_at > relay.high_water {
            relay.high_water = played_at;
        }
        relay.ledger.evict(relay.high_water);

        let outcome = match disposition {
            Disposition::Rejected => CommitOutcome::Recorded,
            Disposition::Relayed => {
                let event = ScrobbleEvent {
                    track_id: track_id.to_string(),
                    artist: play.artist.clone(),
                    title: play.title.clone(),
                    album: play.album.clone(),
                    played_at,
                    scrobbled_at: now,
                };
                relay.feed.push(event.clone());
                relay.scrobble_count += 1;
                CommitOutcome::Relayed(event)
            }
        };
        self.rev += 1;
        outcome
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let Some(session) = &self.session else {
            return SessionSnapshot {
                rev: self.rev,
                ..Default::default()
            };
        };
        SessionSnapshot {
            rev: self.rev,
            session_id: Some(session.id.clone()),
            state: session.state,
            target_username: Some(session.target_username.clone()),
            error: session.error.clone(),
            feed: session.relay.as_ref().map(|r| r.feed.snapshot()),
            scrobble_count: session.relay.as_ref().map_or(0, |r| r.scrobble_count),
            created_at: Some(session.created_at),
            last_transition_at: Some(session.last_transition_at),
        }
    }
}
