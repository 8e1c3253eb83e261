//! SessionEngine: the command surface the UI talks to.
//!
//! The engine owns one [`SessionMachine`] behind a `RwLock` and at most one
//! poll worker task.  Commands transition the machine synchronously and then
//! signal the worker; the worker never blocks a command for longer than one
//! lock acquisition.  Every change bumps the snapshot `rev` and is announced
//! on a `broadcast` channel so front-ends can push or re-fetch state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lasso_proto::config::Config;
use lasso_proto::protocol::{ScrobbleEvent, SessionError, SessionSnapshot, SessionState};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ScrobbleSink, ScrobbleSource};
use crate::error::EngineError;
use crate::poller;
use crate::session::{validate_username, RelaySettings, SessionMachine, Transition};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Bound on every fetch, submit and user lookup.
    pub request_timeout: Duration,
    pub dedup_tolerance: Duration,
    pub dedup_capacity: usize,
    pub dedup_max_age: Duration,
    pub feed_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll.interval_secs.max(1)),
            request_timeout: Duration::from_secs(config.poll.request_timeout_secs.max(1)),
            dedup_tolerance: Duration::from_secs(config.dedup.tolerance_secs),
            dedup_capacity: config.dedup.capacity,
            dedup_max_age: Duration::from_secs(config.dedup.max_age_mins.saturating_mul(60)),
            feed_capacity: config.feed.capacity,
        }
    }
}

impl EngineConfig {
    fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            dedup_tolerance: self.dedup_tolerance,
            dedup_capacity: self.dedup_capacity,
            dedup_max_age: self.dedup_max_age,
            feed_capacity: self.feed_capacity,
        }
    }
}

/// Notifications for front-ends.  Fetch [`SessionEngine::snapshot`] for the
/// full picture.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged { rev: u64, state: SessionState },
    Scrobbled(ScrobbleEvent),
    CycleError(SessionError),
}

/// State shared between the engine handle and its poll worker.
pub(crate) struct Shared {
    pub(crate) machine: RwLock<SessionMachine>,
    pub(crate) source: Arc<dyn ScrobbleSource>,
    pub(crate) sink: Arc<dyn ScrobbleSink>,
    pub(crate) config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    /// Announce the machine's current state.  Call with the write guard still
    /// held so announcements stay in `rev` order.
    pub(crate) fn publish(&self, machine: &SessionMachine) {
        let state = machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        // No receivers is fine.
        let _ = self.events.send(EngineEvent::StateChanged {
            rev: machine.rev(),
            state,
        });
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

struct PollWorker {
    session_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollWorker {
    /// Cancel and wait for the loop to drain its in-flight request.
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("poll worker for session {} ended abnormally: {}", self.session_id, e);
        }
    }
}

pub struct SessionEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<PollWorker>>,
}

impl SessionEngine {
    pub fn new(
        source: Arc<dyn ScrobbleSource>,
        sink: Arc<dyn ScrobbleSink>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(SessionState::NotStarted);
        let machine = SessionMachine::new(config.relay_settings());
        Self {
            shared: Arc::new(Shared {
                machine: RwLock::new(machine),
                source,
                sink,
                config,
                events,
                state_tx,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.shared.machine.read().await.snapshot()
    }

    pub async fn state(&self) -> SessionState {
        self.shared.machine.read().await.state()
    }

    /// Validate `username`, confirm the account exists, then begin a fresh
    /// session and its poll loop.  Any earlier loop is fully stopped first.
    pub async fn start(&self, username: &str) -> Result<SessionSnapshot, EngineError> {
        // Held for the whole call: starts are serialized.
        let mut worker = self.worker.lock().await;

        let checked = self
            .shared
            .machine
            .read()
            .await
            .ensure_can(Transition::Start);
        if let Err(e) = checked {
            warn!("start refused: {}", e);
            return Err(e);
        }

        let username = validate_username(username).inspect_err(|e| warn!("start refused: {}", e))?;

        let lookup = tokio::time::timeout(
            self.shared.config.request_timeout,
            self.shared.source.resolve_user(&username),
        )
        .await;
        match lookup {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("start refused: lookup of {} failed: {}", username, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("start refused: lookup of {} timed out", username);
                return Err(EngineError::LookupTimeout);
            }
        }

        if let Some(previous) = worker.take() {
            previous.shutdown().await;
        }

        let (session_id, snapshot) = {
            let mut machine = self.shared.machine.write().await;
            let id = machine.start(username, Utc::now())?;
            self.shared.publish(&machine);
            (id, machine.snapshot())
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller::run(
            Arc::clone(&self.shared),
            session_id.clone(),
            cancel.clone(),
        ));
        *worker = Some(PollWorker {
            session_id,
            cancel,
            handle,
        });
        Ok(snapshot)
    }

    /// Stop scheduling cycles.  A cycle already running finishes and its
    /// results are kept.
    pub async fn pause(&self) -> Result<SessionSnapshot, EngineError> {
        self.transition(|m, now| m.pause(now)).await
    }

    /// Resume polling with the ledger and high-water mark intact.  A cycle
    /// runs immediately.
    pub async fn resume(&self) -> Result<SessionSnapshot, EngineError> {
        self.transition(|m, now| m.resume(now)).await
    }

    /// End the session and discard its ledger and feed.  A cycle in flight is
    /// allowed to drain; whatever it produces afterwards is dropped.
    pub async fn stop(&self) -> Result<SessionSnapshot, EngineError> {
        let snapshot = self.transition(|m, now| m.stop(now)).await?;
        if let Some(worker) = self.worker.lock().await.as_ref() {
            worker.cancel.cancel();
        }
        Ok(snapshot)
    }

    /// Stop any live session and wait for its poll loop to exit.
    pub async fn shutdown(&self) {
        if self.state().await.is_live() {
            let _ = self.stop().await;
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown().await;
        }
        info!("session engine shut down");
    }

    async fn transition(
        &self,
        op: impl FnOnce(&mut SessionMachine, DateTime<Utc>) -> Result<(), EngineError>,
    ) -> Result<SessionSnapshot, EngineError> {
        let mut machine = self.shared.machine.write().await;
        if let Err(e) = op(&mut machine, Utc::now()) {
            warn!("command refused: {}", e);
            return Err(e);
        }
        self.shared.publish(&machine);
        Ok(machine.snapshot())
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().as_ref() {
            worker.cancel.cancel();
        }
    }
}
