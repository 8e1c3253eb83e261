use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame payload a peer may announce.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Messages sent from a client (the web UI bridge, scripts) to the daemon.
/// Each maps 1:1 onto a session engine command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Start { username: String },
    Pause,
    Resume,
    Stop,
    GetState,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::GetState => "get-state",
        }
    }
}

/// Messages pushed from the daemon to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: SessionSnapshot,
    },
    State {
        data: SessionSnapshot,
    },
    /// A command was refused.  State is unchanged.
    CommandFailed {
        command: String,
        kind: ErrorKind,
        message: String,
    },
    Log {
        message: String,
    },
}

/// Follow-session lifecycle.
///
/// Transitions:
///   NotStarted | Stopped -> Active            (start)
///   Active -> Paused -> Active                (pause / resume)
///   Active | Paused | Errored -> Stopped      (stop)
///   Active | Paused -> Errored -> Active      (cycle error / recovery)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    #[default]
    NotStarted,
    Active,
    Paused,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "not-started",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Errored => "errored",
        }
    }

    /// True while a session exists and owns a ledger and feed.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Paused | SessionState::Errored
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Error taxonomy shared by command results and the session's current error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidUsername,
    UnknownUser,
    InvalidTransition,
    RateLimited,
    NetworkError,
    Timeout,
    Unauthorized,
}

impl ErrorKind {
    /// Transient errors leave the poll loop scheduled and clear themselves
    /// on the next successful cycle.  `UnknownUser` only ends a `start`; in a
    /// running session it means the lookup failed this once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnknownUser
                | ErrorKind::RateLimited
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }

    /// Errors that end polling for the session until it is stopped and
    /// started again.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, ErrorKind::Unauthorized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// One relayed scrobble, as shown in the activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrobbleEvent {
    pub track_id: String,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    /// When the target user played it (source clock).
    pub played_at: DateTime<Utc>,
    /// When it was relayed to the follower's account.
    pub scrobbled_at: DateTime<Utc>,
}

/// Read-only view of the session handed to the UI.  `rev` is a monotonic
/// counter incremented on every change so clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub target_username: Option<String>,
    pub error: Option<SessionError>,
    /// Most recent first.  `None` when no session is live (feed hidden),
    /// `Some(vec![])` when the session has not relayed anything yet.
    pub feed: Option<Vec<ScrobbleEvent>>,
    #[serde(default)]
    pub scrobble_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Total size (header included) of the frame at the start of `data`,
    /// once its length header has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(4 + u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(frame_len) = Self::frame_len(data) else {
            anyhow::bail!("Insufficient data for length header");
        };
        let len = frame_len - 4;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
        }
        if data.len() < frame_len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
