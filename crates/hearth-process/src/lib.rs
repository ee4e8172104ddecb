use chrono::{DateTime, Local};

/// Identifies one run of the game server, from spawn to exit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of the place a command came from and replies go back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn is_stopped(self) -> bool {
        matches!(self, ServerState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    /// Requested by an operator (stop or restart).
    ManualStop,
    /// Requested by the idle timer.
    IdleStop,
    /// The process exited on its own and was reaped.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlayerCount {
    pub online: u32,
    pub max: u32,
}

impl PlayerCount {
    pub fn is_active(&self) -> bool {
        self.online > 0
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub session: Option<SessionId>,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
    pub uptime_secs: Option<u64>,
}

impl ServerStatus {
    pub fn stopped() -> Self {
        Self {
            session: None,
            state: ServerState::Stopped,
            pid: None,
            started_at: None,
            uptime_secs: None,
        }
    }
}

/// Name of the archived log for a session started at `started_at`.
///
/// Format: `log_YYYY-MM-DD_HH-MM-SS.log`.
pub fn archive_log_name(started_at: &DateTime<Local>) -> String {
    format!("log_{}.log", started_at.format("%Y-%m-%d_%H-%M-%S"))
}
