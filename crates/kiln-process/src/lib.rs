use std::fmt;

/// Opaque identifier of one managed server.
///
/// NOTE: The supervisor never interprets the contents; the record store decides the format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerState {
    /// States in which an OS process may exist for the server.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether `start` may be issued from this state.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn can_transition_to(self, to: ServerState) -> bool {
        use ServerState::*;
        match (self, to) {
            (Stopped | Error, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // Unrecoverable failure is reachable from everywhere except itself.
            (from, Error) => from != Error,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a server ended up in `error`, or why a stop needed force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoPortAvailable,
    PortInUse,
    SpawnFailed,
    CrashExit,
    StartTimeout,
    ForcedTermination,
    Orphaned,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPortAvailable => "no_port_available",
            Self::PortInUse => "port_in_use",
            Self::SpawnFailed => "spawn_failed",
            Self::CrashExit => "crash_exit",
            Self::StartTimeout => "start_timeout",
            Self::ForcedTermination => "forced_termination",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub server_id: ServerId,
    pub state: ServerState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
    pub started_at_unix_ms: Option<u64>,
    pub stopped_at_unix_ms: Option<u64>,
}

impl ServerStatus {
    /// Status of a server with no process and no history.
    pub fn idle(server_id: ServerId, port: Option<u16>) -> Self {
        Self {
            server_id,
            state: ServerState::Stopped,
            port,
            pid: None,
            exit_code: None,
            reason: None,
            message: None,
            started_at_unix_ms: None,
            stopped_at_unix_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
    /// Annotations written by the supervisor itself.
    System,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub at_unix_ms: u64,
    pub channel: OutputChannel,
    pub text: String,
}

impl OutputLine {
    /// Console rendering, e.g. `[stderr] Exception in thread "main"`.
    pub fn display_line(&self) -> String {
        format!("[{}] {}", self.channel.as_str(), self.text)
    }
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
