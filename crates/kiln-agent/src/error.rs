use kiln_process::{FailureReason, ServerId, ServerState};
use thiserror::Error;

/// Errors reported synchronously by supervisor operations.
///
/// Failures detected after a call returned (crashes, forced stops, start
/// timeouts) travel as [`FailureReason`]s on the status stream instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no free port in {start}..{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("server {server_id} is {state}: {detail}")]
    Conflict {
        server_id: ServerId,
        state: ServerState,
        detail: &'static str,
    },

    #[error("server {server_id} is not running")]
    NotRunning { server_id: ServerId },

    #[error("failed to spawn server {server_id}: {message}")]
    SpawnFailed { server_id: ServerId, message: String },

    #[error("unknown server: {server_id}")]
    UnknownServer { server_id: ServerId },

    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("server {server_id} was removed but cleanup failed: {message}")]
    CleanupFailed { server_id: ServerId, message: String },

    #[error("record store: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPortAvailable { .. } => "no_port_available",
            Self::PortInUse { .. } => "port_in_use",
            Self::Conflict { .. } => "conflict",
            Self::NotRunning { .. } => "not_running",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::UnknownServer { .. } => "unknown_server",
            Self::InvalidCommand(_) => "invalid_command",
            Self::CleanupFailed { .. } => "cleanup_failed",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
        }
    }

    /// Reason recorded on the status when this error aborts a `start()`.
    pub(crate) fn failure_reason(&self) -> FailureReason {
        match self {
            Self::NoPortAvailable { .. } => FailureReason::NoPortAvailable,
            Self::PortInUse { .. } => FailureReason::PortInUse,
            _ => FailureReason::SpawnFailed,
        }
    }

    pub(crate) fn conflict(server_id: &ServerId, state: ServerState, detail: &'static str) -> Self {
        Self::Conflict {
            server_id: server_id.clone(),
            state,
            detail,
        }
    }

    pub(crate) fn not_running(server_id: &ServerId) -> Self {
        Self::NotRunning {
            server_id: server_id.clone(),
        }
    }

    pub(crate) fn unknown(server_id: &ServerId) -> Self {
        Self::UnknownServer {
            server_id: server_id.clone(),
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_state() {
        let err = SupervisorError::conflict(
            &ServerId::from("srv-1"),
            ServerState::Running,
            "already running",
        );
        assert_eq!(err.to_string(), "server srv-1 is running: already running");
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn start_failures_map_to_reasons() {
        assert_eq!(
            SupervisorError::NoPortAvailable { start: 1, end: 2 }.failure_reason(),
            FailureReason::NoPortAvailable
        );
        assert_eq!(
            SupervisorError::PortInUse { port: 25565 }.failure_reason(),
            FailureReason::PortInUse
        );
        let spawn = SupervisorError::SpawnFailed {
            server_id: ServerId::from("x"),
            message: "no java".to_string(),
        };
        assert_eq!(spawn.failure_reason(), FailureReason::SpawnFailed);
    }
}
