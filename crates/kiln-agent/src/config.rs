use std::{path::PathBuf, time::Duration};

pub const DEFAULT_PORT_RANGE_START: u16 = 25565;
const DEFAULT_MAX_PORT_PROBES: u16 = 1000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_STOP_GRACE_SEC: u64 = 30;
const DEFAULT_TERM_GRACE_SEC: u64 = 5;
const DEFAULT_START_TIMEOUT_SEC: u64 = 300;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    match env_string(name)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolve `KILN_DATA_ROOT` (default `./data`) to an absolute path.
pub fn data_root() -> PathBuf {
    let raw = std::env::var("KILN_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsoleLogConfig {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for ConsoleLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub bind_host: String,
    pub port_range_start: u16,
    pub max_port_probes: u16,
    /// Ring buffer size per server.
    pub log_max_lines: usize,
    /// Queue depth per subscriber before it starts losing the oldest lines.
    pub subscriber_capacity: usize,
    /// Written to stdin on `stop()`, followed by a newline.
    pub stop_command: String,
    /// Time from `stop()` until SIGKILL.
    pub stop_grace: Duration,
    /// SIGTERM is sent this long before the SIGKILL deadline.
    pub term_grace: Duration,
    /// `None` leaves a server in `starting` until it exits.
    pub start_timeout: Option<Duration>,
    /// `Some` mirrors output into `<workdir>/logs/console.log`.
    pub console_log: Option<ConsoleLogConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port_range_start: DEFAULT_PORT_RANGE_START,
            max_port_probes: DEFAULT_MAX_PORT_PROBES,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            stop_command: "stop".to_string(),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SEC),
            term_grace: Duration::from_secs(DEFAULT_TERM_GRACE_SEC),
            start_timeout: Some(Duration::from_secs(DEFAULT_START_TIMEOUT_SEC)),
            console_log: Some(ConsoleLogConfig::default()),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        let console_log = match env_bool("KILN_CONSOLE_LOG") {
            Some(false) => None,
            _ => Some(ConsoleLogConfig {
                max_bytes: env_u64("KILN_LOG_FILE_MAX_BYTES")
                    .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                    .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
                max_files: env_usize("KILN_LOG_FILE_MAX_FILES")
                    .map(|v| v.clamp(1, 20))
                    .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
            }),
        };

        let start_timeout = match env_u64("KILN_START_TIMEOUT_SEC") {
            Some(0) => None,
            Some(v) => Some(Duration::from_secs(v.clamp(5, 60 * 60))),
            None => d.start_timeout,
        };

        Self {
            bind_host: env_string("KILN_BIND_HOST").unwrap_or(d.bind_host),
            port_range_start: env_u64("KILN_PORT_RANGE_START")
                .map(|v| v.clamp(1024, u16::MAX as u64) as u16)
                .unwrap_or(d.port_range_start),
            max_port_probes: env_u64("KILN_MAX_PORT_PROBES")
                .map(|v| v.clamp(1, u16::MAX as u64) as u16)
                .unwrap_or(d.max_port_probes),
            log_max_lines: env_usize("KILN_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
            subscriber_capacity: env_usize("KILN_SUBSCRIBER_CAPACITY")
                .map(|v| v.clamp(16, 65_536))
                .unwrap_or(d.subscriber_capacity),
            stop_command: env_string("KILN_STOP_COMMAND").unwrap_or(d.stop_command),
            stop_grace: env_u64("KILN_STOP_GRACE_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 10 * 60)))
                .unwrap_or(d.stop_grace),
            term_grace: env_u64("KILN_TERM_GRACE_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 60)))
                .unwrap_or(d.term_grace),
            start_timeout,
            console_log,
        }
    }

    /// Point at which the stop escalation sends SIGTERM, relative to `stop()`.
    pub(crate) fn term_after(&self) -> Duration {
        self.stop_grace.saturating_sub(self.term_grace)
    }
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
