//! Supervises Minecraft-style server processes: spawn, readiness, console
//! fan-out, graceful stop with escalation, and cleanup.

mod command;
pub mod config;
mod console_log;
pub mod error;
pub mod launch;
pub mod output;
pub mod port_alloc;
pub mod readiness;
mod registry;
mod signals;
pub mod store;
pub mod supervisor;

pub use config::{ConsoleLogConfig, SupervisorConfig, format_error_chain};
pub use error::{Result, SupervisorError};
pub use launch::{JavaLauncher, LaunchSpec, Launcher};
pub use output::{ChannelStats, StreamItem, Subscription};
pub use readiness::ReadinessProbe;
pub use store::{DirectoryProvisioner, MemoryStore, Provisioner, RecordStore, ServerRecord};
pub use supervisor::{Supervisor, SupervisorBuilder, SupervisorEvent};

pub use kiln_process::{
    FailureReason, OutputChannel, OutputLine, ServerId, ServerState, ServerStatus,
};
