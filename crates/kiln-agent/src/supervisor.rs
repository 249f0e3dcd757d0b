//! Lifecycle orchestration for supervised servers.
//!
//! Every mutation for one server id happens under that id's slot lock, and
//! every background task (stdout/stderr readers, the waiter, readiness and
//! stop escalation timers) re-checks its `run_id` under the same lock before
//! acting, so a task left over from an earlier run can never touch a newer one.
//!
//! `start` and `stop` return as soon as the transition has begun. Completion
//! is observable through [`Supervisor::watch_status`] and
//! [`Supervisor::subscribe_events`].

use std::{
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use kiln_process::{
    FailureReason, OutputChannel, OutputLine, ServerId, ServerState, ServerStatus, now_unix_ms,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::command;
use crate::config::{SupervisorConfig, format_error_chain};
use crate::console_log::console_log_path;
use crate::error::{Result, SupervisorError};
use crate::launch::{JavaLauncher, Launcher};
use crate::output::{Broadcaster, ChannelStats, Subscription};
use crate::port_alloc::PortAllocator;
use crate::readiness::{ReadinessProbe, wait_for_local_tcp_port};
use crate::registry::{ProcessRegistry, ServerProcess, Slot};
use crate::signals::{self, Signal};
use crate::store::{Provisioner, RecordStore, ServerRecord};

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Longer lines are split into several output lines.
const MAX_LINE_BYTES: u64 = 64 * 1024;
/// How long the waiter lets readers flush pipes after the process exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Status(ServerStatus),
    Deleted { server_id: ServerId },
}

struct Inner {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    ports: PortAllocator,
    output: Broadcaster,
    store: Arc<dyn RecordStore>,
    provisioner: Arc<dyn Provisioner>,
    launcher: Arc<dyn Launcher>,
    readiness: ReadinessProbe,
    events: broadcast::Sender<SupervisorEvent>,
    next_run: AtomicU64,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    store: Arc<dyn RecordStore>,
    provisioner: Arc<dyn Provisioner>,
    launcher: Arc<dyn Launcher>,
    readiness: ReadinessProbe,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn build(self) -> Supervisor {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Supervisor {
            inner: Arc::new(Inner {
                ports: PortAllocator::new(self.config.bind_host.clone()),
                output: Broadcaster::new(
                    self.config.log_max_lines,
                    self.config.subscriber_capacity,
                ),
                registry: ProcessRegistry::default(),
                config: self.config,
                store: self.store,
                provisioner: self.provisioner,
                launcher: self.launcher,
                readiness: self.readiness,
                events,
                next_run: AtomicU64::new(1),
            }),
        }
    }
}

fn describe_exit(res: &std::io::Result<ExitStatus>) -> (Option<i32>, String) {
    match res {
        Ok(status) => {
            if let Some(code) = status.code() {
                return (Some(code), format!("exit code {code}"));
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(sig) = status.signal() {
                    return (None, format!("killed by signal {sig}"));
                }
            }
            (None, "exited".to_string())
        }
        Err(e) => (None, format!("wait failed: {e}")),
    }
}

fn decode_line(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// What a server looks like when no slot has seen it yet.
fn status_from_record(record: &ServerRecord) -> ServerStatus {
    let mut status = ServerStatus::idle(record.id.clone(), record.assigned_port());
    status.started_at_unix_ms = record.last_started_unix_ms;
    status.stopped_at_unix_ms = record.last_stopped_unix_ms;
    if record.state.is_active() {
        // Nobody owns a process for it; the record is stale.
        status.state = ServerState::Error;
        status.reason = Some(FailureReason::Orphaned);
        status.message = Some(format!("recorded as {} without a supervised process", record.state));
    } else {
        status.state = record.state;
    }
    status
}

impl Supervisor {
    /// Supervisor with default config, [`JavaLauncher`] and the Minecraft readiness banner.
    pub fn builder(
        store: Arc<dyn RecordStore>,
        provisioner: Arc<dyn Provisioner>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            config: SupervisorConfig::default(),
            store,
            provisioner,
            launcher: Arc::new(JavaLauncher::default()),
            readiness: ReadinessProbe::default(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    fn slot(&self, id: &ServerId) -> Arc<Slot> {
        self.inner
            .registry
            .slot(id, || ServerStatus::idle(id.clone(), None))
    }

    async fn load_record(&self, id: &ServerId) -> Result<ServerRecord> {
        match self.inner.store.load(id).await {
            Ok(Some(r)) => Ok(r),
            Ok(None) => Err(SupervisorError::unknown(id)),
            Err(e) => Err(SupervisorError::Store(format_error_chain(&e))),
        }
    }

    fn system_line(&self, id: &ServerId, text: impl Into<String>) {
        self.inner.output.publish(id, OutputChannel::System, text);
    }

    /// Publish a status to watchers, the store and event subscribers.
    ///
    /// Callers hold the slot lock, which keeps transitions of one id in order.
    /// Watchers are updated last, so a watcher that sees a state can rely on
    /// the store and the event stream having it too.
    async fn commit(&self, slot: &Slot, status: ServerStatus) {
        if let Err(e) = self.inner.store.record_status(&status).await {
            tracing::warn!(
                server_id = %status.server_id,
                state = %status.state,
                error = %format_error_chain(&e),
                "failed to persist status"
            );
        }
        let _ = self.inner.events.send(SupervisorEvent::Status(status.clone()));
        slot.set_status(status);
    }

    /// Begin starting `id`. Returns once the process is spawned and `starting`.
    pub async fn start(&self, id: &ServerId) -> Result<ServerStatus> {
        let slot = self.slot(id);
        let mut st = slot.state.lock().await;
        if st.deleted {
            return Err(SupervisorError::unknown(id));
        }
        if let Some(p) = st.lookup() {
            let detail = if p.state.is_active() {
                "already running"
            } else {
                "previous process is still exiting"
            };
            return Err(SupervisorError::conflict(id, p.state, detail));
        }

        let record = match self.load_record(id).await {
            Ok(r) => r,
            Err(e) => {
                if matches!(e, SupervisorError::UnknownServer { .. }) {
                    self.inner.registry.forget(id, &slot);
                }
                return Err(e);
            }
        };

        match self.spawn_run(id, &record).await {
            Ok(process) => {
                let status = process.status(id);
                st.register(id, process)?;
                self.commit(&slot, status.clone()).await;
                Ok(status)
            }
            Err(err) => {
                tracing::warn!(server_id = %id, error = %err, "start failed");
                self.system_line(id, format!("start failed: {err}"));
                self.inner.output.close(id);

                let mut status = ServerStatus::idle(id.clone(), record.assigned_port());
                status.state = ServerState::Error;
                status.reason = Some(err.failure_reason());
                status.message = Some(err.to_string());
                status.stopped_at_unix_ms = Some(now_unix_ms());
                self.commit(&slot, status).await;
                Err(err)
            }
        }
    }

    async fn spawn_run(&self, id: &ServerId, record: &ServerRecord) -> Result<ServerProcess> {
        let cfg = &self.inner.config;

        let lease = match record.assigned_port() {
            Some(port) => self.inner.ports.reserve(port)?,
            None => {
                let lease = self
                    .inner
                    .ports
                    .allocate(cfg.port_range_start, cfg.max_port_probes)?;
                self.inner
                    .store
                    .assign_port(id, lease.port())
                    .await
                    .map_err(|e| SupervisorError::Store(format_error_chain(&e)))?;
                lease
            }
        };
        let port = lease.port();

        let spawn_failed = |message: String| SupervisorError::SpawnFailed {
            server_id: id.clone(),
            message,
        };

        if !record.path.is_dir() {
            return Err(spawn_failed(format!(
                "working directory {} does not exist",
                record.path.display()
            )));
        }
        let spec = self
            .inner
            .launcher
            .resolve(record)
            .map_err(|e| spawn_failed(format_error_chain(&e)))?;

        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let console_file = cfg
            .console_log
            .map(|limits| (console_log_path(&record.path), limits));
        self.inner.output.open(id, run_id, console_file);
        self.system_line(
            id,
            format!(
                "start requested: {} {} (cwd {}) port={}",
                spec.exec,
                spec.args.join(" "),
                record.path.display(),
                port
            ),
        );

        let mut cmd = Command::new(&spec.exec);
        cmd.current_dir(&record.path)
            .args(&spec.args)
            .env("KILN_SERVER_PORT", port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        signals::isolate_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failed(format!("spawn {}: {e}", spec.exec)))?;

        let pid = child.id();
        let stdin = child.stdin.take();

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(self.spawn_reader(id, run_id, out, OutputChannel::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(self.spawn_reader(id, run_id, err, OutputChannel::Stderr));
        }
        self.spawn_waiter(id, run_id, child, readers);

        if matches!(self.inner.readiness, ReadinessProbe::ListeningPort) {
            self.spawn_port_probe(id, run_id, port);
        }
        if let Some(timeout) = cfg.start_timeout {
            self.spawn_start_watchdog(id, run_id, timeout);
        }

        tracing::info!(server_id = %id, ?pid, port, run_id, kind = %spec.kind, "server process spawned");

        Ok(ServerProcess {
            run_id,
            state: ServerState::Starting,
            lease,
            pid,
            pgid: pid.map(|p| p as i32),
            stdin,
            working_dir: record.path.clone(),
            started_at_unix_ms: None,
            reason: None,
            message: Some("starting".to_string()),
            forced: false,
        })
    }

    fn spawn_reader<R>(
        &self,
        id: &ServerId,
        run_id: u64,
        stream: R,
        channel: OutputChannel,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sup = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            let mut ready = false;
            loop {
                buf.clear();
                match (&mut reader)
                    .take(MAX_LINE_BYTES)
                    .read_until(b'\n', &mut buf)
                    .await
                {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(server_id = %id, channel = channel.as_str(), error = %e, "output reader stopped");
                        break;
                    }
                }
                let text = decode_line(&buf);
                let became_ready = channel == OutputChannel::Stdout
                    && !ready
                    && sup.inner.readiness.matches_line(&text);
                sup.inner.output.publish(&id, channel, text);
                if became_ready {
                    ready = true;
                    sup.mark_ready(&id, run_id).await;
                }
            }
        })
    }

    fn spawn_waiter(&self, id: &ServerId, run_id: u64, mut child: Child, readers: Vec<JoinHandle<()>>) {
        let sup = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            // Recorded before draining, so the slot never reports a reaped process as live.
            let last_line = sup.on_exit(&id, run_id, res).await;
            for reader in readers {
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                    tracing::debug!(server_id = %id, "output reader still busy after exit");
                }
            }
            if let Some(text) = last_line {
                sup.inner.output.finish_run(&id, run_id, text);
            }
        });
    }

    fn spawn_port_probe(&self, id: &ServerId, run_id: u64, port: u16) {
        let sup = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while sup.is_starting(&id, run_id).await {
                if wait_for_local_tcp_port(port, Duration::from_secs(1)).await {
                    sup.system_line(&id, format!("port {port} is accepting connections"));
                    sup.mark_ready(&id, run_id).await;
                    return;
                }
            }
        });
    }

    fn spawn_start_watchdog(&self, id: &ServerId, run_id: u64, timeout: Duration) {
        let sup = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            sup.fail_start(&id, run_id, timeout).await;
        });
    }

    async fn is_starting(&self, id: &ServerId, run_id: u64) -> bool {
        let Some(slot) = self.inner.registry.existing(id) else {
            return false;
        };
        let mut st = slot.state.lock().await;
        st.run_mut(run_id)
            .is_some_and(|p| p.state == ServerState::Starting)
    }

    async fn mark_ready(&self, id: &ServerId, run_id: u64) {
        let Some(slot) = self.inner.registry.existing(id) else {
            return;
        };
        let mut st = slot.state.lock().await;
        let Some(p) = st.run_mut(run_id) else {
            return;
        };
        if p.state != ServerState::Starting || !p.transition(ServerState::Running) {
            return;
        }
        p.started_at_unix_ms = Some(now_unix_ms());
        p.message = None;
        let status = p.status(id);

        tracing::info!(server_id = %id, port = status.port, "server is running");
        self.system_line(id, "server is ready");
        self.commit(&slot, status).await;
    }

    async fn fail_start(&self, id: &ServerId, run_id: u64, timeout: Duration) {
        let Some(slot) = self.inner.registry.existing(id) else {
            return;
        };
        let mut st = slot.state.lock().await;
        let Some(p) = st.run_mut(run_id) else {
            return;
        };
        if p.state != ServerState::Starting || !p.transition(ServerState::Error) {
            return;
        }
        let message = format!("not ready within {}ms", timeout.as_millis());
        p.reason = Some(FailureReason::StartTimeout);
        p.message = Some(message.clone());
        if let Some(pgid) = p.pgid {
            signals::signal_group(pgid, Signal::Kill);
        }
        let status = p.status(id);

        tracing::warn!(server_id = %id, timeout_ms = timeout.as_millis() as u64, "start timed out, killing process");
        self.system_line(id, format!("{message}; sent SIGKILL"));
        self.commit(&slot, status).await;
    }

    /// Classify the exit of run `run_id`, unregister it and release its port.
    ///
    /// Returns the closing line for the output channel.
    async fn on_exit(
        &self,
        id: &ServerId,
        run_id: u64,
        res: std::io::Result<ExitStatus>,
    ) -> Option<String> {
        let slot = self.inner.registry.existing(id)?;
        let mut st = slot.state.lock().await;
        if st.lookup().map(|p| p.run_id) != Some(run_id) {
            return None;
        }
        let mut p = st.unregister()?;

        let (exit_code, how) = describe_exit(&res);
        match p.state {
            ServerState::Stopping => {
                p.transition(ServerState::Stopped);
                if p.forced {
                    p.reason = Some(FailureReason::ForcedTermination);
                    p.message = Some(format!("stopped by force ({how})"));
                } else {
                    p.message = Some("stopped".to_string());
                }
            }
            ServerState::Starting => {
                p.transition(ServerState::Error);
                p.reason = Some(FailureReason::CrashExit);
                p.message = Some(format!("exited before ready ({how})"));
            }
            ServerState::Running => {
                p.transition(ServerState::Error);
                p.reason = Some(FailureReason::CrashExit);
                p.message = Some(format!("exited unexpectedly ({how})"));
            }
            // The start watchdog already recorded why.
            ServerState::Error | ServerState::Stopped => {}
        }

        tracing::debug!(server_id = %id, run_id, cwd = %p.working_dir.display(), "reaped server process");
        let mut status = p.status(id);
        status.pid = None;
        status.exit_code = exit_code;
        status.stopped_at_unix_ms = Some(now_unix_ms());
        // Whatever the leader left in its group must not outlive the port lease.
        if let Some(pgid) = p.pgid {
            signals::signal_group(pgid, Signal::Kill);
        }
        // Releases the port lease and closes stdin.
        drop(p);

        match status.state {
            ServerState::Stopped => {
                tracing::info!(server_id = %id, ?exit_code, reason = ?status.reason, "server stopped")
            }
            _ => {
                tracing::warn!(server_id = %id, ?exit_code, reason = ?status.reason, "server failed")
            }
        }
        let last_line = format!("process exited: state={} ({how})", status.state);
        self.commit(&slot, status).await;
        Some(last_line)
    }

    /// Ask a running server to shut down.
    ///
    /// Writes the stop command, then escalates to SIGTERM shortly before and
    /// SIGKILL at the end of the grace period. Returns while `stopping`.
    pub async fn stop(&self, id: &ServerId) -> Result<ServerStatus> {
        let Some(slot) = self.inner.registry.existing(id) else {
            return Err(SupervisorError::not_running(id));
        };
        let mut st = slot.state.lock().await;
        let Some(p) = st.lookup_mut() else {
            return Err(SupervisorError::not_running(id));
        };
        match p.state {
            ServerState::Running => {}
            ServerState::Starting | ServerState::Stopping => {
                return Err(SupervisorError::conflict(
                    id,
                    p.state,
                    "stop is only accepted while running",
                ));
            }
            ServerState::Stopped | ServerState::Error => {
                return Err(SupervisorError::not_running(id));
            }
        }
        p.transition(ServerState::Stopping);
        p.message = Some("stopping".to_string());

        let cfg = &self.inner.config;
        // Dropping stdin after the stop command gives the server EOF as well.
        let graceful = match p.stdin.take() {
            Some(mut stdin) => match command::write_line(&mut stdin, &cfg.stop_command).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "failed to write stop command");
                    false
                }
            },
            None => false,
        };
        if !graceful {
            if let Some(pgid) = p.pgid {
                signals::signal_group(pgid, Signal::Term);
            }
        }
        let run_id = p.run_id;
        let status = p.status(id);

        tracing::info!(server_id = %id, graceful, grace_ms = cfg.stop_grace.as_millis() as u64, "stop requested");
        if graceful {
            self.system_line(
                id,
                format!(
                    "stop requested: sent `{}` (grace {}ms)",
                    cfg.stop_command,
                    cfg.stop_grace.as_millis()
                ),
            );
        } else {
            self.system_line(id, "stop requested: sent SIGTERM");
        }
        self.commit(&slot, status.clone()).await;
        drop(st);

        self.spawn_stop_escalation(id, run_id, graceful);
        Ok(status)
    }

    fn spawn_stop_escalation(&self, id: &ServerId, run_id: u64, graceful: bool) {
        let sup = self.clone();
        let id = id.clone();
        let started = tokio::time::Instant::now();
        let term_at = started + self.inner.config.term_after();
        let kill_at = started + self.inner.config.stop_grace;
        tokio::spawn(async move {
            if graceful {
                tokio::time::sleep_until(term_at).await;
                if !sup.escalate(&id, run_id, Signal::Term).await {
                    return;
                }
            }
            tokio::time::sleep_until(kill_at).await;
            sup.escalate(&id, run_id, Signal::Kill).await;
        });
    }

    /// Returns false once the run is gone or no longer stopping.
    async fn escalate(&self, id: &ServerId, run_id: u64, signal: Signal) -> bool {
        let Some(slot) = self.inner.registry.existing(id) else {
            return false;
        };
        let mut st = slot.state.lock().await;
        let Some(p) = st.run_mut(run_id) else {
            return false;
        };
        if p.state != ServerState::Stopping {
            return false;
        }
        p.forced = true;
        if let Some(pgid) = p.pgid {
            signals::signal_group(pgid, signal);
        }
        tracing::warn!(server_id = %id, signal = signal.name(), "server did not stop in time");
        self.system_line(id, format!("stop: sent {} (grace period)", signal.name()));
        true
    }

    /// Remove an idle server: unregister it, close its output and delete its directory.
    ///
    /// The logical deletion stands even when directory removal fails; that
    /// failure comes back as [`SupervisorError::CleanupFailed`].
    pub async fn delete(&self, id: &ServerId) -> Result<()> {
        let slot = self.slot(id);
        let mut st = slot.state.lock().await;
        if st.deleted {
            return Err(SupervisorError::unknown(id));
        }
        if let Some(p) = st.lookup() {
            return Err(SupervisorError::conflict(
                id,
                p.state,
                "stop the server before deleting it",
            ));
        }

        let record = match self.load_record(id).await {
            Ok(r) => r,
            Err(e) => {
                if matches!(e, SupervisorError::UnknownServer { .. }) {
                    self.inner.registry.forget(id, &slot);
                }
                return Err(e);
            }
        };

        st.deleted = true;
        self.inner.registry.forget(id, &slot);
        self.inner.output.close(id);
        drop(st);

        tracing::info!(server_id = %id, "server deleted");
        let _ = self.inner.events.send(SupervisorEvent::Deleted {
            server_id: id.clone(),
        });

        self.inner
            .provisioner
            .remove(&record)
            .await
            .map_err(|e| SupervisorError::CleanupFailed {
                server_id: id.clone(),
                message: format_error_chain(&e),
            })
    }

    /// Write one console command to a running server. Fire-and-forget.
    pub async fn send_command(&self, id: &ServerId, text: &str) -> Result<()> {
        let Some(slot) = self.inner.registry.existing(id) else {
            return Err(SupervisorError::not_running(id));
        };
        let mut st = slot.state.lock().await;
        let Some(p) = st
            .lookup_mut()
            .filter(|p| p.state == ServerState::Running)
        else {
            return Err(SupervisorError::not_running(id));
        };
        let cmd = command::validate_command(text)?;
        let Some(stdin) = p.stdin.as_mut() else {
            return Err(SupervisorError::not_running(id));
        };
        command::write_line(stdin, cmd).await?;
        tracing::debug!(server_id = %id, bytes = cmd.len(), "console command sent");
        Ok(())
    }

    /// Output of `id`: optionally the buffered backlog, then live lines.
    ///
    /// Idle servers may be subscribed to ahead of their next run; ids the
    /// store does not know are rejected.
    pub async fn subscribe(&self, id: &ServerId, with_backlog: bool) -> Result<Subscription> {
        if self.inner.registry.existing(id).is_none() && !self.inner.output.contains(id) {
            self.load_record(id).await?;
        }
        Ok(self.inner.output.subscribe(id, with_backlog))
    }

    /// Cursor polling over the buffered output; cursor 0 returns the newest `limit` lines.
    pub fn tail_output(&self, id: &ServerId, cursor: u64, limit: usize) -> (Vec<OutputLine>, u64) {
        self.inner.output.tail_after(id, cursor, limit)
    }

    pub fn output_stats(&self, id: &ServerId) -> Option<ChannelStats> {
        self.inner.output.stats(id)
    }

    pub async fn get_status(&self, id: &ServerId) -> Result<ServerStatus> {
        if let Some(slot) = self.inner.registry.existing(id) {
            return Ok(slot.status());
        }
        let record = self.load_record(id).await?;
        Ok(status_from_record(&record))
    }

    /// Latest status of `id`, updated on every transition.
    pub async fn watch_status(&self, id: &ServerId) -> Result<watch::Receiver<ServerStatus>> {
        if let Some(slot) = self.inner.registry.existing(id) {
            return Ok(slot.watch());
        }
        let record = self.load_record(id).await?;
        let slot = self
            .inner
            .registry
            .slot(id, || status_from_record(&record));
        Ok(slot.watch())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Statuses of every server that currently owns an OS process.
    pub async fn list_active(&self) -> Vec<ServerStatus> {
        let mut out = Vec::new();
        for (id, slot) in self.inner.registry.all() {
            let st = slot.state.lock().await;
            if let Some(p) = st.lookup() {
                out.push(p.status(&id));
            }
        }
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }

    /// Mark records that claim to be active, but have no process here, as orphaned.
    ///
    /// Meant for agent startup. Returns how many records were corrected.
    pub async fn reconcile(&self) -> Result<usize> {
        let records = self
            .inner
            .store
            .list()
            .await
            .map_err(|e| SupervisorError::Store(format_error_chain(&e)))?;

        let mut fixed = 0;
        for record in records.iter().filter(|r| r.state.is_active()) {
            let slot = self.slot(&record.id);
            let st = slot.state.lock().await;
            if st.deleted || st.lookup().is_some() {
                continue;
            }
            let status = status_from_record(record);
            tracing::warn!(server_id = %record.id, recorded = %record.state, "orphaned server record");
            self.commit(&slot, status).await;
            fixed += 1;
        }
        Ok(fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchSpec;
    use crate::store::{DirectoryProvisioner, MemoryStore};
    use crate::output::StreamItem;

    const BANNER: &str = "echo 'Done (0.1s)! For help, type \"help\"'";

    struct Script(String);

    impl Launcher for Script {
        fn resolve(&self, _record: &ServerRecord) -> anyhow::Result<LaunchSpec> {
            Ok(LaunchSpec {
                exec: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), self.0.clone()],
                kind: "script".to_string(),
            })
        }
    }

    fn console_script() -> String {
        format!(
            "echo booting; {BANNER}; while read -r line; do case \"$line\" in stop) echo bye; exit 0;; crash) exit 1;; *) echo \"ran: $line\";; esac; done"
        )
    }

    struct Harness {
        sup: Supervisor,
        store: Arc<MemoryStore>,
        root: tempfile::TempDir,
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            bind_host: "127.0.0.1".to_string(),
            port_range_start: 43_000,
            stop_grace: Duration::from_secs(30),
            term_grace: Duration::from_secs(5),
            start_timeout: Some(Duration::from_secs(30)),
            console_log: None,
            ..SupervisorConfig::default()
        }
    }

    fn harness(script: String, config: SupervisorConfig) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let sup = Supervisor::builder(store.clone(), Arc::new(DirectoryProvisioner::new(root.path())))
            .config(config)
            .launcher(Script(script))
            .build();
        Harness { sup, store, root }
    }

    impl Harness {
        fn add(&self, name: &str) -> ServerId {
            let id = ServerId::from(name);
            let dir = self.root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            self.store.insert(ServerRecord::new(id.clone(), name, dir));
            id
        }

        async fn wait_for(&self, id: &ServerId, state: ServerState) -> ServerStatus {
            let mut rx = self.sup.watch_status(id).await.unwrap();
            let status = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == state))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
                .unwrap();
            (*status).clone()
        }
    }

    #[tokio::test]
    async fn start_reaches_running_on_banner() {
        let h = harness(console_script(), config());
        let id = h.add("a");

        let status = h.sup.start(&id).await.unwrap();
        assert_eq!(status.state, ServerState::Starting);
        let port = status.port.unwrap();
        assert!(h.sup.ports().is_reserved(port));
        assert_eq!(h.store.get(&id).unwrap().port, Some(port));

        let running = h.wait_for(&id, ServerState::Running).await;
        assert!(running.started_at_unix_ms.is_some());
        assert_eq!(h.store.get(&id).unwrap().state, ServerState::Running);
    }

    #[tokio::test]
    async fn second_start_conflicts_while_running() {
        let h = harness(console_script(), config());
        let id = h.add("a");
        h.sup.start(&id).await.unwrap();
        let running = h.wait_for(&id, ServerState::Running).await;

        let err = h.sup.start(&id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict { state: ServerState::Running, .. }));
        assert_eq!(h.sup.list_active().await.len(), 1);
        assert_eq!(h.sup.get_status(&id).await.unwrap().pid, running.pid);
    }

    #[tokio::test]
    async fn graceful_stop_releases_port() {
        let h = harness(console_script(), config());
        let id = h.add("a");
        let port = h.sup.start(&id).await.unwrap().port.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        let stopping = h.sup.stop(&id).await.unwrap();
        assert_eq!(stopping.state, ServerState::Stopping);

        let stopped = h.wait_for(&id, ServerState::Stopped).await;
        assert_eq!(stopped.exit_code, Some(0));
        assert_eq!(stopped.reason, None);
        assert!(stopped.stopped_at_unix_ms.is_some());
        assert!(!h.sup.ports().is_reserved(port));
        assert!(h.sup.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn crash_while_running_is_an_error() {
        let h = harness(console_script(), config());
        let id = h.add("b");
        let port = h.sup.start(&id).await.unwrap().port.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        h.sup.send_command(&id, "crash").await.unwrap();
        let failed = h.wait_for(&id, ServerState::Error).await;
        assert_eq!(failed.reason, Some(FailureReason::CrashExit));
        assert_eq!(failed.exit_code, Some(1));
        assert!(!h.sup.ports().is_reserved(port));
        assert!(h.sup.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn exit_before_ready_is_a_crash() {
        let h = harness("echo loading; exit 3".to_string(), config());
        let id = h.add("early");
        h.sup.start(&id).await.unwrap();

        let failed = h.wait_for(&id, ServerState::Error).await;
        assert_eq!(failed.reason, Some(FailureReason::CrashExit));
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.message.unwrap().contains("before ready"));
    }

    #[tokio::test]
    async fn start_timeout_fails_and_kills() {
        let cfg = SupervisorConfig {
            start_timeout: Some(Duration::from_millis(300)),
            ..config()
        };
        let h = harness("while :; do sleep 1; done".to_string(), cfg);
        let id = h.add("stuck");
        let port = h.sup.start(&id).await.unwrap().port.unwrap();

        let failed = h.wait_for(&id, ServerState::Error).await;
        assert_eq!(failed.reason, Some(FailureReason::StartTimeout));

        // The port is held until the killed process is reaped.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.sup.ports().is_reserved(port) {
            assert!(tokio::time::Instant::now() < deadline, "port never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(h.sup.list_active().await.is_empty());
        assert_eq!(
            h.sup.get_status(&id).await.unwrap().reason,
            Some(FailureReason::StartTimeout)
        );
    }

    #[tokio::test]
    async fn stubborn_server_is_killed_after_grace() {
        let cfg = SupervisorConfig {
            stop_grace: Duration::from_secs(1),
            term_grace: Duration::from_millis(500),
            ..config()
        };
        let script = format!("trap '' TERM; {BANNER}; while :; do sleep 1; done");
        let h = harness(script, cfg);
        let id = h.add("stubborn");
        h.sup.start(&id).await.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        let begun = tokio::time::Instant::now();
        h.sup.stop(&id).await.unwrap();
        let stopped = h.wait_for(&id, ServerState::Stopped).await;
        assert!(begun.elapsed() < Duration::from_secs(4));
        assert!(begun.elapsed() >= Duration::from_secs(1));
        assert_eq!(stopped.reason, Some(FailureReason::ForcedTermination));
    }

    #[tokio::test]
    async fn stop_and_commands_need_a_running_server() {
        let h = harness(console_script(), config());
        let id = h.add("idle");

        assert!(matches!(
            h.sup.send_command(&id, "list").await,
            Err(SupervisorError::NotRunning { .. })
        ));
        assert!(matches!(
            h.sup.stop(&id).await,
            Err(SupervisorError::NotRunning { .. })
        ));
        assert_eq!(h.sup.get_status(&id).await.unwrap().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_while_starting_conflicts() {
        let cfg = SupervisorConfig {
            start_timeout: Some(Duration::from_secs(1)),
            ..config()
        };
        let h = harness("while :; do sleep 1; done".to_string(), cfg);
        let id = h.add("slow");
        h.sup.start(&id).await.unwrap();

        let err = h.sup.stop(&id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict { state: ServerState::Starting, .. }));
        assert!(matches!(
            h.sup.send_command(&id, "list").await,
            Err(SupervisorError::NotRunning { .. })
        ));
        h.wait_for(&id, ServerState::Error).await;
    }

    #[tokio::test]
    async fn commands_reach_the_console() {
        let h = harness(console_script(), config());
        let id = h.add("a");
        h.sup.start(&id).await.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        let mut sub = h.sup.subscribe(&id, false).await.unwrap();
        h.sup.send_command(&id, "say hi\n").await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap() {
                Some(StreamItem::Line(l)) if l.text == "ran: say hi" => {
                    assert_eq!(l.channel, OutputChannel::Stdout);
                    break;
                }
                Some(_) => {}
                None => panic!("stream closed"),
            }
        }

        assert!(matches!(
            h.sup.send_command(&id, "a\nb").await,
            Err(SupervisorError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_releases_port() {
        let h = harness(console_script(), config());
        let id = h.add("broken");
        std::fs::remove_dir_all(h.store.get(&id).unwrap().path).unwrap();

        let err = h.sup.start(&id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
        let status = h.sup.get_status(&id).await.unwrap();
        assert_eq!(status.state, ServerState::Error);
        assert_eq!(status.reason, Some(FailureReason::SpawnFailed));
        assert!(h.sup.ports().reserved_ports().is_empty());
    }

    #[tokio::test]
    async fn recorded_port_in_use_fails_start() {
        let h = harness(console_script(), config());
        let id = h.add("taken");
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let mut rec = h.store.get(&id).unwrap();
        rec.port = Some(port);
        h.store.insert(rec);

        let err = h.sup.start(&id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortInUse { port: p } if p == port));
        let status = h.sup.get_status(&id).await.unwrap();
        assert_eq!(status.reason, Some(FailureReason::PortInUse));
    }

    #[tokio::test]
    async fn unknown_servers_are_rejected() {
        let h = harness(console_script(), config());
        let id = ServerId::from("ghost");
        assert!(matches!(
            h.sup.start(&id).await,
            Err(SupervisorError::UnknownServer { .. })
        ));
        assert!(matches!(
            h.sup.get_status(&id).await,
            Err(SupervisorError::UnknownServer { .. })
        ));
        assert!(matches!(
            h.sup.delete(&id).await,
            Err(SupervisorError::UnknownServer { .. })
        ));
        assert!(matches!(
            h.sup.subscribe(&id, true).await,
            Err(SupervisorError::UnknownServer { .. })
        ));
        assert!(!h.sup.inner.output.contains(&id));
    }

    #[tokio::test]
    async fn crash_is_recorded_while_a_helper_still_holds_stdout() {
        let script = format!(
            "{BANNER}; while read -r line; do case \"$line\" in crash) (sleep 30) & echo \"helper $!\"; sleep 0.2; exit 1;; esac; done"
        );
        let h = harness(script, config());
        let id = h.add("leaky");
        let port = h.sup.start(&id).await.unwrap().port.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        let mut sub = h.sup.subscribe(&id, false).await.unwrap();
        let begun = tokio::time::Instant::now();
        h.sup.send_command(&id, "crash").await.unwrap();

        let failed = h.wait_for(&id, ServerState::Error).await;
        assert!(begun.elapsed() < READER_DRAIN_TIMEOUT, "exit recorded late");
        assert_eq!(failed.reason, Some(FailureReason::CrashExit));
        assert_eq!(failed.exit_code, Some(1));
        assert!(!h.sup.ports().is_reserved(port));
        assert!(matches!(
            h.sup.stop(&id).await,
            Err(SupervisorError::NotRunning { .. })
        ));

        // The helper dies with the group, so its end of stdout closes and the
        // stream finishes without waiting out the drain timeout.
        let mut saw_helper = false;
        let finished = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
            while let Some(item) = sub.recv().await {
                if let StreamItem::Line(l) = item {
                    saw_helper |= l.text.starts_with("helper ");
                }
            }
        })
        .await;
        assert!(finished.is_ok(), "output stream stayed open");
        assert!(saw_helper);
    }

    #[tokio::test]
    async fn start_queued_behind_delete_sees_unknown_server() {
        let h = harness(console_script(), config());
        let id = h.add("doomed");
        let dir = h.store.get(&id).unwrap().path;

        let slot = h.sup.slot(&id);
        let guard = slot.state.lock().await;

        let deleting = {
            let sup = h.sup.clone();
            let id = id.clone();
            tokio::spawn(async move { sup.delete(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let starting = {
            let sup = h.sup.clone();
            let id = id.clone();
            tokio::spawn(async move { sup.start(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(guard);

        deleting.await.unwrap().unwrap();
        assert!(matches!(
            starting.await.unwrap(),
            Err(SupervisorError::UnknownServer { .. })
        ));
        assert!(slot.state.lock().await.deleted);
        assert!(h.sup.inner.registry.existing(&id).is_none());
        assert!(h.sup.list_active().await.is_empty());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn reconcile_marks_stale_records() {
        let h = harness(console_script(), config());
        let id = h.add("stale");
        let mut rec = h.store.get(&id).unwrap();
        rec.state = ServerState::Running;
        h.store.insert(rec);
        let quiet = h.add("quiet");

        assert_eq!(h.sup.reconcile().await.unwrap(), 1);
        let status = h.sup.get_status(&id).await.unwrap();
        assert_eq!(status.state, ServerState::Error);
        assert_eq!(status.reason, Some(FailureReason::Orphaned));
        assert_eq!(h.store.get(&id).unwrap().state, ServerState::Error);
        assert_eq!(h.sup.get_status(&quiet).await.unwrap().state, ServerState::Stopped);

        // A reconciled server starts normally.
        h.sup.start(&id).await.unwrap();
        h.wait_for(&id, ServerState::Running).await;
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let h = harness(console_script(), config());
        let id = h.add("a");
        let mut events = h.sup.subscribe_events();

        h.sup.start(&id).await.unwrap();
        h.wait_for(&id, ServerState::Running).await;
        h.sup.stop(&id).await.unwrap();
        h.wait_for(&id, ServerState::Stopped).await;

        let mut states = Vec::new();
        while let Ok(SupervisorEvent::Status(s)) = events.try_recv() {
            states.push(s.state);
        }
        assert_eq!(
            states,
            vec![
                ServerState::Starting,
                ServerState::Running,
                ServerState::Stopping,
                ServerState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn console_log_mirrors_output() {
        let cfg = SupervisorConfig {
            console_log: Some(crate::config::ConsoleLogConfig::default()),
            ..config()
        };
        let h = harness(console_script(), cfg);
        let id = h.add("logged");
        h.sup.start(&id).await.unwrap();
        h.wait_for(&id, ServerState::Running).await;

        let path = console_log_path(&h.store.get(&id).unwrap().path);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if text.contains("[stdout] booting") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "console log: {text:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn decode_line_trims_terminators_and_replaces_bad_utf8() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"caf\xff\n"), "caf\u{fffd}");
    }
}
