use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use kiln_process::{FailureReason, ServerId, ServerState, ServerStatus};
use tokio::{
    process::ChildStdin,
    sync::{Mutex, watch},
};

use crate::error::{Result, SupervisorError};
use crate::port_alloc::PortLease;

/// The live OS process of one server. Exists only between spawn and reap.
#[derive(Debug)]
pub(crate) struct ServerProcess {
    pub(crate) run_id: u64,
    pub(crate) state: ServerState,
    pub(crate) lease: PortLease,
    pub(crate) pid: Option<u32>,
    pub(crate) pgid: Option<i32>,
    pub(crate) stdin: Option<ChildStdin>,
    pub(crate) working_dir: PathBuf,
    pub(crate) started_at_unix_ms: Option<u64>,
    pub(crate) reason: Option<FailureReason>,
    pub(crate) message: Option<String>,
    /// Set once the stop escalation had to signal the group (SIGTERM or SIGKILL).
    pub(crate) forced: bool,
}

impl ServerProcess {
    pub(crate) fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Move along a lifecycle edge. Returns false (and changes nothing) for illegal edges.
    pub(crate) fn transition(&mut self, to: ServerState) -> bool {
        if !self.state.can_transition_to(to) {
            tracing::warn!(from = %self.state, to = %to, "rejected illegal state transition");
            return false;
        }
        self.state = to;
        true
    }

    pub(crate) fn status(&self, server_id: &ServerId) -> ServerStatus {
        ServerStatus {
            server_id: server_id.clone(),
            state: self.state,
            port: Some(self.port()),
            pid: self.pid,
            exit_code: None,
            reason: self.reason,
            message: self.message.clone(),
            started_at_unix_ms: self.started_at_unix_ms,
            stopped_at_unix_ms: None,
        }
    }
}

/// Everything behind one slot's lock.
#[derive(Debug)]
pub(crate) struct SlotState {
    process: Option<ServerProcess>,
    /// Set by `delete`; late callers holding this slot must not revive it.
    pub(crate) deleted: bool,
}

impl SlotState {
    /// Install a freshly spawned process. Fails while a previous one is still alive.
    pub(crate) fn register(&mut self, server_id: &ServerId, process: ServerProcess) -> Result<()> {
        if let Some(existing) = &self.process {
            return Err(SupervisorError::conflict(
                server_id,
                existing.state,
                "already running",
            ));
        }
        self.process = Some(process);
        Ok(())
    }

    pub(crate) fn lookup(&self) -> Option<&ServerProcess> {
        self.process.as_ref()
    }

    pub(crate) fn lookup_mut(&mut self) -> Option<&mut ServerProcess> {
        self.process.as_mut()
    }

    /// The process of run `run_id`, if it is still the registered one.
    pub(crate) fn run_mut(&mut self, run_id: u64) -> Option<&mut ServerProcess> {
        self.process.as_mut().filter(|p| p.run_id == run_id)
    }

    /// Remove the process; only called once it has been reaped.
    pub(crate) fn unregister(&mut self) -> Option<ServerProcess> {
        self.process.take()
    }
}

/// One server id's single-writer entry.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: Mutex<SlotState>,
    status: watch::Sender<ServerStatus>,
}

impl Slot {
    fn new(server_id: ServerId) -> Self {
        let (status, _) = watch::channel(ServerStatus::idle(server_id, None));
        Self {
            state: Mutex::new(SlotState {
                process: None,
                deleted: false,
            }),
            status,
        }
    }

    pub(crate) fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    /// Publish a status. Callers hold the slot lock, so updates are ordered.
    pub(crate) fn set_status(&self, status: ServerStatus) {
        self.status.send_replace(status);
    }
}

/// Authoritative map of server id to slot.
///
/// The map lock is only held to look up or insert a slot; all per-server work
/// happens under that slot's own lock, so different ids never contend.
#[derive(Debug, Default)]
pub(crate) struct ProcessRegistry {
    slots: StdMutex<HashMap<ServerId, Arc<Slot>>>,
}

impl ProcessRegistry {
    fn slots(&self) -> MutexGuard<'_, HashMap<ServerId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot for `id`, created on first use. `initial` seeds a new slot's status.
    pub(crate) fn slot(&self, id: &ServerId, initial: impl FnOnce() -> ServerStatus) -> Arc<Slot> {
        self.slots()
            .entry(id.clone())
            .or_insert_with(|| {
                let slot = Slot::new(id.clone());
                slot.set_status(initial());
                Arc::new(slot)
            })
            .clone()
    }

    pub(crate) fn existing(&self, id: &ServerId) -> Option<Arc<Slot>> {
        self.slots().get(id).cloned()
    }

    /// Drop `slot` from the map if it is still the one registered for `id`.
    pub(crate) fn forget(&self, id: &ServerId, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        if slots.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(id);
        }
    }

    pub(crate) fn all(&self) -> Vec<(ServerId, Arc<Slot>)> {
        self.slots()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }
}
