//! Seams to the collaborators that own server metadata and directories.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;
use async_trait::async_trait;
use kiln_process::{ServerId, ServerState, ServerStatus};

/// What the record store knows about a server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub version: String,
    /// Assigned at creation; `None` (or 0) lets the supervisor pick one on first start.
    pub port: Option<u16>,
    /// Working directory, already provisioned.
    pub path: PathBuf,
    pub memory_mb: Option<u32>,
    pub state: ServerState,
    pub last_started_unix_ms: Option<u64>,
    pub last_stopped_unix_ms: Option<u64>,
}

impl ServerRecord {
    pub fn new(id: ServerId, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            version: "latest_release".to_string(),
            port: None,
            path: path.into(),
            memory_mb: None,
            state: ServerState::Stopped,
            last_started_unix_ms: None,
            last_stopped_unix_ms: None,
        }
    }

    pub(crate) fn assigned_port(&self) -> Option<u16> {
        self.port.filter(|p| *p != 0)
    }
}

/// Persistent server metadata, keyed by id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, id: &ServerId) -> anyhow::Result<Option<ServerRecord>>;

    async fn list(&self) -> anyhow::Result<Vec<ServerRecord>>;

    /// Persist the port picked for a record that had none.
    async fn assign_port(&self, id: &ServerId, port: u16) -> anyhow::Result<()>;

    /// Persist a state transition.
    async fn record_status(&self, status: &ServerStatus) -> anyhow::Result<()>;
}

/// Removes a server's working directory after deletion.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn remove(&self, record: &ServerRecord) -> anyhow::Result<()>;
}

/// Record store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<ServerId, ServerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<ServerId, ServerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: ServerRecord) {
        self.records().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &ServerId) -> Option<ServerRecord> {
        self.records().get(id).cloned()
    }

    pub fn remove(&self, id: &ServerId) -> Option<ServerRecord> {
        self.records().remove(id)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, id: &ServerId) -> anyhow::Result<Option<ServerRecord>> {
        Ok(self.get(id))
    }

    async fn list(&self) -> anyhow::Result<Vec<ServerRecord>> {
        Ok(self.records().values().cloned().collect())
    }

    async fn assign_port(&self, id: &ServerId, port: u16) -> anyhow::Result<()> {
        let mut records = self.records();
        let rec = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown server: {id}"))?;
        rec.port = Some(port);
        Ok(())
    }

    async fn record_status(&self, status: &ServerStatus) -> anyhow::Result<()> {
        let mut records = self.records();
        let Some(rec) = records.get_mut(&status.server_id) else {
            // Deleted records may still see their final transition.
            return Ok(());
        };
        rec.state = status.state;
        if status.started_at_unix_ms.is_some() {
            rec.last_started_unix_ms = status.started_at_unix_ms;
        }
        if status.stopped_at_unix_ms.is_some() {
            rec.last_stopped_unix_ms = status.stopped_at_unix_ms;
        }
        Ok(())
    }
}

/// Deletes server directories, but only below `root`.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scoped(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("resolve data root {}", self.root.display()))?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("refusing to remove {}", path.display()))?;
        let name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("refusing to remove {}", path.display()))?;
        // Canonicalize the parent only, so a symlinked leaf is still detected below.
        let parent = std::fs::canonicalize(parent)
            .with_context(|| format!("resolve {}", parent.display()))?;
        let full = parent.join(name);
        if !full.starts_with(&root) || full == root {
            anyhow::bail!("{} is outside {}", full.display(), root.display());
        }
        Ok(full)
    }
}

#[async_trait]
impl Provisioner for DirectoryProvisioner {
    async fn remove(&self, record: &ServerRecord) -> anyhow::Result<()> {
        let meta = match tokio::fs::symlink_metadata(&record.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(format!("stat {}", record.path.display())),
        };
        if meta.file_type().is_symlink() {
            anyhow::bail!("refusing to remove symlink {}", record.path.display());
        }

        let path = self.scoped(&record.path)?;
        tokio::fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("remove {}", path.display()))?;
        tracing::info!(server_id = %record.id, path = %path.display(), "server directory removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_process::FailureReason;

    #[tokio::test]
    async fn memory_store_tracks_transitions() {
        let store = MemoryStore::new();
        let id = ServerId::from("a");
        store.insert(ServerRecord::new(id.clone(), "alpha", "/tmp/alpha"));

        store.assign_port(&id, 25570).await.unwrap();
        let mut status = ServerStatus::idle(id.clone(), Some(25570));
        status.state = ServerState::Running;
        status.started_at_unix_ms = Some(42);
        store.record_status(&status).await.unwrap();

        let rec = store.get(&id).unwrap();
        assert_eq!(rec.port, Some(25570));
        assert_eq!(rec.state, ServerState::Running);
        assert_eq!(rec.last_started_unix_ms, Some(42));
    }

    #[tokio::test]
    async fn memory_store_ignores_status_for_missing_records() {
        let store = MemoryStore::new();
        let mut status = ServerStatus::idle(ServerId::from("gone"), None);
        status.state = ServerState::Error;
        status.reason = Some(FailureReason::CrashExit);
        store.record_status(&status).await.unwrap();
        assert!(store.assign_port(&ServerId::from("gone"), 1).await.is_err());
    }

    #[test]
    fn zero_port_means_unassigned() {
        let mut rec = ServerRecord::new(ServerId::from("a"), "a", "/x");
        rec.port = Some(0);
        assert_eq!(rec.assigned_port(), None);
        rec.port = Some(25565);
        assert_eq!(rec.assigned_port(), Some(25565));
    }

    #[tokio::test]
    async fn provisioner_removes_directories_under_root() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("server-1");
        std::fs::create_dir_all(dir.join("world")).unwrap();
        std::fs::write(dir.join("server.jar"), b"jar").unwrap();

        let p = DirectoryProvisioner::new(root.path());
        let rec = ServerRecord::new(ServerId::from("s1"), "s1", &dir);
        p.remove(&rec).await.unwrap();
        assert!(!dir.exists());

        // Already gone is fine.
        p.remove(&rec).await.unwrap();
    }

    #[tokio::test]
    async fn provisioner_refuses_paths_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let p = DirectoryProvisioner::new(root.path());

        let rec = ServerRecord::new(ServerId::from("x"), "x", other.path());
        assert!(p.remove(&rec).await.is_err());
        assert!(other.path().exists());

        let rec = ServerRecord::new(ServerId::from("root"), "root", root.path());
        assert!(p.remove(&rec).await.is_err());
        assert!(root.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn provisioner_refuses_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("real");
        std::fs::create_dir_all(&target).unwrap();
        let link = root.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let p = DirectoryProvisioner::new(root.path());
        let rec = ServerRecord::new(ServerId::from("l"), "l", &link);
        assert!(p.remove(&rec).await.is_err());
        assert!(target.exists());
    }
}
