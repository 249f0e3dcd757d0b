use std::path::{Path, PathBuf};

use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::config::ConsoleLogConfig;

/// Size-rotated append-only console file: `console.log`, `console.log.1`, ...
struct ConsoleFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl ConsoleFile {
    async fn open(path: PathBuf, limits: ConsoleLogConfig) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = open_append(&path).await?;

        Ok(Self {
            path,
            max_bytes: limits.max_bytes,
            max_files: limits.max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // Shift old rotations: .(n-1) -> .n
        for i in (1..self.max_files).rev() {
            let from = rotated_path(&self.path, i);
            let to = rotated_path(&self.path, i + 1);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, rotated_path(&self.path, 1)).await;
        }

        self.file = open_append(&self.path).await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

fn rotated_path(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), n))
}

pub(crate) fn console_log_path(working_dir: &Path) -> PathBuf {
    working_dir.join("logs").join("console.log")
}

/// Lines queued for the writer task before new ones are dropped.
const WRITER_QUEUE_LINES: usize = 4096;

/// Feeds a console file from the output path without ever blocking it.
///
/// When the disk falls behind, lines are counted instead of queued and a
/// single marker line records how many were skipped.
#[derive(Debug)]
pub(crate) struct ConsoleWriter {
    tx: mpsc::Sender<String>,
    dropped: u64,
}

impl ConsoleWriter {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx, dropped: 0 }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn write(&mut self, line: String) {
        if self.dropped > 0 {
            let marker = format!("[system] console log skipped {} lines", self.dropped);
            match self.tx.try_send(marker) {
                Ok(()) => self.dropped = 0,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped = self.dropped.saturating_add(1);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(line) {
            self.dropped = self.dropped.saturating_add(1);
        }
    }
}

/// Start a writer task for `path`. The task ends when the writer is dropped.
pub(crate) fn spawn_writer(path: PathBuf, limits: ConsoleLogConfig) -> ConsoleWriter {
    let (tx, mut rx) = mpsc::channel::<String>(WRITER_QUEUE_LINES);
    tokio::spawn(async move {
        let mut file = match ConsoleFile::open(path.clone(), limits).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "console log disabled");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            if let Err(e) = file.write_line(&line).await {
                tracing::warn!(path = %path.display(), error = %e, "console log write failed");
            }
        }
        let _ = file.file.flush().await;
    });
    ConsoleWriter::new(tx)
}
