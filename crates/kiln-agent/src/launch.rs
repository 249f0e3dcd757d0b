//! Turning a provisioned server directory into a Java command line.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::store::ServerRecord;

const DEFAULT_MEMORY_MB: u32 = 2048;
const MIN_MEMORY_MB: u32 = 256;
const INITIAL_HEAP_CAP_MB: u32 = 1024;
const JVM_ARGS_FILE: &str = "kiln_jvm_args.txt";
const ARGS_SEARCH_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: String,
}

/// Turns a provisioned record into the command line that runs it.
pub trait Launcher: Send + Sync {
    fn resolve(&self, record: &ServerRecord) -> anyhow::Result<LaunchSpec>;
}

/// `-Xmx` / `-Xms` for a heap of `memory_mb`. The initial heap is capped at 1 GiB.
pub fn heap_flags(memory_mb: u32) -> [String; 2] {
    let max = memory_mb.max(MIN_MEMORY_MB);
    [
        format!("-Xmx{max}M"),
        format!("-Xms{}M", max.min(INITIAL_HEAP_CAP_MB)),
    ]
}

/// How a server directory expects to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerLayout {
    /// `server.jar` at the top level.
    Jar,
    /// Forge/NeoForge server pack started through `@…/unix_args.txt`.
    ArgsFile {
        unix_args: PathBuf,
        user_jvm_args: bool,
    },
}

fn detect_layout(dir: &Path) -> Option<ServerLayout> {
    if dir.join("server.jar").is_file() {
        return Some(ServerLayout::Jar);
    }
    let unix_args = find_args_file(&dir.join("libraries"))?;
    Some(ServerLayout::ArgsFile {
        unix_args,
        user_jvm_args: dir.join("user_jvm_args.txt").is_file(),
    })
}

/// Breadth-first search for `unix_args.txt`; the shallowest hit wins, ties by name.
fn find_args_file(libraries: &Path) -> Option<PathBuf> {
    let mut level = VecDeque::from([libraries.to_path_buf()]);
    for _ in 0..ARGS_SEARCH_DEPTH {
        let mut hits = Vec::new();
        let mut next = VecDeque::new();
        while let Some(dir) = level.pop_front() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(kind) = entry.file_type() else {
                    continue;
                };
                if kind.is_symlink() {
                    continue;
                }
                let path = entry.path();
                if kind.is_dir() {
                    next.push_back(path);
                } else if kind.is_file() && entry.file_name() == "unix_args.txt" {
                    hits.push(path);
                }
            }
        }
        if !hits.is_empty() {
            hits.sort();
            return hits.into_iter().next();
        }
        if next.is_empty() {
            return None;
        }
        level = next;
    }
    None
}

/// `@file` argument relative to the server directory, which is the child's cwd.
fn args_file_arg(server_dir: &Path, file: &Path) -> anyhow::Result<String> {
    let rel = file
        .strip_prefix(server_dir)
        .with_context(|| format!("{} is outside {}", file.display(), server_dir.display()))?;
    Ok(format!("@{}", rel.display()))
}

/// Launches Minecraft-style Java servers found in the record's directory.
#[derive(Debug, Clone)]
pub struct JavaLauncher {
    pub java: String,
}

impl Default for JavaLauncher {
    fn default() -> Self {
        Self {
            java: "java".to_string(),
        }
    }
}

impl Launcher for JavaLauncher {
    fn resolve(&self, record: &ServerRecord) -> anyhow::Result<LaunchSpec> {
        let dir = &record.path;
        let heap = heap_flags(record.memory_mb.unwrap_or(DEFAULT_MEMORY_MB));
        let layout = detect_layout(dir).with_context(|| {
            format!(
                "{} has neither server.jar nor libraries/**/unix_args.txt",
                dir.display()
            )
        })?;

        let (args, kind) = match layout {
            ServerLayout::Jar => {
                let mut args = heap.to_vec();
                args.extend(["-jar", "server.jar", "nogui"].map(String::from));
                (args, "jar")
            }
            ServerLayout::ArgsFile {
                unix_args,
                user_jvm_args,
            } => {
                // Packs read JVM flags from files; ours go after the user's so they win.
                let jvm_file = dir.join(JVM_ARGS_FILE);
                std::fs::write(&jvm_file, format!("{}\n", heap.join("\n")))
                    .with_context(|| format!("write {}", jvm_file.display()))?;

                let mut args = Vec::new();
                if user_jvm_args {
                    args.push("@user_jvm_args.txt".to_string());
                }
                args.push(format!("@{JVM_ARGS_FILE}"));
                args.push(args_file_arg(dir, &unix_args)?);
                args.push("nogui".to_string());
                (args, "args-file")
            }
        };

        Ok(LaunchSpec {
            exec: self.java.clone(),
            args,
            kind: kind.to_string(),
        })
    }
}
