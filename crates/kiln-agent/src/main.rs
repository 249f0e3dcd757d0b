use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use kiln_agent::{
    DirectoryProvisioner, JavaLauncher, MemoryStore, ServerId, ServerRecord, ServerState,
    StreamItem, Supervisor, SupervisorConfig, SupervisorError, format_error_chain,
};
use tokio::io::{AsyncBufReadExt, BufReader};

fn server_dir() -> anyhow::Result<PathBuf> {
    let dir = match std::env::args_os().nth(1) {
        Some(d) => PathBuf::from(d),
        None => kiln_agent::config::data_root().join("server"),
    };
    std::fs::canonicalize(&dir).with_context(|| format!("server directory {}", dir.display()))
}

async fn run() -> anyhow::Result<()> {
    let dir = server_dir()?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "server".to_string());
    let root = dir
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", dir.display()))?;

    let id = ServerId::from(name.as_str());
    let mut record = ServerRecord::new(id.clone(), &name, &dir);
    record.memory_mb = std::env::var("KILN_MEMORY_MB")
        .ok()
        .and_then(|v| v.parse::<u32>().ok());
    record.port = std::env::var("KILN_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok());

    let store = Arc::new(MemoryStore::new());
    store.insert(record);

    let launcher = JavaLauncher {
        java: std::env::var("KILN_JAVA").unwrap_or_else(|_| "java".to_string()),
    };
    let sup = Supervisor::builder(store, Arc::new(DirectoryProvisioner::new(root)))
        .config(SupervisorConfig::from_env())
        .launcher(launcher)
        .build();

    sup.reconcile().await?;
    let mut output = sup.subscribe(&id, true).await?;
    let mut status = sup.watch_status(&id).await?;

    tracing::info!(server_id = %id, path = %dir.display(), "starting server");
    sup.start(&id).await?;

    tokio::spawn(async move {
        while let Some(item) = output.recv().await {
            match item {
                StreamItem::Line(line) => println!("{}", line.display_line()),
                StreamItem::Dropped { count } => {
                    tracing::warn!(count, "console output fell behind, lines dropped")
                }
            }
        }
    });

    {
        let sup = sup.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = sup.send_command(&id, &line).await {
                    tracing::warn!(code = e.code(), error = %e, "command rejected");
                }
            }
        });
    }

    let mut stop_pending = false;
    let mut interrupted = false;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = status.borrow_and_update().clone();
                tracing::info!(status = %serde_json::to_string(&s)?, "status changed");

                if s.state == ServerState::Running && stop_pending {
                    stop_pending = false;
                    sup.stop(&id).await?;
                }
                if s.state.is_idle() {
                    match s.state {
                        ServerState::Error => anyhow::bail!(
                            "server failed: {}",
                            s.message.unwrap_or_else(|| "unknown error".to_string())
                        ),
                        _ => break,
                    }
                }
            }
            res = tokio::signal::ctrl_c(), if !interrupted => {
                res.context("listen for ctrl-c")?;
                interrupted = true;
                match sup.stop(&id).await {
                    Ok(_) => {}
                    // Still starting; stop as soon as it is up.
                    Err(SupervisorError::Conflict { state: ServerState::Starting, .. }) => {
                        tracing::info!("stop deferred until the server is running");
                        stop_pending = true;
                    }
                    Err(e) => tracing::warn!(code = e.code(), error = %e, "stop failed"),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format_error_chain(&e), "kiln-agent exited with error");
        std::process::exit(1);
    }
}
