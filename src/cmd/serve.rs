//! Long-running daemon command: the HTTP/WebSocket surface plus the
//! filesystem watcher and the worker supervisor.

use anyhow::Result;
use std::path::Path;

pub async fn cmd_serve(project_dir: &Path, bind_override: Option<String>) -> Result<()> {
    use crucible::Engine;
    use crucible::config::{CrucibleToml, EngineConfig};
    use crucible::store::{Resource, StateStore};
    use tokio::sync::watch;
    use tracing::{info, warn};

    let crucible_dir = project_dir.join(".crucible");
    let store = StateStore::open(&crucible_dir);
    if !store.resource_path(Resource::Stage).exists() {
        anyhow::bail!(
            "no crucible project at {} (run 'crucible init' first)",
            crucible_dir.display()
        );
    }

    let toml = CrucibleToml::layered(project_dir)?;
    for warning in toml.validate() {
        warn!("config: {}", warning);
    }
    let mut config = EngineConfig::resolve(&toml);
    if let Some(bind) = bind_override {
        config.bind = bind;
    }

    let engine = Engine::with_config(store, config);

    // Ctrl-C flips the shutdown flag; serve() drains the daemon tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let bind = engine.config().bind.clone();
    println!("Serving crucible state on http://{}", bind);
    println!("  GET  /state   full state snapshot");
    println!("  GET  /health  liveness probe");
    println!("  WS   /ws      event stream (snapshot on connect)");
    println!();
    println!("Press Ctrl-C to stop.");

    engine.serve(shutdown_rx).await?;
    info!("daemon stopped");
    Ok(())
}
