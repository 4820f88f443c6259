use anyhow::Result;
use meter_sync::{
    app, config::AppConfig, metrics_server, observability, sync::spawn_probe, ExecutionContext,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let engine = app::open_engine(&cfg).await?;
    let coordinator = engine.coordinator().clone();
    let cancel = CancellationToken::new();

    if cfg.sync.refresh_snapshots && coordinator.connectivity().is_online() {
        if let Err(e) = coordinator.refresh_snapshots(&ExecutionContext::system()).await {
            tracing::warn!(error = %e, "initial snapshot refresh failed");
        }
    }

    let probe = spawn_probe(
        coordinator.remote().clone(),
        coordinator.connectivity().clone(),
        cfg.sync.probe_interval(),
        cancel.clone(),
    );
    let auto_sync = coordinator.clone().start_auto_sync(cfg.sync.interval(), cancel.clone());

    let refresher = if cfg.sync.refresh_snapshots {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let mut online = coordinator.connectivity().subscribe();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            if let Err(e) = coordinator.refresh_snapshots(&ExecutionContext::system()).await {
                                tracing::warn!(error = %e, "snapshot refresh failed");
                            }
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    tracing::info!(store = %cfg.local.path.display(), "meter-sync running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    cancel.cancel();
    probe.await?;
    auto_sync.await?;
    if let Some(refresher) = refresher {
        refresher.await?;
    }

    let status = engine.status().await?;
    tracing::info!(pending = status.pending, last_sync = ?status.last_sync, "stopped");
    Ok(())
}
