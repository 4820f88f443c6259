//! Wiring shared by the binaries.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::engine::MeterEngine;
use crate::remote::{PgRemote, RemoteBackend};
use crate::store::{LocalStore, SqliteBackend};
use crate::sync::{Connectivity, SyncCoordinator};

pub type DeviceEngine = MeterEngine<SqliteBackend, PgRemote>;

/// Open the local store, prepare the backend pool and probe it once.
pub async fn open_engine(cfg: &AppConfig) -> anyhow::Result<DeviceEngine> {
    let backend = SqliteBackend::open(&cfg.local.path).await?;
    let remote = PgRemote::connect_lazy(&cfg.remote.uri, cfg.remote.max_connections, cfg.remote.acquire_timeout())?;

    let online = match remote.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "remote backend unreachable, starting offline");
            false
        }
    };

    let coordinator = SyncCoordinator::new(
        LocalStore::new(backend),
        Arc::new(remote),
        cfg.sync.retry.clone(),
        Connectivity::new(online),
    );

    Ok(MeterEngine::new(Arc::new(coordinator))
        .with_tariff(cfg.tariff.clone())
        .with_anomaly_policy(cfg.validation.anomaly))
}
