use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate_adapter::{HttpUpstreamClient, PriceTable, UpstreamClient, UpstreamClientConfig};
use tollgate_common::GlobalConfigPatch;
use tollgate_relay::{spawn_refresh_task, AppState};
use tollgate_storage::{SeaOrmStorage, Storage};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Merge order: CLI > ENV > defaults.
    let mut patch = GlobalConfigPatch::from_env();
    patch.overlay(cli::Cli::parse().into_patch());
    let global = patch.into_config().context("incomplete configuration")?;

    let db = tollgate_storage::db::connect(&global.dsn)
        .await
        .context("database connection failed")?;
    let storage: Arc<dyn Storage> = Arc::new(SeaOrmStorage::new(db));
    let snapshot = storage
        .load_snapshot()
        .await
        .context("initial snapshot load failed")?;
    info!(
        channels = snapshot.channels.len(),
        abilities = snapshot.abilities.len(),
        users = snapshot.users.len(),
        "snapshot loaded"
    );

    let client: Arc<dyn UpstreamClient> = Arc::new(
        HttpUpstreamClient::new(UpstreamClientConfig {
            proxy: global.proxy.clone(),
            ..UpstreamClientConfig::default()
        })
        .map_err(|err| anyhow::anyhow!("upstream client init failed: {}", err.message))?,
    );

    let state = AppState::new(
        global.clone(),
        snapshot,
        PriceTable::default(),
        storage,
        client,
    );
    spawn_refresh_task(state.clone());

    let app = tollgate_router::relay_router(state);
    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(addr = %bind, "tollgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
