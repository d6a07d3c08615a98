use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coordinator::clock::SystemClock;
use coordinator::monitor::spawn_sweeps;
use coordinator::shutdown::install_shutdown_handler;
use coordinator::{build_router, store, AppState, Config, Coordinator, CoordinatorSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=info,tower_http=info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let store = store::connect(&config.database_url, config.db_max_connections).await?;
    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(SystemClock),
        CoordinatorSettings::from(&config),
    ));

    let shutdown = install_shutdown_handler();
    let sweeps = spawn_sweeps(
        coordinator.reaper().clone(),
        config.reaper_interval(),
        coordinator.tracker().clone(),
        config.cleanup_interval(),
        shutdown.clone(),
    );

    let app = build_router(AppState::new(coordinator, config.agent_key.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        "coordinator listening on {} (store: {}, agent key: {})",
        listener.local_addr()?,
        if config.database_url == "memory" { "memory" } else { "postgres" },
        if config.agent_key.is_some() { "required" } else { "disabled" }
    );

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
    .await
    .context("http server failed")?;

    shutdown.cancel();
    for sweep in sweeps {
        let _ = sweep.await;
    }
    info!("coordinator stopped");
    Ok(())
}
