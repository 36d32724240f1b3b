use dm_pilot::{create_app, worker};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();

    let (state, app) = create_app().await?;
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = worker::spawn_workers(state.clone(), shutdown_rx);
    info!(workers = workers.len(), "queue workers running");

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "dm-pilot listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    futures::future::join_all(workers).await;
    info!("workers drained, bye");
    Ok(())
}
