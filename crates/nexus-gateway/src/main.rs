use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod app;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > NEXUS_CONFIG env > ~/.nexus/nexus.toml
    let config_path = std::env::var("NEXUS_CONFIG").ok();
    let config = nexus_core::config::NexusConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({}), using defaults", e);
        nexus_core::config::NexusConfig::default()
    });

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let window_minutes = config.tokens.window_minutes;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let state = Arc::new(app::AppState::new(config, shutdown_rx.clone())?);

    tokio::spawn(state.task_cache.clone().run_sweeper(shutdown_rx.clone()));
    tokio::spawn(run_token_coalesce(state.clone(), window_minutes, shutdown_rx));

    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("nexus gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}

/// Nightly coalesce of matured `token_usage_minute` buckets into
/// `token_usage_daily` (spec §4.8).
async fn run_token_coalesce(
    state: Arc<app::AppState>,
    window_minutes: i64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = state.reader.coalesce_nightly(window_minutes) {
                    warn!(error = %e, "token usage coalesce failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
