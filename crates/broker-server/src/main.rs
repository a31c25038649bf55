use std::sync::Arc;

use anyhow::Context;
use broker_core::{Broker, Store};
use broker_server::app::{self, AppState};
use broker_server::config::Config;
use broker_server::metrics;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metrics::init_metrics();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broker_server=info,broker_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;

    let store = match &cfg.data_dir {
        Some(dir) => Store::open(dir, &cfg.broker.store_options())
            .await
            .with_context(|| format!("failed to open store in {}", dir.display()))?,
        None => {
            tracing::warn!("BROKER_DATA_DIR not set; jobs are kept in memory only");
            Store::in_memory(&cfg.broker.store_options())
        }
    };
    let broker = Broker::new(Arc::new(store), cfg.broker.clone());

    let cancel = CancellationToken::new();
    let reaper = broker
        .reaper()
        .spawn_with(cancel.clone(), metrics::record_tick);

    let state = AppState {
        broker: Arc::new(broker),
    };
    let app = app::build_app(state).layer(TraceLayer::new_for_http());

    tracing::info!("listening on {}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    cancel.cancel();
    if let Err(e) = reaper.await {
        tracing::error!(error = %e, "reaper task panicked");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
