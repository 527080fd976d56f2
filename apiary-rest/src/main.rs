//! apiaryd - the apiary orchestrator daemon.
//!
//! # Environment Variables
//!
//! - `DATA_ROOT`: data directory (default: platform data dir + `apiary`)
//! - `LISTEN_ADDR`: bind address (default: `127.0.0.1:7700`)
//! - `CONTAINER_BACKEND`: `docker` (default) or `null`
//! - `PROVIDER_API_KEY`: API key handed to agent containers
//! - `BEE_IMAGE`: agent container image
//! - `AUTO_CONNECT_HUMAN`: seed human edges on `node.add`

use std::net::SocketAddr;
use std::sync::Arc;

use apiary_hive::{backend_from_env, Hive, HiveConfig};
use apiary_rest::{router, AppState};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apiary=info,apiary_rest=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HiveConfig::from_env();
    if config.supervisor.provider_api_key.is_none() {
        tracing::warn!(
            "PROVIDER_API_KEY not set - agents will start without credentials. \
             Set the environment variable before starting bees."
        );
    }

    let backend = match backend_from_env(config.container_deadline) {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("container backend unavailable: {err}");
            std::process::exit(i32::from(err.exit_code()));
        }
    };

    tracing::info!(data_root = %config.data_root.display(), "starting apiary orchestrator");
    let hive: Arc<Hive> = match Hive::bootstrap(config, backend).await {
        Ok(hive) => hive,
        Err(err) => {
            eprintln!("bootstrap failed: {err}");
            std::process::exit(i32::from(err.exit_code()));
        }
    };

    let app = router(AppState { hive: hive.clone() })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7700".to_string())
        .parse()
        .expect("invalid LISTEN_ADDR");

    tracing::info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    hive.shutdown();
    tracing::info!("orchestrator shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
