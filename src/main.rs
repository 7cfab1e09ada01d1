use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Server;
use dotenv::dotenv;
use prometheus::Registry;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use payments::{
    config::{Config, LogFormat},
    create_app,
    metrics::PrometheusRecorder,
    AppState, LedgerStore,
};

fn init_tracing(config: &Config) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM, so the server stops accepting and drains.
///
/// Requests still running after `grace` are cancelled through `shutdown`
/// and roll back at their commit point.
async fn shutdown_signal(shutdown: CancellationToken, grace: Duration) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(?grace, "terminating, draining in-flight requests");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("drain period over, cancelling in-flight requests");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&config);
    info!(version = %config.version, "starting payment system service");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    info!(
        "Database connection pool initialized with {} min and {} max connections",
        config.min_connections, config.max_connections
    );

    let registry = Registry::new();
    let recorder = PrometheusRecorder::new(&registry).expect("Failed to register store metrics");

    let store = LedgerStore::new(pool, config.retry, Arc::new(recorder), config.key_scope);
    store.migrate().await.expect("Failed to run migrations");

    let shutdown = CancellationToken::new();
    let app = create_app(AppState {
        store: Arc::new(store),
        registry,
        shutdown: shutdown.clone(),
        limits: config.limits,
        version: config.version.clone(),
    });

    info!(addr = %config.listen_addr, "server listening");
    info!("Swagger UI available at http://{}/swagger-ui", config.listen_addr);

    Server::bind(&config.listen_addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), config.shutdown_grace))
        .await
        .expect("Server failed");

    shutdown.cancel();
    info!("server stopped");
}
