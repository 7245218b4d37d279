use std::sync::Arc;
use std::time::Duration;

use delegation_auth::config::Config;
use delegation_auth::dpop::DpopVerifier;
use delegation_auth::http::{self, ResourceState};
use tokio::signal;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    if let Err(err) = run(config).await {
        tracing::error!(error = ?err, "resourced exited with error");
        std::process::exit(2);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let http_client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;

    let state = ResourceState {
        http_client,
        introspect_url: format!("{}/introspect", config.auth_server_url),
        dpop_verifier: Arc::new(DpopVerifier::new()),
        dpop_required: config.dpop_required,
    };

    let app = http::resource_router()
        .layer(http::trace_layer())
        .layer(http::cors_layer(&config.cors_origins))
        .layer(RequestBodyLimitLayer::new(8 * 1024))
        .with_state(state);

    tracing::info!(resource_bind = %config.resource_bind, "starting resource service");

    let listener = tokio::net::TcpListener::bind(config.resource_bind).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("resource service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
