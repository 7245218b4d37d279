use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use delegation_auth::config::Config;
use delegation_auth::engine::{Engine, EngineConfig};
use delegation_auth::http::{self, AuthState};
use delegation_auth::idp::{DisabledIdp, IdentityProvider, LocalStubIdp};
use delegation_auth::rate_limit::RateLimiter;
use delegation_auth::signer::Signer;
use delegation_auth::store::Store;
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
        tracing::error!(error = ?err, "authd exited with error");
        std::process::exit(2);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(Store::new());
    let signer = Arc::new(Signer::new(config.jwt_secret.as_bytes()));
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        signer,
        EngineConfig {
            issuer: config.auth_server_url.clone(),
            delegation_ttl: Duration::minutes(config.delegation_token_ttl_minutes),
            access_ttl: Duration::minutes(config.access_token_ttl_minutes),
        },
    ));

    let idp: Arc<dyn IdentityProvider> = match &config.oidc_redirect_uri {
        Some(redirect_uri) => Arc::new(LocalStubIdp { redirect_base: redirect_uri.clone() }),
        None => Arc::new(DisabledIdp),
    };

    let state = AuthState {
        engine,
        store,
        idp,
        pending: Arc::new(Mutex::new(HashMap::new())),
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
        config: Arc::clone(&config),
    };

    let auth_app = http::auth_router()
        .layer(http::trace_layer())
        .layer(http::cors_layer(&config.cors_origins))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .with_state(state.clone());

    let management_app = http::management_router()
        .layer(http::trace_layer())
        .layer(http::cors_layer(&config.cors_origins))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .with_state(state);

    tracing::info!(auth_bind = %config.auth_bind, management_bind = %config.management_bind, "starting authorization service");

    let auth_listener = tokio::net::TcpListener::bind(config.auth_bind).await?;
    let management_listener = tokio::net::TcpListener::bind(config.management_bind).await?;

    // `/token` is rate-limited by client IP, so the auth listener needs the
    // real peer address threaded through via `ConnectInfo`.
    let auth_app = auth_app.into_make_service_with_connect_info::<SocketAddr>();

    tokio::try_join!(
        async { axum::serve(auth_listener, auth_app).with_graceful_shutdown(shutdown_signal()).await },
        async { axum::serve(management_listener, management_app).with_graceful_shutdown(shutdown_signal()).await },
    )?;

    tracing::info!("authorization service stopped");
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
