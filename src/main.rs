use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use authkeep::app::{build_app, serve};
use authkeep::config::AppConfig;
use authkeep::sessions::spawn_session_cleanup;
use authkeep::state::AppState;
use authkeep::users::bootstrap::ensure_admin_user;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().context("load configuration")?;
    if config.auth.has_weak_secret() {
        warn!("AUTH_SECRET is weak; use at least 32 random bytes");
    }

    let (state, db) = AppState::init(config).await?;

    match ensure_admin_user(state.users.as_ref(), &state.config.admin).await {
        Ok(Some(admin)) => info!(user_id = %admin.user_id, "bootstrap admin ready"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "failed to create bootstrap admin; continuing"),
    }

    let shutdown = CancellationToken::new();
    let cleanup = spawn_session_cleanup(
        state.sessions.clone(),
        state.audit.clone(),
        state.config.cleanup.audit_retention(),
        state.clock.clone(),
        state.config.cleanup.interval(),
        shutdown.clone(),
    );
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let server_config = state.config.server.clone();
    let result = serve(build_app(state), &server_config, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = cleanup.await {
        warn!(error = %e, "cleanup task ended abnormally");
    }
    db.close().await;
    info!("shutdown complete");
    result
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "authkeep=info,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
