//! Entry point: load config, wire dependencies, and run the server.

use fugumap::auth::{AnonymousIdentity, JwtSecret};
use fugumap::config::{Config, LogBackend};
use fugumap::repositories::{MemoryLog, MessageLog, SharedLog};
use fugumap::{create_app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let log: Arc<dyn MessageLog> = match config.log_backend {
        LogBackend::Memory => {
            tracing::warn!("using in-process message log; messages are not shared across servers");
            Arc::new(MemoryLog::new())
        }
        LogBackend::Postgres => {
            Arc::new(SharedLog::connect(&config.database_url, &config.redis_url).await?)
        }
    };
    let identity = Arc::new(AnonymousIdentity::new(JwtSecret::new(
        config.jwt_secret.clone(),
    )?));

    let app = create_app(AppState::new(log, identity, config.sync));

    tracing::info!(addr = %config.server_addr, backend = ?config.log_backend, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
