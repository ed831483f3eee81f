//! Lending Server - book catalog and lending service

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lending_server::{
    api,
    config::{AppConfig, LoggingConfig},
    repository::{Repository, Store},
    services::{
        cache::{Cache, MemoryCache},
        redis::RedisCache,
        Services,
    },
    AppState,
};

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("lending_server={},tower_http=debug", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging);

    tracing::info!("Starting Lending Server v{}", env!("CARGO_PKG_VERSION"));

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations completed");

    // The cache is never authoritative, so an unreachable Redis only costs hit rate
    let cache: Arc<dyn Cache> = match RedisCache::new(&config.redis.url).await {
        Ok(redis) => {
            tracing::info!("Connected to Redis");
            Arc::new(redis)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Redis unavailable, using in-process cache; invalidations stay local to this instance"
            );
            Arc::new(MemoryCache::new())
        }
    };

    let store: Arc<dyn Store> = Arc::new(Repository::new(pool));
    let services = Services::new(store, cache, &config);

    if let Some(staff) = &config.auth.bootstrap_staff {
        services
            .users
            .ensure_staff(staff)
            .await
            .context("Failed to bootstrap staff account")?;
    }

    let addr = SocketAddr::new(
        config.server.host.parse().context("Invalid host address")?,
        config.server.port,
    );

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };

    let app = api::router(state);

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
