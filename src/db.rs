use crate::config::{Config, DatabaseConfig};
use crate::database::postgres_repository::PostgresRepository;
use crate::middleware::rate_limit::RateLimiter;
use crate::service::identity::GoTrueClient;
use crate::service::{AppServices, Backends};
use rocket::fairing::AdHoc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

pub async fn init_pool(db_config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .acquire_timeout(Duration::from_secs(db_config.acquire_timeout))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_config.url)
        .await
}

/// Connects to Postgres, optionally migrates, and wires the services over it.
pub async fn connect_services(config: &Config, limiter: Option<Arc<RateLimiter>>) -> Result<(PgPool, AppServices), String> {
    let pool = init_pool(&config.database)
        .await
        .map_err(|err| format!("Failed to initialize database pool: {err}"))?;

    if config.database.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| format!("Failed to run migrations: {err}"))?;
        tracing::info!("Database migrations applied");
    }

    let identity = GoTrueClient::new(&config.identity).map_err(|err| format!("Failed to build identity provider client: {err}"))?;
    let backends = Backends::postgres(PostgresRepository { pool: pool.clone() }, Arc::new(identity));

    Ok((pool, AppServices::assemble(config, backends, limiter)))
}

pub fn stage_services(config: Config) -> AdHoc {
    AdHoc::try_on_ignite("Postgres (sqlx) and identity provider", |rocket| async move {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        limiter.clone().spawn_cleanup_task();

        match connect_services(&config, Some(limiter.clone())).await {
            Ok((pool, services)) => {
                tracing::info!("Database pool and services initialized successfully");
                Ok(rocket.manage(pool).manage(services).manage(limiter))
            }
            Err(e) => {
                tracing::error!("{}", e);
                Err(rocket)
            }
        }
    })
}
