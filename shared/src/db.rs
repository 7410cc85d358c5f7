use anyhow::{Context, Result};
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../migrations");

pub async fn run_migrations(database_url: &str) -> Result<()> {
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> Result<()> {
        info!("Running database migrations...");
        let mut conn = PgConnection::establish(&url).context("connect for migrations")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
        info!(applied = applied.len(), "Migrations completed successfully");
        Ok(())
    })
    .await?
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_connections.max(1))
        .build(config)
        .await
        .context("build connection pool")?;
    Ok(pool)
}
