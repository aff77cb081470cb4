use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ChangeOp, DurableStore, EntityKind, StoreChange, StoreError, StoreResult};

pub type DbPool = Pool;

pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<DbPool> {
    tracing::info!("Creating database connection pool");

    let mut cfg = Config::new();
    cfg.url = Some(database_url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(max_connections as usize));

    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("Running database migrations");

    let client = pool.get().await?;

    let migrations = vec![
        include_str!("../migrations/20240101000001_create_messages_table.sql"),
        include_str!("../migrations/20240101000002_create_peers_table.sql"),
        include_str!("../migrations/20240101000003_create_seen_message_ids_table.sql"),
    ];

    for (idx, migration) in migrations.iter().enumerate() {
        tracing::debug!("Running migration {}", idx + 1);
        client.batch_execute(migration).await?;
    }

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
