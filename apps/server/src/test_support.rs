//! Shared fixtures for the crate's unit tests.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::{config::Config, db, AppState};

/// A fresh private in-memory database.
///
/// Every connection to `sqlite::memory:` opens its own database, so the pool is
/// pinned to one connection that never gets recycled.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap()
}

/// Migrated, admin-seeded state with mail disabled.
pub async fn test_state() -> Arc<AppState> {
    test_state_with(Config::for_tests()).await
}

/// State backed by a SQLite file under `dir`, using the production pool setup
/// so several connections contend for the write lock.
pub async fn file_state(dir: &Path) -> Arc<AppState> {
    let mut config = Config::for_tests();
    config.database_url = format!("sqlite:{}?mode=rwc", dir.join("reserve.db").display());
    let pool = db::connect(&config).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    db::seed_admin(&pool, &config).await.unwrap();
    Arc::new(AppState::new(pool, config))
}

pub async fn test_state_with(config: Config) -> Arc<AppState> {
    let pool = memory_pool().await;
    db::run_migrations(&pool).await.unwrap();
    db::seed_admin(&pool, &config).await.unwrap();
    Arc::new(AppState::new(pool, config))
}
