use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::{auth, config::Config};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT_SECS: u64 = 5;

pub async fn connect(config: &Config) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn is_applied(pool: &SqlitePool, name: &str) -> anyhow::Result<bool> {
    let applied: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(applied)
}

/// Runs every `;`-separated statement of `sql` in one transaction and records
/// `name` as applied.
async fn apply(pool: &SqlitePool, name: &str, sql: &str) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for statement in sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(&mut *tx).await?;
        }
    }
    sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!("Applied migration: {}", name);
    Ok(())
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, "001_init").await? {
        apply(pool, "001_init", include_str!("../migrations/001_init.sql")).await?;
    }

    // 002: starter catalog so a fresh install can take bookings
    if !is_applied(pool, "002_default_plans").await? {
        apply(
            pool,
            "002_default_plans",
            "INSERT INTO plans (name, display_name, description, price, duration, sort_order, is_active) VALUES
                ('initial', 'Initial consultation', 'Intake interview and first treatment', 8000, 60, 1, 1),
                ('standard', 'Standard treatment', 'Follow-up treatment session', 6000, 60, 2, 1)",
        )
        .await?;
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

/// Creates the first admin from `ADMIN_LOGIN_ID` / `ADMIN_PASSWORD` when the
/// admins table is empty.
pub async fn seed_admin(pool: &SqlitePool, config: &Config) -> anyhow::Result<()> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admins")
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Ok(());
    }

    let (Some(login_id), Some(password)) = (&config.admin_login_id, &config.admin_password)
    else {
        tracing::warn!("No admin account exists and ADMIN_LOGIN_ID/ADMIN_PASSWORD are not set; admin console is unusable");
        return Ok(());
    };

    let password_hash = auth::hash_password(password)
        .map_err(|e| anyhow::anyhow!("failed to hash admin password: {}", e))?;
    sqlx::query("INSERT INTO admins (login_id, password_hash) VALUES (?, ?)")
        .bind(login_id)
        .bind(password_hash)
        .execute(pool)
        .await?;
    tracing::info!("Seeded admin account '{}'", login_id);
    Ok(())
}
