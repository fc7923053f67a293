mod app;
mod auth;
mod availability;
mod blackouts;
mod cache;
mod config;
mod csv_export;
mod db;
mod error;
mod extract;
mod handlers;
mod mailer;
mod models;
mod rate_limit;
mod reservations;
mod slots;
mod validation;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cache::Cache;
use config::Config;
use mailer::Mailer;
use models::DayAvailability;
use rate_limit::RateLimiter;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub started_at: Instant,
    /// Per-day availability, keyed `availability:<date>`.
    pub availability: Cache<DayAvailability>,
    pub mailer: Mailer,
}

impl AppState {
    pub fn new(db: sqlx::SqlitePool, config: Config) -> Self {
        let mailer = Mailer::new(config.mail.clone(), db.clone());
        Self {
            db,
            config,
            started_at: Instant::now(),
            availability: Cache::new(Duration::from_secs(AVAILABILITY_TTL_SECS)),
            mailer,
        }
    }
}

const AVAILABILITY_TTL_SECS: u64 = 300;
/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;
const CACHE_EVICT_SECS: u64 = 60;
const EMAIL_RETRY_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    if !config.auth_configured() {
        tracing::warn!("SESSION_SECRET not set; admin login is disabled");
    }
    if !config.mail.enabled() {
        tracing::warn!("RESEND_API_KEY not set; notification emails will be skipped");
    }

    // ── Database ──
    let pool = db::connect(&config).await?;
    db::run_migrations(&pool).await?;
    db::seed_admin(&pool, &config).await?;

    let state = Arc::new(AppState::new(pool, config));

    // ── Background task: drop expired availability entries ──
    let cache_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CACHE_EVICT_SECS));
        loop {
            interval.tick().await;
            cache_state.availability.evict_expired();
        }
    });

    // ── Background task: retry queued notification emails ──
    let mail_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(EMAIL_RETRY_SECS));
        loop {
            interval.tick().await;
            match mail_state.mailer.retry_queued().await {
                Ok(0) => {}
                Ok(sent) => tracing::info!("delivered {} queued emails", sent),
                Err(e) => tracing::error!("email queue sweep failed: {}", e),
            }
        }
    });

    // ── Rate limiter ──
    let rate_limiter = RateLimiter::with_defaults();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = app::router(state, rate_limiter);

    tracing::info!("Reservation server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
