use chrono::{FixedOffset, NaiveDate, Utc};

/// Default clinic timezone offset (Asia/Tokyo, UTC+9).
const DEFAULT_TZ_OFFSET_HOURS: i32 = 9;

const DEFAULT_MAIL_API_URL: &str = "https://api.resend.com/emails";

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: String,
    /// HMAC key for admin bearer tokens. Empty means auth is misconfigured.
    pub session_secret: String,
    pub admin_login_id: Option<String>,
    pub admin_password: Option<String>,
    pub mail: MailConfig,
    /// Allowed CORS origins. Empty list means any origin.
    pub cors_origins: Vec<String>,
    pub tz_offset: FixedOffset,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: String,
    pub api_url: String,
    pub from: String,
    pub admin_email: Option<String>,
}

impl MailConfig {
    pub fn enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:reserve.db?mode=rwc".into());
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());
        let session_secret = std::env::var("SESSION_SECRET").unwrap_or_default();

        let tz_hours = match std::env::var("TZ_OFFSET_HOURS") {
            Ok(raw) => raw
                .trim()
                .parse::<i32>()
                .map_err(|_| anyhow::anyhow!("TZ_OFFSET_HOURS must be an integer"))?,
            Err(_) => DEFAULT_TZ_OFFSET_HOURS,
        };
        let tz_offset = tz_offset(tz_hours)?;

        let cors_origins = std::env::var("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            host,
            port,
            session_secret,
            admin_login_id: non_empty_var("ADMIN_LOGIN_ID"),
            admin_password: non_empty_var("ADMIN_PASSWORD"),
            mail: MailConfig {
                api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
                api_url: std::env::var("MAIL_API_URL")
                    .unwrap_or_else(|_| DEFAULT_MAIL_API_URL.into()),
                from: std::env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "noreply@example.com".into()),
                admin_email: non_empty_var("ADMIN_EMAIL"),
            },
            cors_origins,
            tz_offset,
        })
    }

    /// Current date in the clinic's timezone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz_offset).date_naive()
    }

    pub fn auth_configured(&self) -> bool {
        !self.session_secret.is_empty()
    }
}

/// Whole-hour UTC offset, limited to the offsets in real use.
fn tz_offset(hours: i32) -> anyhow::Result<FixedOffset> {
    if !(-12..=14).contains(&hours) {
        anyhow::bail!("TZ_OFFSET_HOURS out of range: {}", hours);
    }
    FixedOffset::east_opt(hours * 3600)
        .ok_or_else(|| anyhow::anyhow!("TZ_OFFSET_HOURS out of range: {}", hours))
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
impl Config {
    /// In-memory configuration used by tests across the crate.
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            host: "127.0.0.1".into(),
            port: "0".into(),
            session_secret: "test-session-secret".into(),
            admin_login_id: Some("admin".into()),
            admin_password: Some("correct horse battery".into()),
            mail: MailConfig {
                api_key: String::new(),
                api_url: "http://127.0.0.1:1/emails".into(),
                from: "noreply@example.com".into(),
                admin_email: None,
            },
            cors_origins: Vec::new(),
            tz_offset: FixedOffset::east_opt(DEFAULT_TZ_OFFSET_HOURS * 3600).unwrap(),
        }
    }
}
