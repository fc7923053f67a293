use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    models::{Admin, AdminInfo, LoginResponse},
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of an admin bearer token.
const TOKEN_TTL_HOURS: i64 = 8;
const TOKEN_TTL_LABEL: &str = "8h";

pub fn hash_password(password: &str) -> Result<String, password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub admin_id: i64,
    pub login_id: String,
    pub exp: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    Invalid,
    Expired,
}

fn mac_for(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take key of any size")
}

/// Token layout: `hex(payload).hex(hmac_sha256(payload))`,
/// payload = `<admin_id>|<exp_unix>|<login_id>`.
pub fn sign_token(admin_id: i64, login_id: &str, exp: i64, key: &[u8]) -> String {
    let payload = format!("{}|{}|{}", admin_id, exp, login_id);
    let mut mac = mac_for(key);
    mac.update(payload.as_bytes());
    let sig = mac.finalize().into_bytes();
    format!("{}.{}", hex::encode(payload.as_bytes()), hex::encode(sig))
}

pub fn verify_token(token: &str, key: &[u8], now: i64) -> Result<TokenClaims, TokenError> {
    let (payload_hex, sig_hex) = token.split_once('.').ok_or(TokenError::Invalid)?;
    let payload = hex::decode(payload_hex).map_err(|_| TokenError::Invalid)?;
    let sig = hex::decode(sig_hex).map_err(|_| TokenError::Invalid)?;

    let mut mac = mac_for(key);
    mac.update(&payload);
    mac.verify_slice(&sig).map_err(|_| TokenError::Invalid)?;

    let payload = String::from_utf8(payload).map_err(|_| TokenError::Invalid)?;
    let mut parts = payload.splitn(3, '|');
    let admin_id = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or(TokenError::Invalid)?;
    let exp = parts
        .next()
        .and_then(|p| p.parse::<i64>().ok())
        .ok_or(TokenError::Invalid)?;
    let login_id = parts.next().ok_or(TokenError::Invalid)?.to_string();

    if now > exp {
        return Err(TokenError::Expired);
    }
    Ok(TokenClaims {
        admin_id,
        login_id,
        exp,
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn find_active_admin_by_login(db: &SqlitePool, login_id: &str) -> ApiResult<Option<Admin>> {
    let admin = sqlx::query_as::<_, Admin>(
        "SELECT id, login_id, password_hash, is_active FROM admins
         WHERE login_id = ? AND is_active = 1",
    )
    .bind(login_id)
    .fetch_optional(db)
    .await?;
    Ok(admin)
}

/// Verifies credentials and issues a bearer token.
pub async fn login(state: &AppState, login_id: &str, password: &str) -> ApiResult<LoginResponse> {
    if !state.config.auth_configured() {
        tracing::error!("login attempted but SESSION_SECRET is not configured");
        return Err(ApiError::Server(
            "Admin authentication is not configured".into(),
        ));
    }

    let invalid = || ApiError::Unauthorized("Invalid login ID or password".into());
    let admin = find_active_admin_by_login(&state.db, login_id)
        .await?
        .ok_or_else(invalid)?;

    let password = password.to_string();
    let hash = admin.password_hash.clone();
    let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::Server(format!("password check failed: {}", e)))?;
    if !ok {
        tracing::warn!("failed admin login for '{}'", login_id);
        return Err(invalid());
    }

    let exp = (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp();
    let token = sign_token(
        admin.id,
        &admin.login_id,
        exp,
        state.config.session_secret.as_bytes(),
    );
    tracing::info!("admin '{}' logged in", admin.login_id);

    Ok(LoginResponse {
        token,
        admin: AdminInfo {
            id: admin.id,
            login_id: admin.login_id,
        },
        expires_in: TOKEN_TTL_LABEL,
    })
}

/// Extractor for admin-only handlers.
///
/// Verifies the bearer token and re-checks on every request that the admin
/// still exists and is active.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub admin_id: i64,
    pub login_id: String,
}

impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))?;

        if !state.config.auth_configured() {
            return Err(ApiError::Unauthorized("Authentication required".into()));
        }

        let claims = verify_token(
            token,
            state.config.session_secret.as_bytes(),
            Utc::now().timestamp(),
        )
        .map_err(|e| match e {
            TokenError::Expired => ApiError::TokenExpired,
            TokenError::Invalid => ApiError::Unauthorized("Invalid session token".into()),
        })?;

        let active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM admins WHERE id = ?")
                .bind(claims.admin_id)
                .fetch_optional(&state.db)
                .await?;
        if active != Some(true) {
            tracing::warn!("token for inactive or missing admin {}", claims.admin_id);
            return Err(ApiError::Unauthorized("Authentication required".into()));
        }

        Ok(AdminSession {
            admin_id: claims.admin_id,
            login_id: claims.login_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    const KEY: &[u8] = b"unit-test-key";

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_token_round_trip() {
        let token = sign_token(7, "front|desk", 2_000, KEY);
        let claims = verify_token(&token, KEY, 1_000).unwrap();
        assert_eq!(
            claims,
            TokenClaims {
                admin_id: 7,
                login_id: "front|desk".into(),
                exp: 2_000,
            }
        );
    }

    #[test]
    fn test_token_expired() {
        let token = sign_token(7, "admin", 1_000, KEY);
        assert_eq!(verify_token(&token, KEY, 1_001), Err(TokenError::Expired));
    }

    #[test]
    fn test_token_wrong_key() {
        let token = sign_token(7, "admin", 2_000, KEY);
        assert_eq!(
            verify_token(&token, b"other", 1_000),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_token_tampered_payload() {
        let token = sign_token(7, "admin", 2_000, KEY);
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", hex::encode("1|9999999999|admin"), sig);
        assert_eq!(verify_token(&forged, KEY, 1_000), Err(TokenError::Invalid));
    }

    #[test]
    fn test_token_garbage() {
        assert_eq!(verify_token("abc", KEY, 0), Err(TokenError::Invalid));
        assert_eq!(verify_token("zz.zz", KEY, 0), Err(TokenError::Invalid));
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let state = test_state().await;
        let resp = login(&state, "admin", "correct horse battery").await.unwrap();
        assert_eq!(resp.admin.login_id, "admin");
        assert_eq!(resp.expires_in, "8h");

        let err = login(&state, "admin", "wrong").await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        let err = login(&state, "nobody", "x").await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_login_rejected_for_inactive_admin() {
        let state = test_state().await;
        sqlx::query("UPDATE admins SET is_active = 0")
            .execute(&state.db)
            .await
            .unwrap();
        let err = login(&state, "admin", "correct horse battery")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }
}
