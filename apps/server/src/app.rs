use axum::{
    http::{HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers::{admin, health, public};
use crate::rate_limit::{limit, RateLimiter, Tier};
use crate::AppState;

fn cors(config: &Config) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if config.cors_origins.is_empty() {
        return base.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}

/// The full HTTP surface, one route group per rate-limit tier.
pub fn router(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    let ops_routes = Router::new().route("/api/health", get(health::health));

    let public_routes = Router::new()
        .route("/api/public/plans", get(public::list_plans))
        .route("/api/public/availability", get(public::availability))
        .layer(from_fn_with_state(limiter.layer_state(Tier::Public), limit));

    let booking_routes = Router::new()
        .route("/api/public/reserve", post(public::reserve))
        .layer(from_fn_with_state(limiter.layer_state(Tier::Booking), limit));

    let lookup_routes = Router::new()
        .route("/api/public/reserve/check", post(public::check))
        .route("/api/public/reserve/cancel", post(public::cancel))
        .layer(from_fn_with_state(limiter.layer_state(Tier::Lookup), limit));

    let login_routes = Router::new()
        .route("/api/admin/auth/login", post(admin::login))
        .layer(from_fn_with_state(limiter.layer_state(Tier::Login), limit));

    let admin_routes = Router::new()
        .route(
            "/api/admin/blocked-slots",
            get(admin::list_blocked_slots)
                .post(admin::create_blocked_slot)
                .patch(admin::bulk_update_blocked_slots)
                .delete(admin::delete_blocked_slot),
        )
        .route("/api/admin/reservations", get(admin::list_reservations))
        .route(
            "/api/admin/reservations/export",
            get(admin::export_reservations),
        )
        .route(
            "/api/admin/reservations/{number}/cancel",
            post(admin::cancel_reservation),
        )
        .route(
            "/api/admin/plans",
            get(admin::list_plans).post(admin::create_plan),
        )
        .route("/api/admin/plans/{id}", patch(admin::update_plan))
        .route("/api/admin/dashboard", get(admin::dashboard))
        .layer(from_fn_with_state(limiter.layer_state(Tier::Admin), limit));

    Router::new()
        .merge(ops_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(lookup_routes)
        .merge(login_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors(&state.config))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sign_token;
    use crate::rate_limit::RateLimitConfig;
    use crate::test_support::test_state;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> Router {
        router(test_state().await, RateLimiter::new())
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut b = Request::builder().uri(uri);
        if let Some(t) = token {
            b = b.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        b.body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut b = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(t) = token {
            b = b.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        b.body(Body::from(body.to_string())).unwrap()
    }

    fn reservation_body(date: &str, time: &str) -> Value {
        json!({
            "planId": 1,
            "date": date,
            "time": time,
            "customer": {
                "name": "Hanako Yamada",
                "email": "hanako@example.com",
                "phone": "090-1234-5678"
            },
            "notes": "First visit"
        })
    }

    async fn login_token(app: &Router) -> String {
        let (status, body) = send(
            app,
            json_req(
                "POST",
                "/api/admin/auth/login",
                None,
                json!({"loginId": "admin", "password": "correct horse battery"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_reports_services() {
        let app = app().await;
        let (status, body) = send(&app, get_req("/api/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["services"]["database"], "ok");
        assert_eq!(body["services"]["email"], "not_configured");
        assert!(body["uptimeSecs"].is_u64());
    }

    #[tokio::test]
    async fn test_health_unavailable_without_session_secret() {
        let mut config = Config::for_tests();
        config.session_secret.clear();
        let state = crate::test_support::test_state_with(config).await;
        let app = router(state, RateLimiter::new());
        let (status, body) = send(&app, get_req("/api/health", None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["services"]["auth"], "not_configured");
    }

    #[tokio::test]
    async fn test_public_plans() {
        let app = app().await;
        let (status, body) = send(&app, get_req("/api/public/plans", None)).await;
        assert_eq!(status, StatusCode::OK);
        let plans = body["data"].as_array().unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0]["displayName"], "Initial consultation");
    }

    #[tokio::test]
    async fn test_reserve_then_repeat_is_conflict() {
        let app = app().await;
        let (status, body) = send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2025-09-30", "14:00")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let number = body["data"]["reservationNumber"].as_str().unwrap();
        assert!(!number.is_empty());

        let (status, body) = send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2025-09-30", "14:00")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "SLOT_NOT_AVAILABLE");

        let (_, body) = send(
            &app,
            get_req("/api/public/availability?date=2025-09-30&planId=1", None),
        )
        .await;
        let day = &body["data"]["2025-09-30"];
        assert_eq!(day["14:00"], json!({"available": false, "reason": "booked"}));
        assert_eq!(day["15:00"], json!({"available": true}));
    }

    #[tokio::test]
    async fn test_availability_requires_params() {
        let app = app().await;
        let (status, body) = send(&app, get_req("/api/public/availability?date=2025-09-30", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            get_req("/api/public/availability?date=2025-02-30&planId=1", None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_is_validation_error() {
        let app = app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/public/reserve")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_check_and_cancel_flow() {
        let state = test_state().await;
        let date = (state.config.today() + chrono::Duration::days(10))
            .format("%Y-%m-%d")
            .to_string();
        let app = router(state, RateLimiter::new());

        let (_, body) = send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body(&date, "11:00")),
        )
        .await;
        let number = body["data"]["reservationNumber"].as_str().unwrap().to_string();
        let lookup = json!({"reservationNumber": number, "email": "hanako@example.com"});

        let (status, body) = send(
            &app,
            json_req("POST", "/api/public/reserve/check", None, lookup.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["date"], date.as_str());
        assert_eq!(body["data"]["time"], "11:00");
        assert_eq!(body["data"]["customerName"], "Hanako Yamada");

        let (status, _) = send(
            &app,
            json_req("POST", "/api/public/reserve/cancel", None, lookup.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            json_req("POST", "/api/public/reserve/cancel", None, lookup),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ALREADY_CANCELLED");
    }

    #[tokio::test]
    async fn test_check_unknown_reservation() {
        let app = app().await;
        let (status, body) = send(
            &app,
            json_req(
                "POST",
                "/api/public/reserve/check",
                None,
                json!({"reservationNumber": "R20250101-0001", "email": "a@b.co"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "RESERVATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = app().await;
        let (status, body) = send(&app, get_req("/api/admin/dashboard", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");

        let (status, body) = send(&app, get_req("/api/admin/dashboard", Some("garbage"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");

        let expired = sign_token(1, "admin", 1_000, b"test-session-secret");
        let (status, body) = send(&app, get_req("/api/admin/dashboard", Some(&expired))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "TOKEN_EXPIRED");
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password() {
        let app = app().await;
        let (status, body) = send(
            &app,
            json_req(
                "POST",
                "/api/admin/auth/login",
                None,
                json!({"loginId": "admin", "password": "nope"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_admin_dashboard_and_reservations() {
        let app = app().await;
        let token = login_token(&app).await;
        send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2025-09-30", "14:00")),
        )
        .await;

        let (status, body) = send(&app, get_req("/api/admin/dashboard", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["weeklyStats"]["totalReservations"].is_i64());

        let (status, body) = send(
            &app,
            get_req("/api/admin/reservations?page=1&limit=10&status=confirmed", Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["totalPages"], 1);
        assert_eq!(body["data"]["reservations"][0]["customerName"], "Hanako Yamada");
    }

    #[tokio::test]
    async fn test_admin_cancel_past_reservation() {
        let app = app().await;
        let token = login_token(&app).await;
        let (_, body) = send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2020-01-15", "14:00")),
        )
        .await;
        let number = body["data"]["reservationNumber"].as_str().unwrap().to_string();

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/admin/reservations/{}/cancel", number))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "PAST_RESERVATION");
    }

    #[tokio::test]
    async fn test_export_csv() {
        let app = app().await;
        let token = login_token(&app).await;
        send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2025-09-30", "14:00")),
        )
        .await;

        let resp = app
            .clone()
            .oneshot(get_req("/api/admin/reservations/export", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
        let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=\"reservations_"));
        assert!(headers[header::CACHE_CONTROL].to_str().unwrap().contains("no-cache"));

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.starts_with(b"\xEF\xBB\xBF"));
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"Confirmed\""));
    }

    #[tokio::test]
    async fn test_blocked_slot_endpoints() {
        let app = app().await;
        let token = login_token(&app).await;

        let (status, body) = send(
            &app,
            json_req(
                "POST",
                "/api/admin/blocked-slots",
                Some(&token),
                json!({"blockDate": "2025-09-30", "startTime": "13:00", "endTime": "15:00", "reason": "Holiday"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            json_req(
                "POST",
                "/api/admin/blocked-slots",
                Some(&token),
                json!({"blockDate": "2025-09-30", "startTime": "13:00", "endTime": "15:00"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "CONFLICT");

        let (status, body) = send(
            &app,
            json_req(
                "PATCH",
                "/api/admin/blocked-slots",
                Some(&token),
                json!({"year": 2025, "month": 10, "changes": {"1-11:00": "suspended", "1-12:00": "suspended"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"addedCount": 2, "removedCount": 0}));

        let (_, body) = send(
            &app,
            get_req("/api/admin/blocked-slots?startDate=2025-09-01&endDate=2025-09-30", Some(&token)),
        )
        .await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = send(
            &app,
            get_req("/api/public/availability?date=2025-09-30&planId=1", None),
        )
        .await;
        assert_eq!(body["data"]["2025-09-30"]["14:00"]["reason"], "Holiday");

        let delete = |id: i64| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/admin/blocked-slots?id={}", id))
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(&app, delete(id)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, delete(id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_plan_management() {
        let app = app().await;
        let token = login_token(&app).await;

        let (status, body) = send(
            &app,
            json_req(
                "POST",
                "/api/admin/plans",
                Some(&token),
                json!({"name": "premium", "displayName": "Premium course", "price": 12000}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["duration"], 60);
        assert_eq!(body["data"]["isActive"], true);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            json_req(
                "POST",
                "/api/admin/plans",
                Some(&token),
                json!({"name": "x", "displayName": "X", "price": 1_000_000}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            json_req(
                "PATCH",
                &format!("/api/admin/plans/{}", id),
                Some(&token),
                json!({"isActive": false}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["isActive"], false);
        assert_eq!(body["data"]["displayName"], "Premium course");
        assert_eq!(body["data"]["price"], 12000);

        let (status, body) = send(
            &app,
            json_req(
                "PATCH",
                &format!("/api/admin/plans/{}", id),
                Some(&token),
                json!({"description": "Ninety minutes", "price": null}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["description"], "Ninety minutes");
        assert!(body["data"]["price"].is_null());

        let (_, body) = send(
            &app,
            json_req(
                "PATCH",
                &format!("/api/admin/plans/{}", id),
                Some(&token),
                json!({"description": null}),
            ),
        )
        .await;
        assert!(body["data"]["description"].is_null());
        assert_eq!(body["data"]["displayName"], "Premium course");

        let (_, body) = send(&app, get_req("/api/public/plans", None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        let (_, body) = send(&app, get_req("/api/admin/plans", Some(&token))).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        let (status, _) = send(
            &app,
            json_req("PATCH", "/api/admin/plans/999", Some(&token), json!({"price": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_booking_tier_is_rate_limited() {
        let limiter = RateLimiter::new();
        limiter.add_tier(Tier::Booking, RateLimitConfig::per(1, Duration::from_secs(60)));
        let app = router(test_state().await, limiter);

        let (status, _) = send(
            &app,
            json_req("POST", "/api/public/reserve", None, reservation_body("2025-09-30", "11:00")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(json_req(
                "POST",
                "/api/public/reserve",
                None,
                reservation_body("2025-09-30", "12:00"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));

        // other tiers unaffected
        let (status, _) = send(&app, get_req("/api/public/plans", None)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
