use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::{
    auth::{self, AdminSession},
    blackouts, csv_export,
    error::{ApiError, ApiResult},
    extract::{ApiJson, ApiQuery},
    models::*,
    reservations::{self, CancelledBy, ReservationFilter},
    validation, AppState,
};

const MAX_PRICE: i64 = 999_999;
const DEFAULT_DURATION: i64 = 60;

const PLAN_SELECT: &str = "SELECT id, name, display_name, description, price, duration, sort_order,
        is_active, created_at, updated_at
     FROM plans";

// ── Session ──

/// POST /api/admin/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> ApiResult<Json<ApiResponse<LoginResponse>>> {
    let login_id = body.login_id.as_deref().map(str::trim).unwrap_or_default();
    let password = body.password.as_deref().unwrap_or_default();
    if login_id.is_empty() || password.is_empty() {
        return Err(ApiError::validation("Login ID and password are required"));
    }
    let resp = auth::login(&state, login_id, password).await?;
    Ok(Json(ApiResponse::success(resp)))
}

// ── Blocked slots ──

/// GET /api/admin/blocked-slots?startDate&endDate
pub async fn list_blocked_slots(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<DateRangeQuery>,
) -> ApiResult<Json<ApiResponse<Vec<BlockedSlot>>>> {
    let rows = blackouts::list(
        &state.db,
        query.start_date.as_deref(),
        query.end_date.as_deref(),
    )
    .await?;
    Ok(Json(ApiResponse::success(rows)))
}

/// POST /api/admin/blocked-slots
pub async fn create_blocked_slot(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateBlockedSlotRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<BlockedSlot>>)> {
    let row = blackouts::create(&state, &body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(row))))
}

/// PATCH /api/admin/blocked-slots — bulk calendar toggle
pub async fn bulk_update_blocked_slots(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<BulkBlockRequest>,
) -> ApiResult<Json<ApiResponse<BulkBlockResult>>> {
    let result = blackouts::bulk_update(&state, &body).await?;
    Ok(Json(ApiResponse::success(result)))
}

/// DELETE /api/admin/blocked-slots?id=N
pub async fn delete_blocked_slot(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<IdQuery>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let id = query
        .id
        .ok_or_else(|| ApiError::validation("id is required"))?;
    blackouts::delete(&state, id).await?;
    Ok(Json(ApiResponse::message("Blocked slot removed")))
}

// ── Reservations ──

fn filter_from(query: &ReservationsQuery) -> ApiResult<ReservationFilter> {
    ReservationFilter::parse(
        query.status.as_deref(),
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        query.customer_name.as_deref(),
    )
}

/// GET /api/admin/reservations
pub async fn list_reservations(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ReservationsQuery>,
) -> ApiResult<Json<ApiResponse<ReservationPage>>> {
    let filter = filter_from(&query)?;
    let (page, limit) = reservations::page_bounds(query.page, query.limit);
    let result = reservations::list_page(&state.db, &filter, page, limit).await?;
    Ok(Json(ApiResponse::success(result)))
}

/// GET /api/admin/reservations/export — CSV download
pub async fn export_reservations(
    admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ReservationsQuery>,
) -> ApiResult<Response> {
    let filter = filter_from(&query)?;
    let rows = reservations::list_for_export(&state.db, &filter).await?;
    let csv = csv_export::render(&rows)
        .map_err(|e| ApiError::Server(format!("CSV export failed: {}", e)))?;

    tracing::info!("admin '{}' exported {} reservations", admin.login_id, rows.len());

    let disposition = format!(
        "attachment; filename=\"{}\"",
        csv_export::filename(state.config.today())
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        csv,
    )
        .into_response())
}

/// POST /api/admin/reservations/{number}/cancel — body `{reason?}` optional
pub async fn cancel_reservation(
    admin: AdminSession,
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<()>>> {
    let req: AdminCancelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AdminCancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| ApiError::validation("Request body is not valid JSON for this endpoint"))?
    };
    reservations::cancel(
        &state,
        number.trim(),
        CancelledBy::Admin {
            login_id: &admin.login_id,
        },
        req.reason.as_deref(),
    )
    .await?;
    Ok(Json(ApiResponse::message("Reservation cancelled")))
}

// ── Plans ──

fn check_price(price: Option<i64>) -> ApiResult<()> {
    match price {
        Some(p) if !(0..=MAX_PRICE).contains(&p) => Err(ApiError::validation(format!(
            "Price must be between 0 and {}",
            MAX_PRICE
        ))),
        _ => Ok(()),
    }
}

fn check_duration(duration: Option<i64>) -> ApiResult<()> {
    match duration {
        Some(d) if d <= 0 => Err(ApiError::validation("Duration must be positive")),
        _ => Ok(()),
    }
}

fn non_empty(value: Option<&str>, field: &str) -> ApiResult<Option<String>> {
    match value.map(validation::sanitize) {
        Some(v) if v.is_empty() => Err(ApiError::validation(format!("{} cannot be empty", field))),
        other => Ok(other),
    }
}

async fn fetch_plan(state: &AppState, id: i64) -> ApiResult<Plan> {
    sqlx::query_as::<_, Plan>(&format!("{} WHERE id = ?", PLAN_SELECT))
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("Plan not found".into()))
}

/// GET /api/admin/plans — all plans, including inactive
pub async fn list_plans(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ApiResponse<Vec<Plan>>>> {
    let plans = sqlx::query_as::<_, Plan>(&format!(
        "{} ORDER BY sort_order ASC, created_at ASC",
        PLAN_SELECT
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(plans)))
}

/// POST /api/admin/plans
pub async fn create_plan(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreatePlanRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Plan>>)> {
    let (Some(name), Some(display_name)) = (
        non_empty(body.name.as_deref(), "Name")?,
        non_empty(body.display_name.as_deref(), "Display name")?,
    ) else {
        return Err(ApiError::validation("Name and display name are required"));
    };
    check_price(body.price)?;
    check_duration(body.duration)?;

    let id = sqlx::query(
        "INSERT INTO plans (name, display_name, description, price, duration, sort_order, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&name)
    .bind(&display_name)
    .bind(body.description.as_deref().map(validation::sanitize))
    .bind(body.price)
    .bind(body.duration.unwrap_or(DEFAULT_DURATION))
    .bind(body.sort_order.unwrap_or(0))
    .bind(body.is_active.unwrap_or(true))
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    tracing::info!("plan {} '{}' created", id, name);
    let plan = fetch_plan(&state, id).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(plan))))
}

/// PATCH /api/admin/plans/{id} — partial update
pub async fn update_plan(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdatePlanRequest>,
) -> ApiResult<Json<ApiResponse<Plan>>> {
    let name = non_empty(body.name.as_deref(), "Name")?;
    let display_name = non_empty(body.display_name.as_deref(), "Display name")?;
    check_price(body.price.flatten())?;
    check_duration(body.duration)?;
    let description = body
        .description
        .as_ref()
        .map(|d| d.as_deref().map(validation::sanitize));

    // CASE flags let an explicit null clear description and price.
    let affected = sqlx::query(
        "UPDATE plans SET
            name = COALESCE(?, name),
            display_name = COALESCE(?, display_name),
            description = CASE WHEN ? THEN ? ELSE description END,
            price = CASE WHEN ? THEN ? ELSE price END,
            duration = COALESCE(?, duration),
            sort_order = COALESCE(?, sort_order),
            is_active = COALESCE(?, is_active),
            updated_at = datetime('now')
         WHERE id = ?",
    )
    .bind(name)
    .bind(display_name)
    .bind(description.is_some())
    .bind(description.flatten())
    .bind(body.price.is_some())
    .bind(body.price.flatten())
    .bind(body.duration)
    .bind(body.sort_order)
    .bind(body.is_active)
    .bind(id)
    .execute(&state.db)
    .await?
    .rows_affected();
    if affected == 0 {
        return Err(ApiError::NotFound("Plan not found".into()));
    }

    tracing::info!("plan {} updated", id);
    let plan = fetch_plan(&state, id).await?;
    Ok(Json(ApiResponse::success(plan)))
}

// ── Dashboard ──

/// GET /api/admin/dashboard
pub async fn dashboard(
    _admin: AdminSession,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ApiResponse<Dashboard>>> {
    let data = reservations::dashboard(&state.db, state.config.today()).await?;
    Ok(Json(ApiResponse::success(data)))
}
