use axum::{extract::State, http::StatusCode, Json};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    availability,
    error::{ApiError, ApiResult},
    extract::{ApiJson, ApiQuery},
    models::*,
    reservations::{self, CancelledBy},
    validation, AppState,
};

const PLAN_SELECT: &str = "SELECT id, name, display_name, description, price, duration, sort_order,
        is_active, created_at, updated_at
     FROM plans";

/// GET /api/public/plans — active plans in display order
pub async fn list_plans(State(state): State<Arc<AppState>>) -> ApiResult<Json<ApiResponse<Vec<Plan>>>> {
    let plans = sqlx::query_as::<_, Plan>(&format!(
        "{} WHERE is_active = 1 ORDER BY sort_order ASC, id ASC",
        PLAN_SELECT
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(plans)))
}

/// GET /api/public/availability?date=YYYY-MM-DD&planId=N
pub async fn availability(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<AvailabilityQuery>,
) -> ApiResult<Json<ApiResponse<BTreeMap<String, DayAvailability>>>> {
    let (Some(date), Some(plan_id)) = (query.date.as_deref(), query.plan_id.as_deref()) else {
        return Err(ApiError::validation("date and planId are required"));
    };
    if plan_id.trim().parse::<i64>().is_err() {
        return Err(ApiError::validation("planId must be a number"));
    }
    let date = validation::parse_date(date)?.format("%Y-%m-%d").to_string();

    let day = availability::for_date(&state, &date).await;
    let mut body = BTreeMap::new();
    body.insert(date, day);
    Ok(Json(ApiResponse::success(body)))
}

/// POST /api/public/reserve
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ReserveRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<ReserveResponse>>)> {
    let reservation_number = reservations::create(&state, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(
            ReserveResponse { reservation_number },
            "Reservation confirmed",
        )),
    ))
}

/// POST /api/public/reserve/check
pub async fn check(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<LookupRequest>,
) -> ApiResult<Json<ApiResponse<ReservationDetail>>> {
    let (number, email) =
        validation::validate_lookup(body.reservation_number.as_deref(), body.email.as_deref())?;
    let detail = reservations::check(&state.db, &number, &email).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// POST /api/public/reserve/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CancelRequest>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let (number, email) =
        validation::validate_lookup(body.reservation_number.as_deref(), body.email.as_deref())?;
    reservations::cancel(
        &state,
        &number,
        CancelledBy::Customer { email: &email },
        body.reason.as_deref(),
    )
    .await?;
    Ok(Json(ApiResponse::message("Reservation cancelled")))
}
