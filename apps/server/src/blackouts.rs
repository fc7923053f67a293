use chrono::{Datelike, NaiveDate};
use sqlx::SqlitePool;

use crate::error::{ApiError, ApiResult};
use crate::models::{BlockedSlot, BulkBlockRequest, BulkBlockResult, CreateBlockedSlotRequest};
use crate::validation::{self, parse_date, parse_time};
use crate::{availability, slots, AppState};

/// Reason stored for cells suspended from the admin calendar.
pub const BULK_REASON: &str = "suspended by admin";

const SELECT: &str = "SELECT id, block_date, start_time, end_time, reason, created_at FROM blocked_slots";

pub async fn list(
    db: &SqlitePool,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> ApiResult<Vec<BlockedSlot>> {
    let start = start_date
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_date)
        .transpose()?;
    let end = end_date
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_date)
        .transpose()?;

    let sql = format!(
        "{} WHERE (?1 IS NULL OR block_date >= ?1) AND (?2 IS NULL OR block_date <= ?2)
         ORDER BY block_date, start_time",
        SELECT
    );
    let rows = sqlx::query_as::<_, BlockedSlot>(&sql)
        .bind(start.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(end.map(|d| d.format("%Y-%m-%d").to_string()))
        .fetch_all(db)
        .await?;
    Ok(rows)
}

pub async fn create(state: &AppState, req: &CreateBlockedSlotRequest) -> ApiResult<BlockedSlot> {
    let (Some(date), Some(start), Some(end)) = (
        req.block_date.as_deref(),
        req.start_time.as_deref(),
        req.end_time.as_deref(),
    ) else {
        return Err(ApiError::validation("Date, start time and end time are required"));
    };
    let date = parse_date(date)?.format("%Y-%m-%d").to_string();
    let start = parse_time(start)?;
    let end = parse_time(end)?;
    if start >= end {
        return Err(ApiError::validation("Start time must be before end time"));
    }
    let reason = req
        .reason
        .as_deref()
        .map(validation::sanitize)
        .unwrap_or_default();

    let existing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM blocked_slots WHERE block_date = ? AND start_time = ? AND end_time = ?",
    )
    .bind(&date)
    .bind(&start)
    .bind(&end)
    .fetch_one(&state.db)
    .await?;
    if existing > 0 {
        return Err(ApiError::Conflict(
            "This time range is already blocked".into(),
        ));
    }

    let id = sqlx::query(
        "INSERT INTO blocked_slots (block_date, start_time, end_time, reason) VALUES (?, ?, ?, ?)",
    )
    .bind(&date)
    .bind(&start)
    .bind(&end)
    .bind(&reason)
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    availability::invalidate(state);
    tracing::info!("blocked {} {}-{}", date, start, end);

    let row = sqlx::query_as::<_, BlockedSlot>(&format!("{} WHERE id = ?", SELECT))
        .bind(id)
        .fetch_one(&state.db)
        .await?;
    Ok(row)
}

pub async fn delete(state: &AppState, id: i64) -> ApiResult<()> {
    let affected = sqlx::query("DELETE FROM blocked_slots WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(ApiError::NotFound("Blocked slot not found".into()));
    }
    availability::invalidate(state);
    tracing::info!("unblocked slot {}", id);
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum CellChange {
    Suspend,
    Release,
}

#[derive(Debug, PartialEq, Eq)]
struct Cell {
    date: String,
    start: String,
    end: String,
    change: CellChange,
}

/// Parses a calendar key `"<day>-<HH:MM>"` in the given month.
fn parse_cell(year: i32, month: u32, key: &str, value: &str) -> ApiResult<Cell> {
    let bad_key = || ApiError::validation(format!("Invalid slot key '{}'", key));

    let (day, time) = key.split_once('-').ok_or_else(bad_key)?;
    let day: u32 = day.trim().parse().map_err(|_| bad_key())?;
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad_key)?;
    let start = parse_time(time).map_err(|_| bad_key())?;
    if !slots::is_grid_slot(&start) {
        return Err(bad_key());
    }
    let end = slots::slot_end(&start).ok_or_else(bad_key)?;

    let change = match value {
        "suspended" => CellChange::Suspend,
        "available" => CellChange::Release,
        other => {
            return Err(ApiError::validation(format!(
                "Invalid status '{}' for {}; expected suspended or available",
                other, key
            )))
        }
    };

    Ok(Cell {
        date: date.format("%Y-%m-%d").to_string(),
        start,
        end,
        change,
    })
}

/// Applies a batch of calendar toggles atomically.
///
/// Every key is validated before anything is written; one bad key rejects the
/// whole batch.
pub async fn bulk_update(state: &AppState, req: &BulkBlockRequest) -> ApiResult<BulkBlockResult> {
    let year = req.year.unwrap_or_else(|| state.config.today().year());
    let month = req
        .month
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| ApiError::validation("month must be between 1 and 12"))?;
    let changes = req
        .changes
        .as_ref()
        .ok_or_else(|| ApiError::validation("changes is required"))?;

    let cells = changes
        .iter()
        .map(|(key, value)| parse_cell(year, month, key, value))
        .collect::<ApiResult<Vec<_>>>()?;

    let mut tx = state.db.begin_with("BEGIN IMMEDIATE").await?;
    let mut result = BulkBlockResult {
        added_count: 0,
        removed_count: 0,
    };

    for cell in &cells {
        match cell.change {
            CellChange::Suspend => {
                let exists: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM blocked_slots WHERE block_date = ? AND start_time = ? AND end_time = ?",
                )
                .bind(&cell.date)
                .bind(&cell.start)
                .bind(&cell.end)
                .fetch_one(&mut *tx)
                .await?;
                if exists == 0 {
                    sqlx::query(
                        "INSERT INTO blocked_slots (block_date, start_time, end_time, reason) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&cell.date)
                    .bind(&cell.start)
                    .bind(&cell.end)
                    .bind(BULK_REASON)
                    .execute(&mut *tx)
                    .await?;
                    result.added_count += 1;
                }
            }
            CellChange::Release => {
                result.removed_count += sqlx::query(
                    "DELETE FROM blocked_slots
                     WHERE block_date = ? AND start_time = ? AND end_time = ?",
                )
                .bind(&cell.date)
                .bind(&cell.start)
                .bind(&cell.end)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
        }
    }

    tx.commit().await?;
    availability::invalidate(state);
    tracing::info!(
        "bulk blackout update {}-{:02}: +{} -{}",
        year,
        month,
        result.added_count,
        result.removed_count
    );
    Ok(result)
}
