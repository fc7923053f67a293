use sqlx::SqlitePool;

use crate::models::{DayAvailability, SlotStatus};
use crate::{slots, AppState};

/// Substring shared by every availability cache key.
pub const CACHE_SCOPE: &str = "availability";

const REASON_BOOKED: &str = "booked";
const REASON_BLOCKED: &str = "blocked";
const REASON_SYSTEM_ERROR: &str = "system error";

pub fn cache_key(date: &str) -> String {
    format!("{}:{}", CACHE_SCOPE, date)
}

async fn slot_status(db: &SqlitePool, date: &str, slot: &str) -> Result<SlotStatus, sqlx::Error> {
    let booked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservations
         WHERE reservation_date = ? AND start_time = ? AND status = 'confirmed'",
    )
    .bind(date)
    .bind(slot)
    .fetch_one(db)
    .await?;
    if booked > 0 {
        return Ok(SlotStatus {
            available: false,
            reason: Some(REASON_BOOKED.into()),
        });
    }

    let blocked: Option<String> = sqlx::query_scalar(
        "SELECT reason FROM blocked_slots
         WHERE block_date = ? AND start_time <= ? AND end_time > ?
         ORDER BY id LIMIT 1",
    )
    .bind(date)
    .bind(slot)
    .bind(slot)
    .fetch_optional(db)
    .await?;

    Ok(match blocked {
        Some(reason) => SlotStatus {
            available: false,
            reason: Some(if reason.trim().is_empty() {
                REASON_BLOCKED.into()
            } else {
                reason
            }),
        },
        None => SlotStatus {
            available: true,
            reason: None,
        },
    })
}

/// Status of every grid slot on `date` (`YYYY-MM-DD`).
///
/// Slots are looked up one by one; a failed lookup marks only that slot
/// unavailable. Not atomic across the grid, bookings re-check under a lock.
pub async fn compute(db: &SqlitePool, date: &str) -> DayAvailability {
    let mut day = DayAvailability::new();
    for slot in slots::grid() {
        let status = match slot_status(db, date, &slot).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("availability lookup failed for {} {}: {}", date, slot, e);
                SlotStatus {
                    available: false,
                    reason: Some(REASON_SYSTEM_ERROR.into()),
                }
            }
        };
        day.insert(slot, status);
    }
    day
}

/// Cached [`compute`]. Days containing a failed lookup are not cached.
pub async fn for_date(state: &AppState, date: &str) -> DayAvailability {
    let key = cache_key(date);
    if let Some(hit) = state.availability.get(&key) {
        tracing::debug!("availability cache hit for {}", date);
        return hit;
    }

    let generation = state.availability.generation();
    let day = compute(&state.db, date).await;
    store(state, date, &day, generation);
    day
}

/// Caches `day` unless it is degraded or a write invalidated the cache after
/// `generation` was read.
fn store(state: &AppState, date: &str, day: &DayAvailability, generation: u64) -> bool {
    let degraded = day
        .values()
        .any(|s| s.reason.as_deref() == Some(REASON_SYSTEM_ERROR));
    if degraded {
        return false;
    }
    let stored = state
        .availability
        .insert_if_current(cache_key(date), day.clone(), generation);
    if !stored {
        tracing::debug!("availability for {} changed while computing, not cached", date);
    }
    stored
}

/// Drops all cached availability after a write.
pub fn invalidate(state: &AppState) {
    let removed = state.availability.invalidate(CACHE_SCOPE);
    if removed > 0 {
        tracing::debug!("invalidated {} cached availability entries", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    async fn book(db: &SqlitePool, number: &str, date: &str, time: &str, status: &str) {
        sqlx::query(
            "INSERT OR IGNORE INTO customers (id, name, email, phone)
             VALUES (1, 'Aoi', 'aoi@example.com', '0900000000')",
        )
        .execute(db)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO reservations
             (reservation_number, customer_id, plan_id, reservation_date, start_time, end_time, status)
             VALUES (?, 1, 1, ?, ?, ?, ?)",
        )
        .bind(number)
        .bind(date)
        .bind(time)
        .bind(slots::slot_end(time).unwrap())
        .bind(status)
        .execute(db)
        .await
        .unwrap();
    }

    async fn block(db: &SqlitePool, date: &str, start: &str, end: &str, reason: &str) {
        sqlx::query(
            "INSERT INTO blocked_slots (block_date, start_time, end_time, reason) VALUES (?, ?, ?, ?)",
        )
        .bind(date)
        .bind(start)
        .bind(end)
        .bind(reason)
        .execute(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_empty_day_is_fully_available() {
        let state = test_state().await;
        let day = compute(&state.db, "2025-09-30").await;
        assert_eq!(day.keys().cloned().collect::<Vec<_>>(), slots::grid());
        assert!(day.values().all(|s| s.available && s.reason.is_none()));
    }

    #[tokio::test]
    async fn test_booked_slot_is_unavailable() {
        let state = test_state().await;
        book(&state.db, "R1", "2025-09-30", "14:00", "confirmed").await;
        book(&state.db, "R2", "2025-09-30", "15:00", "cancelled").await;

        let day = compute(&state.db, "2025-09-30").await;
        assert_eq!(day["14:00"].reason.as_deref(), Some("booked"));
        assert!(day["15:00"].available);
        assert!(compute(&state.db, "2025-10-01").await["14:00"].available);
    }

    #[tokio::test]
    async fn test_booking_takes_precedence_over_blackout() {
        let state = test_state().await;
        book(&state.db, "R1", "2025-09-30", "14:00", "confirmed").await;
        block(&state.db, "2025-09-30", "13:00", "16:00", "staff training").await;

        let day = compute(&state.db, "2025-09-30").await;
        assert_eq!(day["13:00"].reason.as_deref(), Some("staff training"));
        assert_eq!(day["14:00"].reason.as_deref(), Some("booked"));
        assert_eq!(day["15:00"].reason.as_deref(), Some("staff training"));
        // end is exclusive
        assert!(day["16:00"].available);
        assert!(day["12:00"].available);
    }

    #[tokio::test]
    async fn test_blank_blackout_reason_defaults() {
        let state = test_state().await;
        block(&state.db, "2025-09-30", "11:00", "12:00", "").await;
        let day = compute(&state.db, "2025-09-30").await;
        assert_eq!(
            day["11:00"],
            SlotStatus {
                available: false,
                reason: Some("blocked".into())
            }
        );
    }

    #[tokio::test]
    async fn test_grid_shape_independent_of_data() {
        let state = test_state().await;
        block(&state.db, "2025-09-30", "09:00", "23:00", "closed").await;
        block(&state.db, "2025-09-30", "10:30", "11:30", "odd").await;
        let day = compute(&state.db, "2025-09-30").await;
        assert_eq!(day.len(), slots::grid().len());
        assert!(day.values().all(|s| !s.available));
    }

    #[tokio::test]
    async fn test_failed_lookup_marks_system_error() {
        let state = test_state().await;
        sqlx::query("DROP TABLE blocked_slots")
            .execute(&state.db)
            .await
            .unwrap();

        let day = for_date(&state, "2025-09-30").await;
        assert_eq!(day.len(), slots::grid().len());
        assert!(day
            .values()
            .all(|s| !s.available && s.reason.as_deref() == Some("system error")));
        assert_eq!(state.availability.len(), 0);
    }

    #[tokio::test]
    async fn test_write_during_compute_is_not_cached() {
        let state = test_state().await;
        let generation = state.availability.generation();
        let stale = compute(&state.db, "2025-09-30").await;
        assert!(stale["14:00"].available);

        book(&state.db, "R1", "2025-09-30", "14:00", "confirmed").await;
        invalidate(&state);

        assert!(!store(&state, "2025-09-30", &stale, generation));
        assert_eq!(state.availability.len(), 0);
        assert_eq!(
            for_date(&state, "2025-09-30").await["14:00"].reason.as_deref(),
            Some("booked")
        );
    }

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let state = test_state().await;
        assert!(for_date(&state, "2025-09-30").await["14:00"].available);

        book(&state.db, "R1", "2025-09-30", "14:00", "confirmed").await;
        // stale read served from cache
        assert!(for_date(&state, "2025-09-30").await["14:00"].available);

        invalidate(&state);
        assert!(!for_date(&state, "2025-09-30").await["14:00"].available);
    }
}
