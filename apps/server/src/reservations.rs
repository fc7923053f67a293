use chrono::{Datelike, Duration, NaiveDate};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{is_unique_violation, ApiError, ApiResult};
use crate::mailer::{self, BookingNotice};
use crate::models::*;
use crate::validation::{self, mask_email, ValidCustomer, ValidReservation};
use crate::{availability, AppState};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const RECENT_CUSTOMERS: i64 = 10;

/// `R` + `YYYYMMDD` + `-` + zero-padded daily sequence.
pub fn format_reservation_number(day: NaiveDate, seq: i64) -> String {
    format!("R{}-{:04}", day.format("%Y%m%d"), seq)
}

/// Next number for `day`. Must run inside the booking transaction.
async fn next_reservation_number(conn: &mut SqliteConnection, day: NaiveDate) -> ApiResult<String> {
    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO reservation_counters (day, seq) VALUES (?, 1)
         ON CONFLICT(day) DO UPDATE SET seq = seq + 1
         RETURNING seq",
    )
    .bind(day.format("%Y-%m-%d").to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(format_reservation_number(day, seq))
}

/// Finds the customer by phone and overwrites their details, or creates them.
async fn upsert_customer(conn: &mut SqliteConnection, c: &ValidCustomer) -> ApiResult<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO customers (name, name_kana, gender, birthdate, address, email, phone)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(phone) DO UPDATE SET
            name = excluded.name,
            name_kana = excluded.name_kana,
            gender = excluded.gender,
            birthdate = excluded.birthdate,
            address = excluded.address,
            email = excluded.email,
            updated_at = datetime('now')
         RETURNING id",
    )
    .bind(&c.name)
    .bind(&c.name_kana)
    .bind(&c.gender)
    .bind(&c.birthdate)
    .bind(&c.address)
    .bind(&c.email)
    .bind(&c.phone)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// True when a confirmed reservation or a blackout occupies the slot.
async fn slot_taken(conn: &mut SqliteConnection, date: &str, start: &str) -> ApiResult<bool> {
    let booked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservations
         WHERE reservation_date = ? AND start_time = ? AND status = 'confirmed'",
    )
    .bind(date)
    .bind(start)
    .fetch_one(&mut *conn)
    .await?;
    if booked > 0 {
        return Ok(true);
    }

    let blocked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM blocked_slots
         WHERE block_date = ? AND start_time <= ? AND end_time > ?",
    )
    .bind(date)
    .bind(start)
    .bind(start)
    .fetch_one(&mut *conn)
    .await?;
    Ok(blocked > 0)
}

/// Validates and books a reservation. Returns the reservation number.
///
/// The availability re-check, number generation and inserts all run inside one
/// `BEGIN IMMEDIATE` transaction, so concurrent attempts for the same slot are
/// serialised and only the first can commit.
pub async fn create(state: &AppState, req: &ReserveRequest) -> ApiResult<String> {
    let v = validation::validate_reservation(req)?;
    let date = v.date_string();

    let mut tx = state.db.begin_with("BEGIN IMMEDIATE").await?;

    let plan: Option<(String, bool)> =
        sqlx::query_as("SELECT display_name, is_active FROM plans WHERE id = ?")
            .bind(v.plan_id)
            .fetch_optional(&mut *tx)
            .await?;
    let plan_name = match plan {
        Some((name, true)) => name,
        _ => return Err(ApiError::validation("Selected plan is not available")),
    };

    if slot_taken(&mut tx, &date, &v.start_time).await? {
        tracing::info!("slot {} {} already taken", date, v.start_time);
        return Err(ApiError::SlotNotAvailable);
    }

    let customer_id = upsert_customer(&mut tx, &v.customer).await?;
    let number = next_reservation_number(&mut tx, state.config.today()).await?;

    let reservation_id = sqlx::query(
        "INSERT INTO reservations
         (reservation_number, customer_id, plan_id, reservation_date, start_time, end_time, status, notes)
         VALUES (?, ?, ?, ?, ?, ?, 'confirmed', ?)",
    )
    .bind(&number)
    .bind(customer_id)
    .bind(v.plan_id)
    .bind(&date)
    .bind(&v.start_time)
    .bind(&v.end_time)
    .bind(&v.notes)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            tracing::warn!("unique index rejected booking {} {}", date, v.start_time);
            ApiError::SlotNotAvailable
        } else {
            ApiError::from(e)
        }
    })?
    .last_insert_rowid();

    if let Some(q) = &v.questionnaire {
        sqlx::query(
            "INSERT INTO questionnaires
             (reservation_id, symptoms, medical_history, current_medication, allergies, pregnancy, other_notes)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(reservation_id)
        .bind(&q.symptoms)
        .bind(&q.medical_history)
        .bind(&q.current_medication)
        .bind(&q.allergies)
        .bind(&q.pregnancy)
        .bind(&q.other_notes)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    availability::invalidate(state);

    tracing::info!(
        "reservation {} booked for {} {} ({})",
        number,
        date,
        v.start_time,
        mask_email(&v.customer.email)
    );

    notify_booked(state, &number, plan_name, &v);
    Ok(number)
}

fn notify_booked(state: &AppState, number: &str, plan_name: String, v: &ValidReservation) {
    let notice = BookingNotice {
        reservation_number: number.to_string(),
        customer_name: v.customer.name.clone(),
        customer_email: v.customer.email.clone(),
        plan_name,
        date: v.date_string(),
        start_time: v.start_time.clone(),
        end_time: v.end_time.clone(),
    };
    state.mailer.spawn(mailer::confirmation_mail(&notice));
    if let Some(admin) = state.mailer.admin_email() {
        state
            .mailer
            .spawn(mailer::admin_notification_mail(&notice, admin));
    }
}

const DETAIL_SELECT: &str = "SELECT r.reservation_number, r.status, r.plan_id,
        p.display_name AS plan_name, p.description AS plan_description, p.price AS plan_price,
        r.reservation_date AS date, r.start_time AS time, r.end_time,
        c.name AS customer_name, c.phone, c.email, r.notes, r.created_at
     FROM reservations r
     JOIN customers c ON c.id = r.customer_id
     JOIN plans p ON p.id = r.plan_id";

/// Looks a reservation up by number and the email it was booked with.
pub async fn check(db: &SqlitePool, number: &str, email: &str) -> ApiResult<ReservationDetail> {
    let sql = format!(
        "{} WHERE r.reservation_number = ? AND lower(c.email) = lower(?)",
        DETAIL_SELECT
    );
    sqlx::query_as::<_, ReservationDetail>(&sql)
        .bind(number)
        .bind(email)
        .fetch_optional(db)
        .await?
        .ok_or(ApiError::ReservationNotFound)
}

#[derive(sqlx::FromRow)]
struct CancelTarget {
    id: i64,
    status: String,
    reservation_date: String,
    start_time: String,
    end_time: String,
    customer_name: String,
    customer_email: String,
    plan_name: String,
}

/// Who asked for a cancellation; recorded in `admin_notes`.
#[derive(Debug, Clone)]
pub enum CancelledBy<'a> {
    Customer { email: &'a str },
    Admin { login_id: &'a str },
}

/// Cancels a confirmed, not-yet-past reservation and frees its slot.
pub async fn cancel(
    state: &AppState,
    number: &str,
    by: CancelledBy<'_>,
    reason: Option<&str>,
) -> ApiResult<()> {
    let mut tx = state.db.begin_with("BEGIN IMMEDIATE").await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT r.id, r.status, r.reservation_date, r.start_time, r.end_time,
            c.name AS customer_name, c.email AS customer_email, p.display_name AS plan_name
         FROM reservations r
         JOIN customers c ON c.id = r.customer_id
         JOIN plans p ON p.id = r.plan_id
         WHERE r.reservation_number = ",
    );
    qb.push_bind(number);
    if let CancelledBy::Customer { email } = &by {
        qb.push(" AND lower(c.email) = lower(").push_bind(*email).push(")");
    }
    let target = qb
        .build_query_as::<CancelTarget>()
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::ReservationNotFound)?;

    if target.status == "cancelled" {
        return Err(ApiError::AlreadyCancelled);
    }
    let day = NaiveDate::parse_from_str(&target.reservation_date, "%Y-%m-%d")
        .map_err(|e| ApiError::Server(format!("corrupt reservation date: {}", e)))?;
    if day < state.config.today() {
        return Err(ApiError::PastReservation);
    }

    let reason = reason
        .map(validation::sanitize)
        .filter(|r| !r.is_empty());
    let who = match &by {
        CancelledBy::Customer { .. } => "customer".to_string(),
        CancelledBy::Admin { login_id } => format!("admin {}", login_id),
    };
    let note = match &reason {
        Some(r) => format!("Cancelled by {}: {}", who, r),
        None => format!("Cancelled by {}", who),
    };

    sqlx::query(
        "UPDATE reservations SET
            status = 'cancelled',
            cancelled_at = datetime('now'),
            updated_at = datetime('now'),
            admin_notes = CASE
                WHEN admin_notes IS NULL OR admin_notes = '' THEN ?
                ELSE admin_notes || char(10) || ?
            END
         WHERE id = ?",
    )
    .bind(&note)
    .bind(&note)
    .bind(target.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    availability::invalidate(state);
    tracing::info!("reservation {} cancelled by {}", number, who);

    let notice = BookingNotice {
        reservation_number: number.to_string(),
        customer_name: target.customer_name,
        customer_email: target.customer_email,
        plan_name: target.plan_name,
        date: target.reservation_date,
        start_time: target.start_time,
        end_time: target.end_time,
    };
    state.mailer.spawn(mailer::cancellation_mail(&notice));
    Ok(())
}

// ── Admin listing ──

/// Filters shared by the paginated listing and the CSV export.
#[derive(Debug, Default, Clone)]
pub struct ReservationFilter {
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub customer_name: Option<String>,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl ReservationFilter {
    pub fn parse(
        status: Option<&str>,
        start_date: Option<&str>,
        end_date: Option<&str>,
        customer_name: Option<&str>,
    ) -> ApiResult<Self> {
        let status = match non_blank(status) {
            None | Some("all") => None,
            Some(s @ ("confirmed" | "cancelled")) => Some(s.to_string()),
            Some(_) => {
                return Err(ApiError::validation(
                    "status must be one of confirmed, cancelled, all",
                ))
            }
        };
        let date = |raw: Option<&str>| -> ApiResult<Option<String>> {
            non_blank(raw)
                .map(|d| validation::parse_date(d).map(|d| d.format("%Y-%m-%d").to_string()))
                .transpose()
        };
        Ok(Self {
            status,
            start_date: date(start_date)?,
            end_date: date(end_date)?,
            customer_name: non_blank(customer_name).map(str::to_string),
        })
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(status) = &self.status {
            qb.push(" AND r.status = ").push_bind(status.clone());
        }
        if let Some(start) = &self.start_date {
            qb.push(" AND r.reservation_date >= ").push_bind(start.clone());
        }
        if let Some(end) = &self.end_date {
            qb.push(" AND r.reservation_date <= ").push_bind(end.clone());
        }
        if let Some(name) = &self.customer_name {
            qb.push(" AND c.name LIKE '%' || ")
                .push_bind(name.clone())
                .push(" || '%'");
        }
    }
}

const ADMIN_SELECT: &str = "SELECT r.id, r.reservation_number, r.reservation_date, r.start_time,
        r.end_time, r.status, r.notes, r.admin_notes, r.created_at,
        c.name AS customer_name, c.email AS customer_email, c.phone AS customer_phone,
        p.display_name AS plan_name, p.price AS plan_price
     FROM reservations r
     JOIN customers c ON c.id = r.customer_id
     JOIN plans p ON p.id = r.plan_id";

const ADMIN_FROM: &str = " FROM reservations r
     JOIN customers c ON c.id = r.customer_id
     JOIN plans p ON p.id = r.plan_id";

/// Clamps page to ≥1 and limit to 1..=100.
pub fn page_bounds(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, limit)
}

pub async fn list_page(
    db: &SqlitePool,
    filter: &ReservationFilter,
    page: i64,
    limit: i64,
) -> ApiResult<ReservationPage> {
    let mut count = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*){}", ADMIN_FROM));
    filter.push_where(&mut count);
    let total: i64 = count.build_query_scalar().fetch_one(db).await?;

    let mut rows = QueryBuilder::<Sqlite>::new(ADMIN_SELECT);
    filter.push_where(&mut rows);
    rows.push(" ORDER BY r.reservation_date DESC, r.start_time DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind((page - 1) * limit);
    let reservations = rows
        .build_query_as::<AdminReservation>()
        .fetch_all(db)
        .await?;

    Ok(ReservationPage {
        reservations,
        total,
        page,
        total_pages: (total + limit - 1) / limit,
    })
}

/// Every matching reservation, oldest slot first (CSV export order).
pub async fn list_for_export(
    db: &SqlitePool,
    filter: &ReservationFilter,
) -> ApiResult<Vec<AdminReservation>> {
    let mut qb = QueryBuilder::<Sqlite>::new(ADMIN_SELECT);
    filter.push_where(&mut qb);
    qb.push(" ORDER BY r.reservation_date ASC, r.start_time ASC");
    Ok(qb.build_query_as::<AdminReservation>().fetch_all(db).await?)
}

// ── Dashboard ──

pub async fn dashboard(db: &SqlitePool, today: NaiveDate) -> ApiResult<Dashboard> {
    let today_s = today.format("%Y-%m-%d").to_string();
    let week_start = (today - Duration::days(6)).format("%Y-%m-%d").to_string();
    let month = format!("{:04}-{:02}", today.year(), today.month());

    let today_reservations = sqlx::query_as::<_, TodayReservation>(
        "SELECT r.reservation_number, r.start_time, r.end_time,
            c.name AS customer_name, c.phone AS customer_phone, p.display_name AS plan_name
         FROM reservations r
         JOIN customers c ON c.id = r.customer_id
         JOIN plans p ON p.id = r.plan_id
         WHERE r.reservation_date = ? AND r.status = 'confirmed'
         ORDER BY r.start_time",
    )
    .bind(&today_s)
    .fetch_all(db)
    .await?;

    let weekly_stats = sqlx::query_as::<_, WeeklyStats>(
        "SELECT COUNT(*) AS total_reservations,
            COALESCE(SUM(status = 'confirmed'), 0) AS confirmed_reservations,
            COALESCE(SUM(status = 'cancelled'), 0) AS cancelled_reservations
         FROM reservations
         WHERE reservation_date BETWEEN ? AND ?",
    )
    .bind(&week_start)
    .bind(&today_s)
    .fetch_one(db)
    .await?;

    let monthly_revenue = sqlx::query_as::<_, MonthlyRevenue>(
        "SELECT COALESCE(SUM(p.price), 0) AS total_revenue, COUNT(*) AS total_bookings
         FROM reservations r
         JOIN plans p ON p.id = r.plan_id
         WHERE r.status = 'confirmed' AND substr(r.reservation_date, 1, 7) = ?",
    )
    .bind(&month)
    .fetch_one(db)
    .await?;

    let recent_customers = sqlx::query_as::<_, RecentCustomer>(
        "SELECT c.id, c.name, c.email, c.phone, MAX(r.created_at) AS last_reservation
         FROM customers c
         JOIN reservations r ON r.customer_id = c.id
         WHERE r.status = 'confirmed'
         GROUP BY c.id
         ORDER BY last_reservation DESC, c.id DESC
         LIMIT ?",
    )
    .bind(RECENT_CUSTOMERS)
    .fetch_all(db)
    .await?;

    Ok(Dashboard {
        today_reservations,
        weekly_stats,
        monthly_revenue,
        recent_customers,
    })
}
