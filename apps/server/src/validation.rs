use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{ApiError, ApiResult};
use crate::models::{QuestionnaireInput, ReserveRequest};
use crate::slots;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\d\-()+\s]+$").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3]):[0-5]\d$").unwrap());

const MAX_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 255;
const MAX_PHONE_LEN: usize = 20;
const MIN_PHONE_DIGITS: usize = 10;
const MAX_NOTES_LEN: usize = 500;
const MAX_FIELD_LEN: usize = 1000;

/// Trim and drop angle brackets.
pub fn sanitize(s: &str) -> String {
    s.trim().chars().filter(|c| *c != '<' && *c != '>').collect()
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && EMAIL_RE.is_match(email)
}

pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    phone.len() <= MAX_PHONE_LEN && PHONE_RE.is_match(phone) && digits >= MIN_PHONE_DIGITS
}

/// Parse a strict `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> ApiResult<NaiveDate> {
    let raw = raw.trim();
    if !DATE_RE.is_match(raw) {
        return Err(ApiError::validation("Date must be in YYYY-MM-DD format"));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::validation("Date does not exist"))
}

/// Parse an `HH:MM` time and return it zero-padded.
pub fn parse_time(raw: &str) -> ApiResult<String> {
    let raw = raw.trim();
    if !TIME_RE.is_match(raw) {
        return Err(ApiError::validation("Time must be in HH:MM format"));
    }
    slots::normalize_time(raw).ok_or_else(|| ApiError::validation("Time must be in HH:MM format"))
}

/// Masks an email for logs: first three characters then `***`.
pub fn mask_email(email: &str) -> String {
    let head: String = email.chars().take(3).collect();
    format!("{}***", head)
}

fn required(value: Option<&str>, msg: &str) -> ApiResult<String> {
    match value.map(sanitize) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::validation(msg)),
    }
}

fn optional(value: Option<&str>, max: usize, field: &str) -> ApiResult<Option<String>> {
    let Some(v) = value.map(sanitize).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if v.chars().count() > max {
        return Err(ApiError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(Some(v))
}

#[derive(Debug, Clone)]
pub struct ValidCustomer {
    pub name: String,
    pub name_kana: Option<String>,
    pub gender: Option<String>,
    pub birthdate: Option<String>,
    pub address: Option<String>,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct ValidQuestionnaire {
    pub symptoms: String,
    pub medical_history: Option<String>,
    pub current_medication: Option<String>,
    pub allergies: Option<String>,
    pub pregnancy: Option<String>,
    pub other_notes: Option<String>,
}

/// A reservation submission that passed every format check.
#[derive(Debug, Clone)]
pub struct ValidReservation {
    pub plan_id: i64,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub customer: ValidCustomer,
    pub notes: Option<String>,
    pub questionnaire: Option<ValidQuestionnaire>,
}

impl ValidReservation {
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Validates a reservation submission without touching storage.
pub fn validate_reservation(req: &ReserveRequest) -> ApiResult<ValidReservation> {
    let c = &req.customer;

    let name = required(c.name.as_deref(), "Name is required")?;
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::validation("Name must be at most 100 characters"));
    }

    let email = required(c.email.as_deref(), "A valid email address is required")?;
    if !is_valid_email(&email) {
        return Err(ApiError::validation("A valid email address is required"));
    }

    let phone = required(c.phone.as_deref(), "A valid phone number is required")?;
    if !is_valid_phone(&phone) {
        return Err(ApiError::validation("A valid phone number is required"));
    }

    let birthdate = match c.birthdate.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            parse_date(raw)
                .map_err(|_| ApiError::validation("Birthdate must be in YYYY-MM-DD format"))?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        None => None,
    };

    let customer = ValidCustomer {
        name,
        name_kana: optional(c.name_kana.as_deref(), MAX_NAME_LEN, "Name reading")?,
        gender: optional(c.gender.as_deref(), 20, "Gender")?,
        birthdate,
        address: optional(c.address.as_deref(), MAX_FIELD_LEN, "Address")?,
        email,
        phone,
    };

    let (Some(plan_id), Some(raw_date), Some(raw_time)) = (
        req.plan_id,
        req.reservation_date.as_deref(),
        req.start_time.as_deref(),
    ) else {
        return Err(ApiError::validation("Plan, date and time are required"));
    };

    let date = parse_date(raw_date)?;
    let start_time = parse_time(raw_time)?;
    if !slots::is_grid_slot(&start_time) {
        return Err(ApiError::validation(format!(
            "Time must be an hourly slot between {:02}:00 and {:02}:00",
            slots::OPEN_HOUR,
            slots::CLOSE_HOUR - 1
        )));
    }
    let end_time = slots::slot_end(&start_time)
        .ok_or_else(|| ApiError::validation("Time must be in HH:MM format"))?;

    let notes = optional(req.notes.as_deref(), MAX_NOTES_LEN, "Notes")?;
    let questionnaire = req
        .questionnaire
        .as_ref()
        .map(validate_questionnaire)
        .transpose()?;

    Ok(ValidReservation {
        plan_id,
        date,
        start_time,
        end_time,
        customer,
        notes,
        questionnaire,
    })
}

fn validate_questionnaire(q: &QuestionnaireInput) -> ApiResult<ValidQuestionnaire> {
    Ok(ValidQuestionnaire {
        symptoms: required(
            q.symptoms.as_deref(),
            "Please describe your current symptoms or areas of concern",
        )?,
        medical_history: optional(q.medical_history.as_deref(), MAX_FIELD_LEN, "Medical history")?,
        current_medication: optional(
            q.current_medication.as_deref(),
            MAX_FIELD_LEN,
            "Current medication",
        )?,
        allergies: optional(q.allergies.as_deref(), MAX_FIELD_LEN, "Allergies")?,
        pregnancy: optional(q.pregnancy.as_deref(), 50, "Pregnancy")?,
        other_notes: optional(q.other_notes.as_deref(), MAX_FIELD_LEN, "Other notes")?,
    })
}

/// Validates the (reservation number, email) pair used by check and cancel.
pub fn validate_lookup(number: Option<&str>, email: Option<&str>) -> ApiResult<(String, String)> {
    let number = number
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::validation("Reservation number is required"))?;
    let email = email
        .map(str::trim)
        .filter(|e| !e.is_empty() && is_valid_email(e))
        .ok_or_else(|| ApiError::validation("A valid email address is required"))?;
    Ok((number.to_string(), email.to_string()))
}
