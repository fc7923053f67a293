use chrono::NaiveDate;
use csv::{QuoteStyle, WriterBuilder};

use crate::models::AdminReservation;

/// Lets spreadsheet apps detect UTF-8 (customer names are often non-ASCII).
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub const HEADERS: [&str; 13] = [
    "Reservation number",
    "Date",
    "Start time",
    "End time",
    "Status",
    "Plan",
    "Price",
    "Customer name",
    "Phone",
    "Email",
    "Customer notes",
    "Admin notes",
    "Created at",
];

pub fn status_label(status: &str) -> &str {
    match status {
        "confirmed" => "Confirmed",
        "cancelled" => "Cancelled",
        other => other,
    }
}

pub fn filename(today: NaiveDate) -> String {
    format!("reservations_{}.csv", today.format("%Y%m%d"))
}

/// Renders reservations as CSV: BOM, header row, every field quoted.
pub fn render(rows: &[AdminReservation]) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(UTF8_BOM.to_vec());

    wtr.write_record(HEADERS)?;
    for r in rows {
        let price = r.plan_price.map(|p| p.to_string()).unwrap_or_default();
        wtr.write_record([
            r.reservation_number.as_str(),
            r.reservation_date.as_str(),
            r.start_time.as_str(),
            r.end_time.as_str(),
            status_label(&r.status),
            r.plan_name.as_str(),
            price.as_str(),
            r.customer_name.as_str(),
            r.customer_phone.as_str(),
            r.customer_email.as_str(),
            r.notes.as_deref().unwrap_or(""),
            r.admin_notes.as_deref().unwrap_or(""),
            r.created_at.as_str(),
        ])?;
    }

    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}
