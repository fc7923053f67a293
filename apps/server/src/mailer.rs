use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::MailConfig;
use crate::validation::mask_email;

/// Delivery attempts per message before it is parked in `email_queue`.
const MAX_ATTEMPTS: u32 = 3;
/// First retry delay; doubles on every further attempt.
const RETRY_BASE: Duration = Duration::from_secs(2);
/// Total attempts (inline + queued) after which a queued message is given up.
const MAX_QUEUE_ATTEMPTS: i64 = 6;
/// Queued messages processed per retry sweep.
const QUEUE_BATCH: i64 = 20;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail API returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Facts about a reservation that the notification templates need.
#[derive(Debug, Clone)]
pub struct BookingNotice {
    pub reservation_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub plan_name: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
}

/// Transactional email over an HTTP mail API (Resend-compatible).
///
/// Sending is best-effort: failures are retried with exponential backoff and
/// finally persisted to `email_queue` for the background retry sweep.
#[derive(Debug, Clone)]
pub struct Mailer {
    client: reqwest::Client,
    config: MailConfig,
    db: SqlitePool,
    retry_base: Duration,
}

impl Mailer {
    pub fn new(config: MailConfig, db: SqlitePool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            db,
            retry_base: RETRY_BASE,
        }
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    pub fn admin_email(&self) -> Option<&str> {
        self.config.admin_email.as_deref()
    }

    async fn send_once(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "from": self.config.from,
                "to": [mail.to],
                "subject": mail.subject,
                "html": mail.html,
                "text": mail.text,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Api { status, body });
        }
        Ok(())
    }

    /// Up to `MAX_ATTEMPTS` sends, sleeping `retry_base * 2^n` between them.
    pub async fn send_with_retry(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let mut attempt = 1;
        loop {
            match self.send_once(mail).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= MAX_ATTEMPTS => return Err(e),
                Err(e) => {
                    let delay = self.retry_base * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        "mail to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        mask_email(&mail.to),
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Sends `mail`, queueing it for later when every attempt fails.
    pub async fn deliver(&self, mail: OutgoingMail) {
        if !self.enabled() {
            tracing::info!(
                "mail disabled, skipping '{}' to {}",
                mail.subject,
                mask_email(&mail.to)
            );
            return;
        }

        match self.send_with_retry(&mail).await {
            Ok(()) => tracing::info!("sent '{}' to {}", mail.subject, mask_email(&mail.to)),
            Err(e) => {
                tracing::error!(
                    "giving up on '{}' to {}: {}",
                    mail.subject,
                    mask_email(&mail.to),
                    e
                );
                if let Err(qe) = self.enqueue(&mail, &e.to_string()).await {
                    tracing::error!("failed to queue mail for retry: {}", qe);
                }
            }
        }
    }

    /// Fire-and-forget [`deliver`](Self::deliver) on a background task.
    pub fn spawn(&self, mail: OutgoingMail) {
        let mailer = self.clone();
        tokio::spawn(async move {
            mailer.deliver(mail).await;
        });
    }

    async fn enqueue(&self, mail: &OutgoingMail, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO email_queue (to_email, subject, html_content, text_content, attempts, last_error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&mail.to)
        .bind(&mail.subject)
        .bind(&mail.html)
        .bind(&mail.text)
        .bind(MAX_ATTEMPTS as i64)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// One pass over pending queued mail. Returns how many were sent.
    pub async fn retry_queued(&self) -> Result<usize, sqlx::Error> {
        if !self.enabled() {
            return Ok(0);
        }

        let rows: Vec<(i64, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, to_email, subject, html_content, text_content, attempts
             FROM email_queue
             WHERE status = 'pending' AND attempts < ?
             ORDER BY id LIMIT ?",
        )
        .bind(MAX_QUEUE_ATTEMPTS)
        .bind(QUEUE_BATCH)
        .fetch_all(&self.db)
        .await?;

        let mut sent = 0;
        for (id, to, subject, html, text, attempts) in rows {
            let mail = OutgoingMail {
                to,
                subject,
                html,
                text,
            };
            match self.send_once(&mail).await {
                Ok(()) => {
                    sqlx::query(
                        "UPDATE email_queue SET status = 'sent', attempts = attempts + 1,
                         updated_at = datetime('now') WHERE id = ?",
                    )
                    .bind(id)
                    .execute(&self.db)
                    .await?;
                    sent += 1;
                }
                Err(e) => {
                    let status = if attempts + 1 >= MAX_QUEUE_ATTEMPTS {
                        "failed"
                    } else {
                        "pending"
                    };
                    sqlx::query(
                        "UPDATE email_queue SET attempts = attempts + 1, last_error = ?, status = ?,
                         updated_at = datetime('now') WHERE id = ?",
                    )
                    .bind(e.to_string())
                    .bind(status)
                    .bind(id)
                    .execute(&self.db)
                    .await?;
                }
            }
        }
        Ok(sent)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn details_text(n: &BookingNotice) -> String {
    format!(
        "Reservation number: {}\nPlan: {}\nDate: {}\nTime: {} - {}\n",
        n.reservation_number, n.plan_name, n.date, n.start_time, n.end_time
    )
}

fn details_html(n: &BookingNotice) -> String {
    format!(
        "<table>\
         <tr><th>Reservation number</th><td>{}</td></tr>\
         <tr><th>Plan</th><td>{}</td></tr>\
         <tr><th>Date</th><td>{}</td></tr>\
         <tr><th>Time</th><td>{} - {}</td></tr>\
         </table>",
        escape_html(&n.reservation_number),
        escape_html(&n.plan_name),
        escape_html(&n.date),
        escape_html(&n.start_time),
        escape_html(&n.end_time)
    )
}

pub fn confirmation_mail(n: &BookingNotice) -> OutgoingMail {
    OutgoingMail {
        to: n.customer_email.clone(),
        subject: format!("Your reservation is confirmed ({})", n.reservation_number),
        html: format!(
            "<p>Dear {},</p><p>Thank you for your reservation.</p>{}\
             <p>To check or cancel, use your reservation number and this email address.</p>",
            escape_html(&n.customer_name),
            details_html(n)
        ),
        text: format!(
            "Dear {},\n\nThank you for your reservation.\n\n{}\nTo check or cancel, use your reservation number and this email address.\n",
            n.customer_name,
            details_text(n)
        ),
    }
}

pub fn admin_notification_mail(n: &BookingNotice, admin_email: &str) -> OutgoingMail {
    OutgoingMail {
        to: admin_email.to_string(),
        subject: format!("New reservation {} on {} {}", n.reservation_number, n.date, n.start_time),
        html: format!(
            "<p>A new reservation was made by {} ({}).</p>{}",
            escape_html(&n.customer_name),
            escape_html(&n.customer_email),
            details_html(n)
        ),
        text: format!(
            "A new reservation was made by {} ({}).\n\n{}",
            n.customer_name,
            n.customer_email,
            details_text(n)
        ),
    }
}

pub fn cancellation_mail(n: &BookingNotice) -> OutgoingMail {
    OutgoingMail {
        to: n.customer_email.clone(),
        subject: format!("Your reservation has been cancelled ({})", n.reservation_number),
        html: format!(
            "<p>Dear {},</p><p>The following reservation has been cancelled.</p>{}",
            escape_html(&n.customer_name),
            details_html(n)
        ),
        text: format!(
            "Dear {},\n\nThe following reservation has been cancelled.\n\n{}",
            n.customer_name,
            details_text(n)
        ),
    }
}
