//! Notification rendering and webhook delivery
//!
//! [`render_notification`] turns a normalized message into the text body
//! that is pushed; [`DeliverySink`] is the seam the monitor delivers through,
//! implemented over HTTP by [`WebhookSink`].

use std::fmt::Write as _;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};

use crate::errors::{AppError, AppResult};
use crate::html::strip_html;
use crate::mime::NormalizedMessage;

/// Webhook request timeout; also bounds the fatal alert
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const SEPARATOR: &str = "----------------------------";
const ATTACHMENT_NOTICE: &str = "This message has attachments; open it in your mail client to view them.";
const TO_LABEL: &str = "To: ";

/// Destination for rendered notifications
pub trait DeliverySink: Send + Sync {
    /// Deliver one notification
    ///
    /// Returns `Ok(true)` only on explicit success. `Ok(false)` means the
    /// notification was not delivered but nothing failed (disabled sink or a
    /// non-success response).
    fn deliver(&self, title: &str, body: &str) -> impl Future<Output = AppResult<bool>> + Send;
}

/// [`DeliverySink`] posting `title`/`msg` form fields to a URL
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: Option<String>,
    http: reqwest::Client,
}

impl WebhookSink {
    /// Build a sink; `None` creates a sink that never delivers
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be constructed.
    pub fn new(url: Option<String>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("HTTP client error: {e}")))?;
        Ok(Self { url, http })
    }
}

impl DeliverySink for WebhookSink {
    async fn deliver(&self, title: &str, body: &str) -> AppResult<bool> {
        let Some(url) = self.url.as_deref() else {
            return Ok(false);
        };

        let response = self
            .http
            .post(url)
            .form(&[("title", title), ("msg", body)])
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = %status, "webhook answered with non-success status");
        }
        Ok(status.is_success())
    }
}

/// Body text for a message: plain text if present, else stripped HTML
pub fn message_body(message: &NormalizedMessage) -> String {
    match (&message.body_text, &message.body_html) {
        (Some(text), _) if !text.trim().is_empty() => text.clone(),
        (_, Some(html)) => strip_html(html),
        (Some(text), None) => text.clone(),
        (None, None) => String::new(),
    }
}

/// Receipt timestamp as shown in notifications (local time)
pub fn format_timestamp(date: &DateTime<FixedOffset>) -> String {
    date.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render the notification body for a normalized message
pub fn render_message(message: &NormalizedMessage) -> String {
    render_notification(
        &message_body(message),
        &format_timestamp(&message.date),
        message.from.first().map_or("", String::as_str),
        &message.to,
        message.has_attachments,
    )
}

/// Render body, attachment notice, separator, receipt time, sender and
/// recipients into one text blob
///
/// The first recipient is printed inline; the rest go on continuation lines
/// aligned under it.
pub fn render_notification(
    body: &str,
    received_at: &str,
    from: &str,
    to: &[String],
    has_attachments: bool,
) -> String {
    let mut out = String::with_capacity(body.len() + 128);
    out.push_str(body);
    if has_attachments {
        out.push_str("\n\n");
        out.push_str(ATTACHMENT_NOTICE);
    }
    out.push_str("\n\n");
    out.push_str(SEPARATOR);
    out.push('\n');
    let _ = writeln!(out, "Received: {received_at}");
    let _ = writeln!(out, "From: {from}");

    if let Some((first, rest)) = to.split_first() {
        let _ = writeln!(out, "{TO_LABEL}{first}");
        let indent = " ".repeat(TO_LABEL.len());
        for recipient in rest {
            let _ = writeln!(out, "{indent}{recipient}");
        }
    }
    out
}

/// Title and body of the alert sent when an account gives up
pub fn render_alert(account: &str, attempts: u32, last_error: &str) -> (String, String) {
    (
        format!("Mail relay needs attention: {account}"),
        format!(
            "Account [{account}] reached the maximum of {attempts} connection attempts and the relay has stopped.\nLast error: {last_error}"
        ),
    )
}
