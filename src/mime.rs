//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse` into a [`NormalizedMessage`]:
//! subject, sender and recipient lists, timestamp, first plain-text and HTML
//! bodies, and whether any part is an attachment.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::mailbox::RawMessage;

/// Normalized view of one fetched message
///
/// Lives for one fetch cycle and is dropped after its delivery attempt.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// IMAP UID, valid only within the connection it was fetched on
    pub uid: u32,
    /// Decoded Subject header (empty if absent)
    pub subject: String,
    /// From addresses in header order
    pub from: Vec<String>,
    /// To addresses in header order
    pub to: Vec<String>,
    /// Date header, falling back to INTERNALDATE
    pub date: DateTime<FixedOffset>,
    /// First non-attachment `text/plain` part
    pub body_text: Option<String>,
    /// First non-attachment `text/html` part
    pub body_html: Option<String>,
    /// Whether any part is an attachment
    pub has_attachments: bool,
}

/// Parse a raw message into a [`NormalizedMessage`]
///
/// # Errors
///
/// - `Parse` if `mailparse` cannot read the message structure
pub fn normalize(raw: &RawMessage) -> AppResult<NormalizedMessage> {
    let parsed = mailparse::parse_mail(&raw.body)
        .map_err(|e| AppError::Parse(format!("uid {}: failed to parse RFC822 message: {e}", raw.uid)))?;

    let mut body_text = None;
    let mut body_html = None;
    let mut has_attachments = false;
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut has_attachments);

    let headers = &parsed.headers;
    let date = headers
        .get_first_value("Date")
        .and_then(|value| parse_date(&value))
        .or(raw.internal_date)
        .unwrap_or_else(|| Utc::now().fixed_offset());

    Ok(NormalizedMessage {
        uid: raw.uid,
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: address_list(&parsed, "From"),
        to: address_list(&parsed, "To"),
        date,
        body_text,
        body_html,
        has_attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Keeps the first inline `text/plain` and `text/html` bodies and notes
/// whether any leaf is an attachment.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    has_attachments: &mut bool,
) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        if disp.disposition == DispositionType::Attachment || filename.is_some() {
            *has_attachments = true;
            return;
        }

        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }

        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html, has_attachments);
    }
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse an address header into display strings
///
/// Named mailboxes render as `Name (addr)` so downstream renderers that
/// strip angle-bracket markup keep the address. Unparseable headers are
/// returned verbatim.
fn address_list(parsed: &ParsedMail<'_>, key: &str) -> Vec<String> {
    let Some(header) = parsed.headers.get_first_header(key) else {
        return Vec::new();
    };
    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![format_address(
                    single.display_name.as_deref(),
                    &single.addr,
                )],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|single| format_address(single.display_name.as_deref(), &single.addr))
                    .collect(),
            })
            .collect(),
        Err(_) => {
            let value = header.get_value();
            let value = value.trim();
            if value.is_empty() {
                Vec::new()
            } else {
                vec![value.to_owned()]
            }
        }
    }
}

fn format_address(display_name: Option<&str>, addr: &str) -> String {
    match display_name.map(str::trim) {
        Some(name) if !name.is_empty() => format!("{name} ({addr})"),
        _ => addr.to_owned(),
    }
}

/// Parse an RFC 2822 date, keeping the sender's offset when possible
fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(value.trim()).ok().or_else(|| {
        mailparse::dateparse(value)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|utc| utc.fixed_offset())
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Datelike, Timelike};

    use super::{format_address, normalize, parse_date};
    use crate::mailbox::RawMessage;

    fn raw(body: &[u8]) -> RawMessage {
        RawMessage {
            uid: 7,
            seen: false,
            internal_date: None,
            body: body.to_vec(),
        }
    }

    #[test]
    fn normalizes_simple_plain_text_message() {
        let message = raw(b"From: Alice <alice@example.com>\r\nTo: bob@example.com, Carol <carol@example.com>\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 09:30:00 +0800\r\n\r\nHello there");
        let normalized = normalize(&message).expect("normalize should succeed");

        assert_eq!(normalized.uid, 7);
        assert_eq!(normalized.subject, "Hi");
        assert_eq!(normalized.from, vec!["Alice (alice@example.com)"]);
        assert_eq!(
            normalized.to,
            vec!["bob@example.com", "Carol (carol@example.com)"]
        );
        assert_eq!(normalized.body_text.as_deref(), Some("Hello there"));
        assert!(normalized.body_html.is_none());
        assert!(!normalized.has_attachments);
        assert_eq!(normalized.date.hour(), 9);
        assert_eq!(normalized.date.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn decodes_encoded_subject() {
        let message = raw(b"Subject: =?UTF-8?B?5L2g5aW9?=\r\n\r\nbody");
        let normalized = normalize(&message).expect("normalize should succeed");
        assert_eq!(normalized.subject, "\u{4f60}\u{597d}");
    }

    #[test]
    fn picks_html_part_and_flags_attachments() {
        let message = raw(concat!(
            "From: sender@example.com\r\n",
            "Subject: Report\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"XX\"\r\n",
            "\r\n",
            "--XX\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>See attached</p>\r\n",
            "--XX\r\n",
            "Content-Type: application/pdf; name=\"report.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQK\r\n",
            "--XX--\r\n",
        )
        .as_bytes());
        let normalized = normalize(&message).expect("normalize should succeed");

        assert!(normalized.body_text.is_none());
        assert_eq!(
            normalized.body_html.as_deref().map(str::trim),
            Some("<p>See attached</p>")
        );
        assert!(normalized.has_attachments);
    }

    #[test]
    fn falls_back_to_internal_date_without_date_header() {
        let mut message = raw(b"Subject: no date\r\n\r\nbody");
        let internal = DateTime::parse_from_rfc3339("2024-05-06T07:08:09+02:00").expect("valid");
        message.internal_date = Some(internal);
        let normalized = normalize(&message).expect("normalize should succeed");
        assert_eq!(normalized.date, internal);
    }

    #[test]
    fn parse_date_accepts_loose_formats() {
        let date = parse_date("1 Feb 2025 10:00:00 GMT").expect("date should parse");
        assert_eq!(date.year(), 2025);
        assert_eq!(date.month(), 2);
    }

    #[test]
    fn format_address_omits_blank_names() {
        assert_eq!(format_address(Some("  "), "a@example.com"), "a@example.com");
        assert_eq!(format_address(None, "a@example.com"), "a@example.com");
        assert_eq!(
            format_address(Some("Ann"), "a@example.com"),
            "Ann (a@example.com)"
        );
    }
}
