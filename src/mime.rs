//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts metadata, bodies,
//! participants and attachment parts. HTML is sanitized with `ammonia`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentDescriptor, Participant, ParticipantRole};

/// Parsed message content
///
/// Everything a fetched message carries besides UID, flags and raw bytes.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    /// Message-ID header without angle brackets
    pub message_id: Option<String>,
    /// Decoded Subject header
    pub subject: Option<String>,
    /// Date header as UTC timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// First non-attachment `text/plain` part
    pub text_part: Option<String>,
    /// First non-attachment `text/html` part, unsanitized
    pub html_part: Option<String>,
    /// Addresses from the originator and destination headers
    pub participants: Vec<Participant>,
    /// Attachment parts in document order
    pub attachments: Vec<AttachmentDescriptor>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Internal` if `mailparse` rejects the message
pub fn parse_message(raw: &[u8]) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = parsed.get_headers();
    let mut out = ParsedMessage {
        message_id: headers
            .get_first_value("Message-ID")
            .and_then(|v| normalize_message_id(&v)),
        subject: headers.get_first_value("Subject"),
        timestamp: headers
            .get_first_value("Date")
            .and_then(|v| parse_date(&v)),
        participants: parse_participants(&parsed),
        ..ParsedMessage::default()
    };

    walk_parts(&parsed, "1".to_owned(), &mut out);
    Ok(out)
}

/// Sanitize an HTML body for display
pub fn sanitize_html(html: &str) -> String {
    ammonia::clean(html)
}

/// Walk MIME part tree recursively
///
/// Leaf parts become either a body candidate or an attachment descriptor.
/// Attachment bodies are not decoded here.
fn walk_parts(part: &ParsedMail<'_>, part_id: String, out: &mut ParsedMessage) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            out.attachments.push(AttachmentDescriptor {
                filename: filename.unwrap_or_else(|| format!("part-{part_id}")),
                content_type: ctype,
                part: part.raw_bytes.to_vec(),
            });
            return;
        }

        if ctype == "text/plain" && out.text_part.is_none() {
            match part.get_body() {
                Ok(text) => out.text_part = Some(text),
                Err(e) => debug!(part_id, error = %e, "skipping undecodable text part"),
            }
        }

        if ctype == "text/html" && out.html_part.is_none() {
            match part.get_body() {
                Ok(html) => out.html_part = Some(html),
                Err(e) => debug!(part_id, error = %e, "skipping undecodable html part"),
            }
        }

        return;
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        walk_parts(sub, format!("{part_id}.{}", idx + 1), out);
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
        .filter(|name| !name.trim().is_empty())
}

/// Collect participants from every address header, groups flattened
///
/// Unparseable address headers are skipped.
fn parse_participants(parsed: &ParsedMail<'_>) -> Vec<Participant> {
    let headers = parsed.get_headers();
    let mut participants = Vec::new();
    for role in ParticipantRole::ALL {
        for header in headers.get_all_headers(role.header_name()) {
            let Ok(list) = mailparse::addrparse_header(header) else {
                debug!(header = role.header_name(), "skipping unparseable address header");
                continue;
            };
            for addr in list.into_inner() {
                let singles = match addr {
                    MailAddr::Single(info) => vec![info],
                    MailAddr::Group(group) => group.addrs,
                };
                participants.extend(singles.into_iter().map(|info| Participant {
                    role,
                    address: info.addr,
                    name: info.display_name,
                }));
            }
        }
    }
    participants
}

/// Parse an RFC 2822 date header into UTC
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    mailparse::dateparse(value)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Strip whitespace and surrounding angle brackets from a Message-ID
fn normalize_message_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim();
    (!inner.is_empty()).then(|| inner.to_owned())
}

#[cfg(test)]
mod tests {
    use super::{normalize_message_id, parse_message, sanitize_html};
    use crate::models::ParticipantRole;

    const MULTIPART: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com, Team: carol@example.com, dave@example.com;\r\n\
Cc: eve@example.com\r\n\
Subject: Quarterly report\r\n\
Message-ID: <q1-report@example.com>\r\n\
Date: Wed, 1 Jan 2025 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
See attached.\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p onclick=\"x()\">See <b>attached</b>.</p><script>alert(1)</script>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--outer\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment\r\n\
\r\n\
raw-bytes\r\n\
--outer--\r\n";

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_message(raw).expect("parse should succeed");

        assert_eq!(parsed.subject.as_deref(), Some("Hi"));
        assert_eq!(parsed.text_part.as_deref(), Some("Hello there"));
        assert_eq!(
            parsed.timestamp.map(|t| t.timestamp()),
            Some(1_735_689_600)
        );
        assert!(parsed.message_id.is_none());
        assert!(parsed.html_part.is_none());
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn extracts_bodies_participants_and_attachments_from_multipart() {
        let parsed = parse_message(MULTIPART).expect("parse should succeed");

        assert_eq!(parsed.message_id.as_deref(), Some("q1-report@example.com"));
        assert_eq!(parsed.text_part.as_deref().map(str::trim), Some("See attached."));
        assert!(parsed.html_part.as_deref().is_some_and(|h| h.contains("<script>")));

        let roles: Vec<(ParticipantRole, &str)> = parsed
            .participants
            .iter()
            .map(|p| (p.role, p.address.as_str()))
            .collect();
        assert_eq!(
            roles,
            vec![
                (ParticipantRole::From, "alice@example.com"),
                (ParticipantRole::To, "bob@example.com"),
                (ParticipantRole::To, "carol@example.com"),
                (ParticipantRole::To, "dave@example.com"),
                (ParticipantRole::Cc, "eve@example.com"),
            ]
        );
        assert_eq!(parsed.participants[0].name.as_deref(), Some("Alice"));

        assert_eq!(parsed.attachments.len(), 2);
        assert_eq!(parsed.attachments[0].filename, "report.pdf");
        assert_eq!(parsed.attachments[0].content_type, "application/pdf");
        assert_eq!(parsed.attachments[0].decode().expect("decodes"), b"%PDF-1.4");
        assert_eq!(parsed.attachments[1].filename, "part-1.3");
    }

    #[test]
    fn sanitizer_removes_scripts_and_handlers() {
        let clean = sanitize_html("<p onclick=\"x()\">hi</p><script>alert(1)</script>");
        assert_eq!(clean, "<p>hi</p>");
    }

    #[test]
    fn message_id_brackets_are_stripped() {
        assert_eq!(normalize_message_id(" <a@b> ").as_deref(), Some("a@b"));
        assert_eq!(normalize_message_id("a@b").as_deref(), Some("a@b"));
        assert_eq!(normalize_message_id("<>"), None);
    }
}
