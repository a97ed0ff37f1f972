//! Fetch client: range fetch of new messages from the mail server
//!
//! The [`FetchClient`] trait is the seam between the orchestrator and the
//! transport. [`ImapFetchClient`] issues `UID FETCH <n>:* (UID FLAGS RFC822)`
//! over a fresh authenticated session per invocation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::errors::{AppError, AppResult};
use crate::imap;
use crate::mime::{self, ParsedMessage};
use crate::models::{FetchResult, FetchedMessage, SyncContext};
use crate::watermark::UidRange;

/// Items requested for every message in range
const FETCH_QUERY: &str = "(UID FLAGS RFC822)";

/// Source of fetched messages for a mailbox
///
/// Implementations may return entries outside `range` (IMAP `n:*` always
/// includes the newest message); callers exclude them.
pub trait FetchClient {
    /// Fetch raw body and flags for every message in `range`
    ///
    /// # Errors
    ///
    /// Connection-class [`crate::errors::AppError`] on transport, auth or
    /// protocol failure. Nothing is returned partially.
    async fn fetch_range(&self, ctx: &SyncContext, range: &UidRange) -> AppResult<FetchResult>;
}

/// IMAP-backed fetch client
#[derive(Debug, Clone)]
pub struct ImapFetchClient {
    config: Arc<SyncConfig>,
}

impl ImapFetchClient {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }
}

impl FetchClient for ImapFetchClient {
    async fn fetch_range(&self, ctx: &SyncContext, range: &UidRange) -> AppResult<FetchResult> {
        let mut session = imap::connect_authenticated(&self.config, &ctx.account).await?;
        let uid_validity =
            imap::select_mailbox_readonly(&self.config, &mut session, &ctx.mailbox.name).await?;
        debug!(
            mailbox_id = %ctx.mailbox.id,
            uid_validity = ?uid_validity,
            sequence_set = %range.sequence_set(),
            "fetching new messages"
        );

        let fetches =
            imap::uid_fetch(&self.config, &mut session, &range.sequence_set(), FETCH_QUERY).await?;

        let result = collect_entries(
            &ctx.mailbox.id,
            range,
            fetches.iter().map(|fetch| FetchEntry {
                uid: fetch.uid,
                flags: imap::flags_to_strings(fetch),
                body: fetch.body(),
            }),
        );

        if let Err(e) = imap::logout(&self.config, &mut session).await {
            debug!(mailbox_id = %ctx.mailbox.id, error = %e, "logout failed");
        }
        result
    }
}

/// The parts of one `UID FETCH` response a fetch result is built from
struct FetchEntry<'a> {
    uid: Option<u32>,
    flags: Vec<String>,
    body: Option<&'a [u8]>,
}

/// Turn fetch responses into a fetch result
///
/// Responses without a UID are skipped. A response without a body is only
/// skipped when its UID is outside `range`; inside the range it would be a
/// message silently lost, so the whole fetch fails instead.
fn collect_entries<'a>(
    mailbox_id: &str,
    range: &UidRange,
    entries: impl IntoIterator<Item = FetchEntry<'a>>,
) -> AppResult<FetchResult> {
    let mut result = FetchResult::new();
    for entry in entries {
        let Some(uid) = entry.uid else {
            warn!(mailbox_id, "skipping fetch response without UID");
            continue;
        };
        let Some(raw) = entry.body else {
            if range.contains(uid) {
                return Err(AppError::Connection(format!(
                    "server returned no body for uid {uid} in mailbox '{mailbox_id}'"
                )));
            }
            warn!(mailbox_id, uid, "skipping out-of-range fetch response without body");
            continue;
        };
        result.insert(uid, build_fetched_message(uid, entry.flags, raw));
    }
    Ok(result)
}

/// Build the structured representation of one fetched message
///
/// A source `mailparse` rejects still yields an entry carrying UID, flags and
/// raw bytes, so the message is recorded as seen.
pub fn build_fetched_message(uid: u32, flags: Vec<String>, raw: &[u8]) -> FetchedMessage {
    let parsed = mime::parse_message(raw).unwrap_or_else(|e| {
        warn!(uid, error = %e, "storing unparseable message with raw source only");
        ParsedMessage::default()
    });
    let sanitized_html = parsed.html_part.as_deref().map(mime::sanitize_html);
    let read = flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"));

    FetchedMessage {
        uid,
        message_id: parsed.message_id,
        subject: parsed.subject,
        timestamp: parsed.timestamp,
        read,
        flags,
        text_part: parsed.text_part,
        html_part: parsed.html_part,
        sanitized_html,
        raw: raw.to_vec(),
        participants: parsed.participants,
        attachments: parsed.attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchEntry, build_fetched_message, collect_entries};
    use crate::errors::AppError;
    use crate::watermark::next_fetch_range;

    fn entry(uid: u32, body: Option<&[u8]>) -> FetchEntry<'_> {
        FetchEntry {
            uid: Some(uid),
            flags: vec!["\\Seen".to_owned()],
            body,
        }
    }

    #[test]
    fn in_range_response_without_body_fails_the_fetch() {
        let range = next_fetch_range(10);
        let body: &[u8] = b"Subject: s\r\n\r\nbody";
        let err = collect_entries("mb-1", &range, [entry(11, Some(body)), entry(12, None)])
            .expect_err("missing body must fail");
        assert!(err.is_connection_class());
        assert!(matches!(err, AppError::Connection(ref m) if m.contains("uid 12")));
    }

    #[test]
    fn out_of_range_response_without_body_is_skipped() {
        let range = next_fetch_range(10);
        let body: &[u8] = b"Subject: s\r\n\r\nbody";
        let nameless = FetchEntry {
            uid: None,
            flags: Vec::new(),
            body: Some(body),
        };
        let result = collect_entries(
            "mb-1",
            &range,
            [entry(10, None), nameless, entry(11, Some(body))],
        )
        .expect("boundary entry is not an error");
        assert_eq!(result.keys().copied().collect::<Vec<_>>(), vec![11]);
        assert!(result[&11].read);
    }

    #[test]
    fn read_follows_seen_flag() {
        let raw = b"Subject: s\r\n\r\nbody";
        let seen = build_fetched_message(3, vec!["\\Seen".to_owned()], raw);
        assert!(seen.read);
        assert_eq!(seen.uid, 3);
        assert_eq!(seen.raw, raw);

        let unseen = build_fetched_message(4, vec!["\\Flagged".to_owned()], raw);
        assert!(!unseen.read);
        assert_eq!(unseen.flags, vec!["\\Flagged".to_owned()]);
    }

    #[test]
    fn html_body_is_sanitized_alongside_original() {
        let raw = b"Content-Type: text/html\r\nSubject: h\r\n\r\n<b>hi</b><script>x</script>";
        let msg = build_fetched_message(1, vec![], raw);
        assert_eq!(msg.html_part.as_deref(), Some("<b>hi</b><script>x</script>"));
        assert_eq!(msg.sanitized_html.as_deref(), Some("<b>hi</b>"));
        assert!(msg.text_part.is_none());
    }
}
