//! Domain records and transient pipeline types
//!
//! Persisted records (`Mailbox`, `MessageRecord`, `AttachmentRecord`) map to
//! datastore rows. Transient types (`FetchedMessage`, `FetchResult`,
//! `SyncContext`) only live for one sync invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use mailparse::MailParseError;
use serde::{Deserialize, Serialize};

use crate::config::AccountConfig;

/// Metadata included in all command outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Command execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard output envelope for CLI commands
#[derive(Debug, Clone, Serialize)]
pub struct RunEnvelope<T> {
    /// Human-readable summary of the outcome
    pub summary: String,
    /// Command-specific payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// A synchronized remote mailbox
///
/// `last_seen_uid` is the watermark: the highest UID confirmed synchronized.
/// It never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    pub account_id: String,
    /// Server-side mailbox name (e.g. `INBOX`)
    pub name: String,
    pub last_seen_uid: u32,
}

/// Role a participant plays on a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    From,
    Sender,
    ReplyTo,
    To,
    Cc,
    Bcc,
}

impl ParticipantRole {
    /// Header carrying this role's addresses
    pub fn header_name(self) -> &'static str {
        match self {
            Self::From => "From",
            Self::Sender => "Sender",
            Self::ReplyTo => "Reply-To",
            Self::To => "To",
            Self::Cc => "Cc",
            Self::Bcc => "Bcc",
        }
    }

    pub const ALL: [Self; 6] = [
        Self::From,
        Self::Sender,
        Self::ReplyTo,
        Self::To,
        Self::Cc,
        Self::Bcc,
    ];
}

/// Address/role pair associated with a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub role: ParticipantRole,
    pub address: String,
    /// Display name, if the header carried one
    pub name: Option<String>,
}

/// Attachment found in a fetched message's raw source
///
/// Holds the undecoded MIME part so decoding can fail per attachment.
#[derive(Debug, Clone)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    /// Raw bytes of the MIME part, headers included
    pub part: Vec<u8>,
}

impl AttachmentDescriptor {
    /// Decode the part body according to its transfer encoding
    pub fn decode(&self) -> Result<Vec<u8>, MailParseError> {
        mailparse::parse_mail(&self.part)?.get_body_raw()
    }
}

/// One entry of a fetch result: a server message in structured form
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Protocol-level Message-ID (may repeat across mailboxes)
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the server reports the message as `\Seen`
    pub read: bool,
    pub flags: Vec<String>,
    pub text_part: Option<String>,
    pub html_part: Option<String>,
    pub sanitized_html: Option<String>,
    pub raw: Vec<u8>,
    pub participants: Vec<Participant>,
    pub attachments: Vec<AttachmentDescriptor>,
}

/// Server results for one range fetch, keyed by UID
pub type FetchResult = BTreeMap<u32, FetchedMessage>;

/// Fields of a message record, as handed to the datastore for creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub mailbox_id: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub read: bool,
    pub flags: Vec<String>,
    pub text_part: Option<String>,
    pub html_part: Option<String>,
    pub sanitized_html: Option<String>,
    pub raw: Vec<u8>,
    pub participants: Vec<Participant>,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub message: NewMessage,
}

/// Fields of an attachment record, as handed to the datastore for creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    /// Id of the owning [`MessageRecord`]
    pub message_record_id: String,
    pub filename: String,
    pub location: PathBuf,
}

/// A stored attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: String,
    pub attachment: NewAttachment,
}

/// Explicit per-invocation context threaded through every pipeline stage
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub mailbox: Mailbox,
    pub account: AccountConfig,
    /// Owning user; scopes attachment storage and event delivery
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::{AttachmentDescriptor, Participant, ParticipantRole};

    #[test]
    fn participants_serialize_with_snake_case_roles() {
        let participants = vec![Participant {
            role: ParticipantRole::ReplyTo,
            address: "a@example.com".to_owned(),
            name: None,
        }];

        let json = serde_json::to_value(&participants).expect("serializes");
        assert_eq!(json[0]["role"], "reply_to");
        assert!(json[0]["name"].is_null());

        let back: Vec<Participant> = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, participants);
    }

    #[test]
    fn attachment_descriptor_decodes_base64_part() {
        let descriptor = AttachmentDescriptor {
            filename: "a.txt".to_owned(),
            content_type: "text/plain".to_owned(),
            part: b"Content-Type: text/plain\r\nContent-Transfer-Encoding: base64\r\n\r\naGVsbG8=\r\n"
                .to_vec(),
        };
        assert_eq!(descriptor.decode().expect("decodes"), b"hello");
    }
}
